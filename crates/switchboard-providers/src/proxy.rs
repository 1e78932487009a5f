// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Bundled-credential proxy routing and key obfuscation.
//!
//! The XOR/base64 scheme here is a scraper deterrent only — it is not
//! advertised as encryption, and real protection is server-side quota
//! enforcement (`spec.md` §6, §9).

use base64::Engine;
use serde::Serialize;
use subtle::ConstantTimeEq;

const OBFUSCATION_BYTE: u8 = 0x5A;
const BUNDLED_HOST: &str = "https://graysoft.dev";
const BUNDLED_PATH: &str = "/api/ai/proxy";

pub fn bundled_endpoint() -> String {
    format!("{BUNDLED_HOST}{BUNDLED_PATH}")
}

/// XOR every byte with `0x5A`, then base64-encode. Self-inverse at the byte
/// level, so `deobfuscate` is the same transform run in reverse order.
pub fn obfuscate(plain: &str) -> String {
    let xored: Vec<u8> = plain.bytes().map(|b| b ^ OBFUSCATION_BYTE).collect();
    base64::engine::general_purpose::STANDARD.encode(xored)
}

pub fn deobfuscate(encoded: &str) -> anyhow::Result<String> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(encoded)?;
    let plain: Vec<u8> = bytes.into_iter().map(|b| b ^ OBFUSCATION_BYTE).collect();
    Ok(String::from_utf8(plain)?)
}

/// Constant-time compare of two obfuscated key strings. Not a security
/// boundary (see module doc) but used anyway since `subtle` is already the
/// workspace's byte-compare tool and there is no reason to special-case
/// this one comparison as non-constant-time.
pub fn obfuscated_keys_equal(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[derive(Debug, Serialize)]
pub struct ProxyRequestBody {
    pub provider: String,
    pub model: String,
    pub messages: serde_json::Value,
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub stream: bool,
}

pub fn proxy_auth_header(session_token: &str) -> String {
    format!("Bearer {session_token}")
}

/// `spec.md` §6: proxy 429 with a `quota_exceeded` marker is terminal;
/// any other proxy failure falls through to direct keys.
pub fn is_quota_exceeded(status: u16, body: &str) -> bool {
    status == 429 && body.to_lowercase().contains("quota_exceeded")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obfuscate_deobfuscate_round_trips() {
        let plain = "sk-test-key-12345";
        let encoded = obfuscate(plain);
        assert_eq!(deobfuscate(&encoded).unwrap(), plain);
    }

    #[test]
    fn obfuscated_form_differs_from_plain() {
        let plain = "sk-test-key";
        assert_ne!(obfuscate(plain), plain);
    }

    #[test]
    fn double_obfuscate_round_trip_is_identical_value() {
        let plain = "key-a";
        let once = obfuscate(plain);
        let twice_decoded = deobfuscate(&once).unwrap();
        let re_encoded = obfuscate(&twice_decoded);
        assert_eq!(re_encoded, once);
    }

    #[test]
    fn bundled_endpoint_matches_spec_host_and_path() {
        assert_eq!(bundled_endpoint(), "https://graysoft.dev/api/ai/proxy");
    }

    #[test]
    fn quota_exceeded_requires_429_and_marker() {
        assert!(is_quota_exceeded(429, "error: quota_exceeded"));
        assert!(!is_quota_exceeded(429, "rate limited"));
        assert!(!is_quota_exceeded(500, "quota_exceeded"));
    }

    #[test]
    fn obfuscated_keys_equal_matches_identical_strings() {
        let a = obfuscate("same-key");
        let b = obfuscate("same-key");
        assert!(obfuscated_keys_equal(&a, &b));
    }

    #[test]
    fn obfuscated_keys_equal_rejects_different_strings() {
        let a = obfuscate("key-one");
        let b = obfuscate("key-two");
        assert!(!obfuscated_keys_equal(&a, &b));
    }

    #[test]
    fn deobfuscate_rejects_invalid_base64() {
        assert!(deobfuscate("not valid base64!!").is_err());
    }
}

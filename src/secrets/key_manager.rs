//! Remote key manager: digests go in, signatures come out. Keys never leave
//! the secret store's signing backend.

use crate::error::SigningError;
use crate::executor::{normalize_signature, Signer};
use crate::secrets::SecretStore;
use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use serde_json::Value;

const SIGN_PATH: &str = "ethereum/key-managers";

pub struct KeyManager {
    store: SecretStore,
    service_name: String,
}

impl KeyManager {
    pub fn new(store: SecretStore, service_name: &str) -> Self {
        Self {
            store,
            service_name: service_name.to_string(),
        }
    }
}

fn parse_signature_reply(reply: &Value) -> Result<Vec<u8>, SigningError> {
    let raw = reply
        .pointer("/data/signature")
        .and_then(|v| v.as_str())
        .ok_or(SigningError::MalformedSignature)?;
    hex::decode(raw.trim_start_matches("0x")).map_err(|_| SigningError::MalformedSignature)
}

#[async_trait]
impl Signer for KeyManager {
    async fn sign(&self, digest: B256, signer: Address) -> Result<Vec<u8>, SigningError> {
        let reply = self
            .store
            .post_json(
                &format!("{SIGN_PATH}/{}/sign", self.service_name),
                &serde_json::json!({
                    "hash": format!("{digest:#x}"),
                    "address": signer.to_checksum(None),
                }),
            )
            .await
            .map_err(|err| SigningError::Remote(err.to_string()))?;

        let signature = parse_signature_reply(&reply)?;
        normalize_signature(signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_signature_reply() {
        let sig_hex = "ab".repeat(64) + "01";
        let reply = json!({ "data": { "signature": sig_hex } });
        let parsed = parse_signature_reply(&reply).expect("parse");
        assert_eq!(parsed.len(), 65);
        assert_eq!(parsed[64], 0x01);

        let prefixed = json!({ "data": { "signature": format!("0x{}", "cd".repeat(65)) } });
        assert_eq!(parse_signature_reply(&prefixed).expect("parse").len(), 65);
    }

    #[test]
    fn test_parse_signature_reply_rejects_garbage() {
        assert!(matches!(
            parse_signature_reply(&json!({})),
            Err(SigningError::MalformedSignature)
        ));
        assert!(matches!(
            parse_signature_reply(&json!({ "data": { "signature": "zz" } })),
            Err(SigningError::MalformedSignature)
        ));
    }
}

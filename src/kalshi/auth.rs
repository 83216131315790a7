use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha2::{Digest, Sha256};

pub const WS_AUTH_PATH: &str = "/trade-api/ws/v2";

/// Signs exchange requests. Signing string is
/// `{timestamp_ms}{METHOD}{path}` with the path carrying its
/// `/trade-api/v2` prefix; the signature is PKCS#1 v1.5 over SHA-256,
/// base64-encoded.
///
/// The decrypted PEM only lives long enough to parse the key; callers drop
/// their plaintext copy immediately after construction.
pub struct RequestSigner {
    api_key_id: String,
    key: RsaPrivateKey,
}

impl RequestSigner {
    pub fn from_pem(api_key_id: &str, private_key_pem: &str) -> Result<Self> {
        let key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(private_key_pem))
            .context("Failed to parse RSA private key PEM")?;
        Ok(RequestSigner {
            api_key_id: api_key_id.to_string(),
            key,
        })
    }

    pub fn api_key_id(&self) -> &str {
        &self.api_key_id
    }

    /// PKCS#1 v1.5 is deterministic: the same timestamp and path always
    /// produce byte-identical headers.
    pub fn sign(&self, timestamp_ms: i64, method: &str, path: &str) -> Result<String> {
        let message = format!("{}{}{}", timestamp_ms, method, path);
        let digest = Sha256::digest(message.as_bytes());
        let signature = self
            .key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .context("RSA signing failed")?;
        Ok(BASE64.encode(signature))
    }

    /// The three auth headers for a REST call.
    pub fn headers(
        &self,
        timestamp_ms: i64,
        method: &str,
        path: &str,
    ) -> Result<Vec<(&'static str, String)>> {
        let signature = self.sign(timestamp_ms, method, path)?;
        Ok(vec![
            ("KALSHI-ACCESS-KEY", self.api_key_id.clone()),
            ("KALSHI-ACCESS-SIGNATURE", signature),
            ("KALSHI-ACCESS-TIMESTAMP", timestamp_ms.to_string()),
        ])
    }

    /// WebSocket auth reuses the REST scheme over `GET /trade-api/ws/v2`.
    pub fn ws_headers(&self, timestamp_ms: i64) -> Result<Vec<(&'static str, String)>> {
        self.headers(timestamp_ms, "GET", WS_AUTH_PATH)
    }
}

pub fn now_timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

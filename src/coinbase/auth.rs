// =============================================================================
// Stream token signing — short-lived CDP JWTs for WebSocket control frames
// =============================================================================
//
// Every subscribe / unsubscribe frame sent to the Advanced Trade WebSocket
// carries a freshly minted token. Tokens live for two minutes and are never
// cached across frames.
//
// SECURITY: the private key is never logged or serialized.
// =============================================================================

use anyhow::{Context, Result};
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Serialize;
use tracing::debug;

/// Lifetime of a stream token in seconds.
const TOKEN_TTL_SECS: i64 = 120;

/// Issuer expected by the Coinbase Developer Platform.
const ISSUER: &str = "cdp";

/// Produces the credential attached to outbound control frames.
pub trait TokenSigner: Send + Sync {
    /// Mint a new token, or `None` when frames should be sent unauthenticated.
    fn stream_token(&self) -> Result<Option<String>>;
}

/// Signer for public market data: never attaches a token.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousSigner;

impl TokenSigner for AnonymousSigner {
    fn stream_token(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

#[derive(Debug, Serialize)]
struct StreamClaims<'a> {
    iss: &'static str,
    sub: &'a str,
    nbf: i64,
    exp: i64,
    jti: String,
}

/// ES256 signer for a CDP API key (`organizations/.../apiKeys/...` plus a
/// PKCS#8 EC private key in PEM form).
pub struct CdpKeySigner {
    key_name: String,
    key: EncodingKey,
}

impl CdpKeySigner {
    /// Build a signer. Literal `\n` sequences in the PEM (common when the key
    /// comes from an environment variable) are expanded first.
    pub fn new(key_name: impl Into<String>, private_key_pem: &str) -> Result<Self> {
        let pem = private_key_pem.replace("\\n", "\n");
        let key = EncodingKey::from_ec_pem(pem.as_bytes())
            .context("failed to parse CDP private key (expected EC PEM)")?;
        let key_name = key_name.into();
        debug!(key_name = %key_name, "CDP stream signer initialised");
        Ok(Self { key_name, key })
    }
}

impl TokenSigner for CdpKeySigner {
    fn stream_token(&self) -> Result<Option<String>> {
        let now = Utc::now().timestamp();
        let claims = StreamClaims {
            iss: ISSUER,
            sub: &self.key_name,
            nbf: now,
            exp: now + TOKEN_TTL_SECS,
            jti: uuid::Uuid::new_v4().simple().to_string(),
        };
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.key_name.clone());

        let token = encode(&header, &claims, &self.key).context("failed to sign stream token")?;
        Ok(Some(token))
    }
}

impl std::fmt::Debug for CdpKeySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdpKeySigner")
            .field("key_name", &self.key_name)
            .field("key", &"<redacted>")
            .finish()
    }
}

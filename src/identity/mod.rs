// SPDX-License-Identifier: MIT
//! Handshake identity resolution.
//!
//! Every WebSocket connection presents a bearer credential at upgrade time.
//! An [`IdentityResolver`] turns that credential into `(user_id, display_name,
//! role_for_diagram)` or refuses the connection. The daemon captures the role
//! once per connection; mid-session revocations take effect on reconnect.

use async_trait::async_trait;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

/// Per-diagram role, fixed for the lifetime of a connection.
///
/// Ordering matters: `Reader < Writer < Owner`, so capability checks can use
/// comparisons instead of enumerating variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// May observe and resync, never mutate.
    Reader,
    /// May mutate cells and use undo/redo.
    Writer,
    /// Full access, including mutation.
    Owner,
}

impl Role {
    /// Whether this role may apply cell operations (and undo/redo).
    pub fn can_mutate(self) -> bool {
        self >= Role::Writer
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Reader => write!(f, "reader"),
            Role::Writer => write!(f, "writer"),
            Role::Owner => write!(f, "owner"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reader" => Ok(Role::Reader),
            "writer" => Ok(Role::Writer),
            "owner" => Ok(Role::Owner),
            _ => Err(()),
        }
    }
}

/// The resolved identity of one connection.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
    pub role: Role,
}

/// Why a presented credential was refused; the variant picks the close-frame
/// text and the log line. An absent credential never reaches a resolver —
/// the WebSocket layer refuses that upgrade with a plain HTTP 401.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
    #[error("credential expired")]
    Expired,
}

/// Maps a bearer credential to an identity, or refuses the connection.
///
/// `threat_model_id` is part of the seam because the role is scoped to the
/// threat model that owns the diagram; resolvers that encode the role in the
/// credential itself may ignore it.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, token: &str, threat_model_id: Uuid) -> Result<Identity, AuthError>;
}

// ─── HS256 JWT resolver ──────────────────────────────────────────────────────

/// Claims we read out of the JWT payload.
///
/// `role` applies to the diagram being joined; issuing a token per threat
/// model (or embedding the maximum role) is the token service's concern.
#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    name: Option<String>,
    role: String,
    #[serde(default)]
    exp: Option<i64>,
}

/// Verifies HS256-signed JWTs against a shared secret.
///
/// Deliberately minimal: one algorithm, one required claim set, no clock
/// skew allowance beyond `LEEWAY_SECONDS`. The platform's token service signs
/// these; anything it did not sign fails the MAC check in constant time.
pub struct JwtIdentityResolver {
    secret: Vec<u8>,
}

/// Accepted clock skew between token issuer and this host.
const LEEWAY_SECONDS: i64 = 30;

impl JwtIdentityResolver {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let mut parts = token.split('.');
        let (header_b64, payload_b64, sig_b64) = match (parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(p), Some(s)) if parts.next().is_none() => (h, p, s),
            _ => return Err(AuthError::InvalidCredential("not a JWT".into())),
        };

        let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let header: serde_json::Value = serde_json::from_slice(
            &b64.decode(header_b64)
                .map_err(|_| AuthError::InvalidCredential("bad header encoding".into()))?,
        )
        .map_err(|_| AuthError::InvalidCredential("bad header json".into()))?;

        if header.get("alg").and_then(|a| a.as_str()) != Some("HS256") {
            return Err(AuthError::InvalidCredential("unsupported algorithm".into()));
        }

        let signature = b64
            .decode(sig_b64)
            .map_err(|_| AuthError::InvalidCredential("bad signature encoding".into()))?;

        // Constant-time MAC comparison — hmac::Mac::verify_slice, not `==`.
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret)
            .map_err(|_| AuthError::InvalidCredential("bad key".into()))?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(payload_b64.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::InvalidCredential("signature mismatch".into()))?;

        let claims: Claims = serde_json::from_slice(
            &b64.decode(payload_b64)
                .map_err(|_| AuthError::InvalidCredential("bad payload encoding".into()))?,
        )
        .map_err(|e| AuthError::InvalidCredential(format!("bad claims: {e}")))?;

        if let Some(exp) = claims.exp {
            if chrono::Utc::now().timestamp() > exp + LEEWAY_SECONDS {
                return Err(AuthError::Expired);
            }
        }

        Ok(claims)
    }
}

#[async_trait]
impl IdentityResolver for JwtIdentityResolver {
    async fn resolve(&self, token: &str, _threat_model_id: Uuid) -> Result<Identity, AuthError> {
        let claims = self.verify(token)?;
        let role: Role = claims
            .role
            .parse()
            .map_err(|_| AuthError::InvalidCredential(format!("unknown role: {}", claims.role)))?;
        Ok(Identity {
            display_name: claims.name.unwrap_or_else(|| claims.sub.clone()),
            user_id: claims.sub,
            role,
        })
    }
}

// ─── Development resolver ────────────────────────────────────────────────────

/// Trusts a plain `user_id:display_name:role` bearer token.
///
/// Only constructed when `--insecure-identity` is passed explicitly; the
/// server logs a loud warning at startup. Exists for local development and
/// the integration test suite — never deploy with it.
pub struct InsecureIdentityResolver;

#[async_trait]
impl IdentityResolver for InsecureIdentityResolver {
    async fn resolve(&self, token: &str, _threat_model_id: Uuid) -> Result<Identity, AuthError> {
        let mut parts = token.splitn(3, ':');
        let (user, name, role) = match (parts.next(), parts.next(), parts.next()) {
            (Some(u), Some(n), Some(r)) if !u.is_empty() => (u, n, r),
            _ => {
                return Err(AuthError::InvalidCredential(
                    "expected user_id:display_name:role".into(),
                ))
            }
        };
        let role: Role = role
            .parse()
            .map_err(|_| AuthError::InvalidCredential(format!("unknown role: {role}")))?;
        Ok(Identity {
            user_id: user.to_string(),
            display_name: name.to_string(),
            role,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    fn sign_hs256(secret: &[u8], claims: &serde_json::Value) -> String {
        let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let header = b64.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = b64.encode(serde_json::to_vec(claims).unwrap());
        let mut mac = Hmac::<Sha256>::new_from_slice(secret).unwrap();
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        let sig = b64.encode(mac.finalize().into_bytes());
        format!("{header}.{payload}.{sig}")
    }

    #[tokio::test]
    async fn valid_token_resolves() {
        let resolver = JwtIdentityResolver::new(b"test-secret".to_vec());
        let token = sign_hs256(
            b"test-secret",
            &serde_json::json!({ "sub": "u1", "name": "Alice", "role": "owner" }),
        );
        let id = resolver.resolve(&token, Uuid::new_v4()).await.unwrap();
        assert_eq!(id.user_id, "u1");
        assert_eq!(id.display_name, "Alice");
        assert_eq!(id.role, Role::Owner);
    }

    #[tokio::test]
    async fn name_defaults_to_subject() {
        let resolver = JwtIdentityResolver::new(b"s".to_vec());
        let token = sign_hs256(b"s", &serde_json::json!({ "sub": "u2", "role": "reader" }));
        let id = resolver.resolve(&token, Uuid::new_v4()).await.unwrap();
        assert_eq!(id.display_name, "u2");
    }

    #[tokio::test]
    async fn wrong_secret_is_refused() {
        let resolver = JwtIdentityResolver::new(b"right".to_vec());
        let token = sign_hs256(b"wrong", &serde_json::json!({ "sub": "u", "role": "writer" }));
        assert!(resolver.resolve(&token, Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn expired_token_is_refused() {
        let resolver = JwtIdentityResolver::new(b"s".to_vec());
        let exp = chrono::Utc::now().timestamp() - 3600;
        let token = sign_hs256(
            b"s",
            &serde_json::json!({ "sub": "u", "role": "writer", "exp": exp }),
        );
        match resolver.resolve(&token, Uuid::new_v4()).await {
            Err(AuthError::Expired) => {}
            other => panic!("expected Expired, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tampered_payload_is_refused() {
        let resolver = JwtIdentityResolver::new(b"s".to_vec());
        let token = sign_hs256(b"s", &serde_json::json!({ "sub": "u", "role": "reader" }));
        let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let forged_payload = b64.encode(
            serde_json::to_vec(&serde_json::json!({ "sub": "u", "role": "owner" })).unwrap(),
        );
        let mut parts: Vec<&str> = token.split('.').collect();
        parts[1] = &forged_payload;
        let forged = parts.join(".");
        assert!(resolver.resolve(&forged, Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn unknown_role_is_refused() {
        let resolver = JwtIdentityResolver::new(b"s".to_vec());
        let token = sign_hs256(b"s", &serde_json::json!({ "sub": "u", "role": "superadmin" }));
        assert!(resolver.resolve(&token, Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn insecure_resolver_parses_triplet() {
        let id = InsecureIdentityResolver
            .resolve("u1:Alice:owner", Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(id.user_id, "u1");
        assert_eq!(id.role, Role::Owner);
        assert!(InsecureIdentityResolver
            .resolve("garbage", Uuid::new_v4())
            .await
            .is_err());
    }
}

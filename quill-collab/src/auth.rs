//! Auth Gate and Identity Verifier adapters.
//!
//! A connection is admitted only after its credential verifies; the result is
//! an immutable [`ConnectionContext`] that travels with every later call made
//! on behalf of that connection (load, save, join, leave).
//!
//! Credential source, in priority order:
//! 1. the payload of the `Auth` handshake frame, when non-empty;
//! 2. the `token` query parameter of the WebSocket upgrade URL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Verified user identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Per-connection context produced once at handshake.
///
/// Cloning shares the same value; there is no way to mutate it.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    inner: Arc<ContextInner>,
}

#[derive(PartialEq, Eq)]
struct ContextInner {
    identity: Identity,
    credential: String,
}

impl ConnectionContext {
    pub fn new(identity: Identity, credential: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                identity,
                credential: credential.into(),
            }),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn user_id(&self) -> &str {
        &self.inner.identity.user_id
    }

    /// The raw credential, forwarded to identity-scoped stores.
    pub fn credential(&self) -> &str {
        &self.inner.credential
    }
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("identity", &self.inner.identity)
            .field("credential", &"<redacted>")
            .finish()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("No credential supplied")]
    MissingCredential,
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),
    #[error("Credential expired")]
    Expired,
    #[error("Identity verifier unavailable: {0}")]
    Unavailable(String),
}

/// Validates a credential and returns the identity behind it.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<Identity, AuthError>;
}

/// JWT claims understood by [`JwtVerifier`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    /// Display name, defaults to `sub`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Expiry (seconds since epoch)
    pub exp: u64,
}

/// HS256 JWT verifier.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl IdentityVerifier for JwtVerifier {
    async fn verify(&self, credential: &str) -> Result<Identity, AuthError> {
        let data = decode::<Claims>(credential, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidCredential(e.to_string()),
            }
        })?;
        let claims = data.claims;
        let display_name = claims.name.unwrap_or_else(|| claims.sub.clone());
        Ok(Identity::new(claims.sub, display_name))
    }
}

/// Sign an HS256 token for `identity`, valid for `ttl`.
pub fn issue_token(secret: &[u8], identity: &Identity, ttl: Duration) -> Result<String, AuthError> {
    let exp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .saturating_add(ttl)
        .as_secs();
    let claims = Claims {
        sub: identity.user_id.clone(),
        name: Some(identity.display_name.clone()),
        exp,
    };
    encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret))
        .map_err(|e| AuthError::InvalidCredential(e.to_string()))
}

/// Fixed token table, for tests and local demos.
#[derive(Debug, Default, Clone)]
pub struct StaticVerifier {
    tokens: HashMap<String, Identity>,
}

impl StaticVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(
        mut self,
        token: impl Into<String>,
        user_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        self.tokens.insert(token.into(), Identity::new(user_id, display_name));
        self
    }
}

#[async_trait]
impl IdentityVerifier for StaticVerifier {
    async fn verify(&self, credential: &str) -> Result<Identity, AuthError> {
        self.tokens
            .get(credential)
            .cloned()
            .ok_or_else(|| AuthError::InvalidCredential("unknown token".into()))
    }
}

/// Pick the credential for a handshake.
pub fn select_credential(auth_payload: &[u8], query_token: Option<&str>) -> Option<String> {
    let from_frame = std::str::from_utf8(auth_payload).map(str::trim).unwrap_or("");
    if !from_frame.is_empty() {
        return Some(from_frame.to_string());
    }
    query_token
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// Extract the percent-decoded `token` parameter from a URL query string.
pub fn token_from_query(query: Option<&str>) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
}

/// Gate in front of every session operation.
#[derive(Clone)]
pub struct AuthGate {
    verifier: Arc<dyn IdentityVerifier>,
}

impl AuthGate {
    pub fn new(verifier: Arc<dyn IdentityVerifier>) -> Self {
        Self { verifier }
    }

    /// Verify `credential` and build the connection's context.
    pub async fn authenticate(&self, credential: Option<String>) -> Result<ConnectionContext, AuthError> {
        let credential = credential.ok_or(AuthError::MissingCredential)?;
        let identity = self.verifier.verify(&credential).await?;
        Ok(ConnectionContext::new(identity, credential))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret-with-enough-bytes-for-hs256";

    #[tokio::test]
    async fn test_jwt_roundtrip() {
        let identity = Identity::new("u-42", "Ada");
        let token = issue_token(SECRET, &identity, Duration::from_secs(600)).unwrap();

        let verified = JwtVerifier::new(SECRET).verify(&token).await.unwrap();
        assert_eq!(verified, identity);
    }

    #[tokio::test]
    async fn test_jwt_name_defaults_to_subject() {
        let exp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 600;
        let claims = Claims {
            sub: "u-7".into(),
            name: None,
            exp,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(SECRET)).unwrap();

        let verified = JwtVerifier::new(SECRET).verify(&token).await.unwrap();
        assert_eq!(verified.display_name, "u-7");
    }

    #[tokio::test]
    async fn test_jwt_wrong_secret_rejected() {
        let token = issue_token(SECRET, &Identity::new("u", "U"), Duration::from_secs(600)).unwrap();
        let result = JwtVerifier::new(b"another-secret-entirely-different").verify(&token).await;
        assert!(matches!(result, Err(AuthError::InvalidCredential(_))));
    }

    #[tokio::test]
    async fn test_jwt_expired_rejected() {
        let claims = Claims {
            sub: "u".into(),
            name: None,
            exp: 1_000,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(SECRET)).unwrap();
        let result = JwtVerifier::new(SECRET).verify(&token).await;
        assert_eq!(result, Err(AuthError::Expired));
    }

    #[tokio::test]
    async fn test_jwt_garbage_rejected() {
        let result = JwtVerifier::new(SECRET).verify("not.a.jwt").await;
        assert!(matches!(result, Err(AuthError::InvalidCredential(_))));
    }

    #[test]
    fn test_credential_priority() {
        assert_eq!(select_credential(b"frame", Some("query")), Some("frame".into()));
        assert_eq!(select_credential(b"", Some("query")), Some("query".into()));
        assert_eq!(select_credential(b"  ", Some("query")), Some("query".into()));
        assert_eq!(select_credential(b"", Some("")), None);
        assert_eq!(select_credential(b"", None), None);
    }

    #[test]
    fn test_token_from_query() {
        assert_eq!(token_from_query(Some("token=abc")), Some("abc".into()));
        assert_eq!(token_from_query(Some("doc=1&token=a%2Bb%3D")), Some("a+b=".into()));
        assert_eq!(token_from_query(Some("doc=1")), None);
        assert_eq!(token_from_query(None), None);
    }

    #[tokio::test]
    async fn test_gate_builds_context() {
        let verifier = StaticVerifier::new().with_token("t1", "u-1", "Alice");
        let gate = AuthGate::new(Arc::new(verifier));

        let ctx = gate.authenticate(Some("t1".into())).await.unwrap();
        assert_eq!(ctx.user_id(), "u-1");
        assert_eq!(ctx.identity().display_name, "Alice");
        assert_eq!(ctx.credential(), "t1");
        assert!(!format!("{ctx:?}").contains("t1"));
    }

    #[tokio::test]
    async fn test_gate_rejects_missing_and_unknown() {
        let gate = AuthGate::new(Arc::new(StaticVerifier::new().with_token("t1", "u-1", "Alice")));
        assert_eq!(gate.authenticate(None).await, Err(AuthError::MissingCredential));
        assert!(matches!(
            gate.authenticate(Some("nope".into())).await,
            Err(AuthError::InvalidCredential(_))
        ));
    }
}

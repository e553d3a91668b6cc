//! Handshake credential validation.

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;
use ucrelay_core::verify_token;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny(String),
}

/// External authentication collaborator consulted during the handshake.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn validate(&self, id: &str, credential: &str) -> AuthDecision;
}

/// Accepts everyone. Development only.
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn validate(&self, _id: &str, _credential: &str) -> AuthDecision {
        AuthDecision::Allow
    }
}

/// Fixed id to token table, usually from `[auth] tokens`.
pub struct StaticTokens {
    tokens: HashMap<String, String>,
}

impl StaticTokens {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl Authenticator for StaticTokens {
    async fn validate(&self, id: &str, credential: &str) -> AuthDecision {
        match self.tokens.get(id) {
            Some(expected) if expected == credential => AuthDecision::Allow,
            Some(_) => AuthDecision::Deny("invalid token".into()),
            None => AuthDecision::Deny(format!("unknown id: {id}")),
        }
    }
}

/// HMAC-signed expiring tokens minted with `ucrelay token`.
pub struct HmacTokens {
    secret: Vec<u8>,
}

impl HmacTokens {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }
}

#[async_trait]
impl Authenticator for HmacTokens {
    async fn validate(&self, id: &str, credential: &str) -> AuthDecision {
        match verify_token(&self.secret, id, credential) {
            Ok(()) => AuthDecision::Allow,
            Err(e) => {
                debug!(id = %id, error = %e, "token rejected");
                AuthDecision::Deny(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ucrelay_core::token::{create_token, create_token_until};

    #[tokio::test]
    async fn static_tokens() {
        let auth = StaticTokens::new(HashMap::from([("srv-a".to_string(), "s3cret".to_string())]));
        assert_eq!(auth.validate("srv-a", "s3cret").await, AuthDecision::Allow);
        assert_eq!(
            auth.validate("srv-a", "wrong").await,
            AuthDecision::Deny("invalid token".into())
        );
        assert!(matches!(auth.validate("srv-b", "s3cret").await, AuthDecision::Deny(_)));
    }

    #[tokio::test]
    async fn hmac_tokens_bind_id_and_expiry() {
        let secret = b"shared-secret".to_vec();
        let auth = HmacTokens::new(secret.clone());

        let token = create_token(&secret, "phone-1", 60);
        assert_eq!(auth.validate("phone-1", &token).await, AuthDecision::Allow);
        assert!(matches!(auth.validate("phone-2", &token).await, AuthDecision::Deny(_)));

        let expired = create_token_until(&secret, "phone-1", 1);
        assert_eq!(
            auth.validate("phone-1", &expired).await,
            AuthDecision::Deny("token expired".into())
        );
        assert!(matches!(auth.validate("phone-1", "zz").await, AuthDecision::Deny(_)));
    }

    #[tokio::test]
    async fn allow_all() {
        assert_eq!(AllowAll.validate("anyone", "").await, AuthDecision::Allow);
    }
}

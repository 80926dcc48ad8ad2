//! Token-based authentication.
//!
//! Tokens are validated against SHA-256 hashes stored in configuration, so
//! plaintext tokens never need to be kept on the engine side. The check is
//! wired in as a `BeforeConnect` hook.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use syncwire_core::{HookContext, HookError, HookPoint, HookRegistry};

/// Validates bearer tokens against pre-configured hashes.
#[derive(Debug, Clone)]
pub struct TokenValidator {
    valid_hashes: HashSet<String>,
}

impl TokenValidator {
    pub fn new(hashes: impl IntoIterator<Item = String>) -> Self {
        Self {
            valid_hashes: hashes
                .into_iter()
                .map(|h| h.trim().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn has_tokens(&self) -> bool {
        !self.valid_hashes.is_empty()
    }

    pub fn token_count(&self) -> usize {
        self.valid_hashes.len()
    }

    /// Returns the token's hash when it is one of the configured ones.
    pub fn check(&self, token: &str) -> Option<String> {
        let hash = Self::hash_token(token);
        self.valid_hashes.contains(&hash).then_some(hash)
    }

    pub fn validate(&self, token: &str) -> bool {
        self.check(token).is_some()
    }

    /// Hashes a token using SHA-256, returning a lowercase hex string.
    pub fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Identity recorded for an authenticated connection. Derived from the
    /// hash so the token itself never lands in connection metadata.
    pub fn identity_for(hash: &str) -> String {
        format!("token:{}", &hash[..hash.len().min(12)])
    }
}

/// Registers a `BeforeConnect` hook rejecting connections without a valid
/// credential.
pub fn install_token_auth(hooks: &HookRegistry, validator: Arc<TokenValidator>) {
    hooks.register(HookPoint::BeforeConnect, move |ctx: &mut HookContext| {
        let Some(credential) = ctx.credential() else {
            return Err(HookError::unauthorized("authentication required"));
        };
        let Some(hash) = validator.check(credential) else {
            tracing::debug!("Rejected credential for connection {}", ctx.connection_id());
            return Err(HookError::unauthorized("invalid token"));
        };

        let identity = TokenValidator::identity_for(&hash);
        ctx.connection.set_identity(identity.clone());
        ctx.extensions.identity = Some(identity);
        Ok(())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncwire_core::{Connection, DeliveryRoute};
    use syncwire_protocol::{ErrorCode, Message};
    use tokio_util::sync::CancellationToken;

    fn ctx(auth: Option<&str>) -> HookContext {
        let conn = Arc::new(Connection::new(
            "c1",
            auth.unwrap_or("c1"),
            DeliveryRoute::Broker,
            CancellationToken::new(),
        ));
        let mut msg = Message::ping("m1");
        msg.auth = auth.map(str::to_string);
        HookContext::new(msg, conn)
    }

    #[test]
    fn test_hash_token() {
        let hash = TokenValidator::hash_token("test-token");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, TokenValidator::hash_token("test-token"));
        assert_ne!(hash, TokenValidator::hash_token("other-token"));
    }

    #[test]
    fn test_validate() {
        let validator = TokenValidator::new(vec![
            TokenValidator::hash_token("token-one"),
            TokenValidator::hash_token("token-two"),
        ]);
        assert_eq!(validator.token_count(), 2);
        assert!(validator.validate("token-one"));
        assert!(validator.validate("token-two"));
        assert!(!validator.validate("token-three"));
        assert!(!validator.validate("TOKEN-ONE"));
    }

    #[test]
    fn test_uppercase_hash_accepted() {
        let hash = TokenValidator::hash_token("MyToken").to_uppercase();
        let validator = TokenValidator::new(vec![hash]);
        assert!(validator.validate("MyToken"));
    }

    #[test]
    fn test_no_tokens_configured() {
        let validator = TokenValidator::new(Vec::<String>::new());
        assert!(!validator.has_tokens());
        assert!(!validator.validate("any-token"));
    }

    #[test]
    fn test_hook_accepts_valid_token() {
        let hooks = HookRegistry::new();
        let validator = TokenValidator::new(vec![TokenValidator::hash_token("s3cret")]);
        install_token_auth(&hooks, Arc::new(validator));

        let mut ctx = ctx(Some("s3cret"));
        hooks.execute(HookPoint::BeforeConnect, &mut ctx).unwrap();

        let identity = ctx.extensions.identity.clone().unwrap();
        assert!(identity.starts_with("token:"));
        assert_eq!(ctx.connection.identity(), identity);
    }

    #[test]
    fn test_hook_rejects_missing_or_bad_token() {
        let hooks = HookRegistry::new();
        let validator = TokenValidator::new(vec![TokenValidator::hash_token("s3cret")]);
        install_token_auth(&hooks, Arc::new(validator));

        let err = hooks
            .execute(HookPoint::BeforeConnect, &mut ctx(None))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Unauthorized);

        let err = hooks
            .execute(HookPoint::BeforeConnect, &mut ctx(Some("guess")))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Unauthorized);
        assert_eq!(err.message, "invalid token");
    }
}

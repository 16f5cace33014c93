//! JWT token issuance and validation.

use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use olg_core::db::unix_timestamp;

use super::claims::Claims;
use super::principal::{AuthError, Principal};

/// Manages JWT token creation and validation.
#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_ttl_secs: i64,
}

impl JwtManager {
    /// Create a new `JwtManager` with the given secret.
    pub fn new(secret: &[u8], access_ttl_secs: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            access_ttl_secs,
        }
    }

    /// Issue an access token for the principal. Returns the token and its TTL.
    pub fn issue_access_token(&self, principal: &Principal) -> Result<(String, i64), AuthError> {
        let now = unix_timestamp();
        let claims = Claims {
            jti: uuid::Uuid::new_v4().to_string(),
            sub: principal.id.clone(),
            username: principal.username.clone(),
            iat: now,
            exp: now + self.access_ttl_secs,
            capabilities: principal
                .capabilities
                .iter()
                .map(|c| c.as_str().to_string())
                .collect(),
        };

        let token = jsonwebtoken::encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Issue(e.to_string()))?;
        Ok((token, self.access_ttl_secs))
    }

    /// Validate a token and return its claims.
    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        Ok(data.claims)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::auth::Capability;

    fn test_jwt() -> JwtManager {
        JwtManager::new(b"test-secret-key-for-testing", 3600)
    }

    fn admin() -> Principal {
        Principal::new("user-1", "alice", [Capability::FederationAdmin])
    }

    #[test]
    fn issue_and_validate_access_token() {
        let jwt = test_jwt();
        let (token, ttl) = jwt.issue_access_token(&admin()).unwrap();
        assert_eq!(ttl, 3600);

        let claims = jwt.validate(&token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.capabilities, vec!["federation:admin".to_string()]);
        assert_eq!(claims.principal(), admin());
    }

    #[test]
    fn invalid_token_fails_validation() {
        let jwt = test_jwt();
        assert!(matches!(
            jwt.validate("not-a-valid-token"),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn wrong_secret_fails_validation() {
        let jwt1 = test_jwt();
        let jwt2 = JwtManager::new(b"different-secret", 3600);

        let (token, _) = jwt1.issue_access_token(&admin()).unwrap();
        assert!(jwt2.validate(&token).is_err());
    }

    #[test]
    fn expired_token_fails_validation() {
        let jwt = JwtManager::new(b"test-secret-key-for-testing", -3600);
        let (token, _) = jwt.issue_access_token(&admin()).unwrap();
        assert!(jwt.validate(&token).is_err());
    }
}

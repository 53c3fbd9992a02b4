use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{models::UserId, Error, Result};

/// JWT claims structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User ID
    pub sub: String,
    /// Issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

impl Claims {
    #[must_use]
    pub fn user_id(&self) -> UserId {
        UserId::from_string(self.sub.clone())
    }
}

/// Turns a connection credential into a verified user identity
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<UserId>;
}

/// HS256 verifier for tokens minted by the external auth service
#[derive(Clone)]
pub struct JwtVerifier {
    encoding_key: Arc<EncodingKey>,
    decoding_key: Arc<DecodingKey>,
    issuer: Option<String>,
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl JwtVerifier {
    #[must_use]
    pub fn new(secret: &[u8], issuer: Option<String>) -> Self {
        Self {
            encoding_key: Arc::new(EncodingKey::from_secret(secret)),
            decoding_key: Arc::new(DecodingKey::from_secret(secret)),
            issuer,
        }
    }

    /// Sign a token for `user_id`, valid for `ttl`
    ///
    /// Production tokens come from the auth service; this exists for tooling
    /// and tests that need to mint a credential with the shared secret.
    pub fn sign(&self, user_id: &UserId, ttl: Duration) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.as_str().to_string(),
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("Failed to sign token: {e}")))
    }

    /// Verify a token and extract claims
    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.leeway = 60;
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }

        let token_data: TokenData<Claims> = decode(token, &self.decoding_key, &validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    Error::Authentication("Token expired".to_string())
                }
                jsonwebtoken::errors::ErrorKind::InvalidToken => {
                    Error::Authentication("Invalid token".to_string())
                }
                jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                    Error::Authentication("Invalid token signature".to_string())
                }
                jsonwebtoken::errors::ErrorKind::InvalidIssuer => {
                    Error::Authentication("Invalid token issuer".to_string())
                }
                _ => Error::Authentication(format!("Token verification failed: {e}")),
            })?;

        if token_data.claims.sub.is_empty() {
            return Err(Error::Authentication("Token has no subject".to_string()));
        }

        Ok(token_data.claims)
    }
}

impl IdentityVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<UserId> {
        self.verify_token(token).map(|claims| claims.user_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn test_sign_and_verify() {
        let verifier = JwtVerifier::new(SECRET, None);
        let user_id = UserId::from("u1");
        let token = verifier.sign(&user_id, Duration::minutes(5)).unwrap();

        assert_eq!(verifier.verify(&token).unwrap(), user_id);
    }

    #[test]
    fn test_expired_token_rejected() {
        let verifier = JwtVerifier::new(SECRET, None);
        let token = verifier
            .sign(&UserId::from("u1"), Duration::minutes(-10))
            .unwrap();

        let err = verifier.verify(&token).unwrap_err();
        assert!(matches!(err, Error::Authentication(ref m) if m == "Token expired"));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let signer = JwtVerifier::new(b"another-secret-another-secret-xx", None);
        let verifier = JwtVerifier::new(SECRET, None);
        let token = signer.sign(&UserId::from("u1"), Duration::minutes(5)).unwrap();

        assert!(matches!(
            verifier.verify(&token),
            Err(Error::Authentication(_))
        ));
    }

    #[test]
    fn test_issuer_enforced() {
        let signer = JwtVerifier::new(SECRET, Some("elsewhere".to_string()));
        let verifier = JwtVerifier::new(SECRET, Some("huddle-auth".to_string()));
        let token = signer.sign(&UserId::from("u1"), Duration::minutes(5)).unwrap();

        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        let verifier = JwtVerifier::new(SECRET, None);
        assert!(verifier.verify("not-a-jwt").is_err());
    }
}

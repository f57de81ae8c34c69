use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::hub::UserId;
use crate::shared::AppError;

/// Resolves a bearer token to the user it was issued for
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<UserId, AppError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Numeric user id, as a string
    pub sub: String,
    pub exp: usize,
    pub iat: usize,
}

/// HS256 JWT validation against a shared secret
#[derive(Clone)]
pub struct JwtAuthenticator {
    secret: String,
}

impl JwtAuthenticator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Creates a token for `user_id` valid for `ttl`
    #[instrument(skip(self))]
    pub fn issue_token(&self, user_id: UserId, ttl: Duration) -> Result<String, AppError> {
        let now = Utc::now();
        let claims = AccessClaims {
            sub: user_id.to_string(),
            exp: (now + ttl).timestamp() as usize,
            iat: now.timestamp() as usize,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_ref()),
        )
        .map_err(|e| {
            debug!(error = %e, "Failed to encode JWT token");
            AppError::JwtError(e.to_string())
        })
    }

    fn decode_claims(&self, token: &str) -> Result<AccessClaims, AppError> {
        decode::<AccessClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_ref()),
            &Validation::default(),
        )
        .map(|data| data.claims)
        .map_err(|e| {
            debug!(error = %e, "Failed to decode JWT token");
            AppError::Unauthorized(e.to_string())
        })
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    #[instrument(skip_all)]
    async fn authenticate(&self, token: &str) -> Result<UserId, AppError> {
        let claims = self.decode_claims(token)?;
        claims.sub.parse::<UserId>().map_err(|_| {
            debug!(sub = %claims.sub, "Token subject is not a user id");
            AppError::Unauthorized("Invalid token subject".to_string())
        })
    }
}

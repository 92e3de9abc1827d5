//! Video-call access tokens.
//!
//! Tokens are HS256 JWTs in the format expected by the `LiveKit` SFU: the API
//! key is the issuer, the participant identity the subject, and a `video`
//! grant scopes the token to one room.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use contrimeter_proto::call::{CallTokenRequest, CallTokenResponse};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

/// Default token lifetime.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Errors produced while minting a call token.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// `roomName` or `participantName` was missing.
    #[error("Missing required fields")]
    MissingFields,

    /// The server has no SFU credentials configured.
    #[error("Server configuration error")]
    NotConfigured,

    /// Signing failed.
    #[error("failed to sign token: {0}")]
    Sign(#[from] jsonwebtoken::errors::Error),
}

/// SFU credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallCredentials {
    /// API key (token issuer).
    pub api_key: String,
    /// API secret used as the HMAC key.
    pub api_secret: String,
    /// URL clients connect to.
    pub server_url: String,
}

/// Room permissions carried in the token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoGrant {
    /// May join the room.
    pub room_join: bool,
    /// Room the grant applies to.
    pub room: String,
    /// May publish tracks.
    pub can_publish: bool,
    /// May subscribe to tracks.
    pub can_subscribe: bool,
}

/// JWT claims of a call token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallClaims {
    /// Issuer: the API key.
    pub iss: String,
    /// Participant identity.
    pub sub: String,
    /// Display name.
    pub name: String,
    /// Not valid before (seconds since epoch).
    pub nbf: u64,
    /// Expiry (seconds since epoch).
    pub exp: u64,
    /// Room grant.
    pub video: VideoGrant,
}

/// Mints call tokens from configured credentials.
#[derive(Debug, Clone)]
pub struct TokenMinter {
    credentials: Option<CallCredentials>,
    ttl: Duration,
}

impl TokenMinter {
    /// Creates a minter. `None` credentials make every request fail with
    /// [`TokenError::NotConfigured`].
    #[must_use]
    pub const fn new(credentials: Option<CallCredentials>) -> Self {
        Self {
            credentials,
            ttl: DEFAULT_TOKEN_TTL,
        }
    }

    /// Overrides the token lifetime.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Mints a token valid from now.
    ///
    /// # Errors
    ///
    /// See [`TokenMinter::mint_at`].
    pub fn mint(&self, request: &CallTokenRequest) -> Result<CallTokenResponse, TokenError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.mint_at(request, now)
    }

    /// Mints a token valid from `now` (seconds since the epoch).
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::MissingFields`] for an incomplete request,
    /// [`TokenError::NotConfigured`] without credentials, or
    /// [`TokenError::Sign`] if encoding fails.
    pub fn mint_at(
        &self,
        request: &CallTokenRequest,
        now: u64,
    ) -> Result<CallTokenResponse, TokenError> {
        if !request.is_complete() {
            return Err(TokenError::MissingFields);
        }
        let creds = self.credentials.as_ref().ok_or(TokenError::NotConfigured)?;

        let claims = CallClaims {
            iss: creds.api_key.clone(),
            sub: request.identity().to_string(),
            name: request.participant_name.clone(),
            nbf: now,
            exp: now.saturating_add(self.ttl.as_secs()),
            video: VideoGrant {
                room_join: true,
                room: request.room_name.clone(),
                can_publish: true,
                can_subscribe: true,
            },
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(creds.api_secret.as_bytes()),
        )?;

        tracing::info!(
            room = %request.room_name,
            identity = %claims.sub,
            "call token minted"
        );

        Ok(CallTokenResponse {
            token,
            server_url: creds.server_url.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation};

    fn creds() -> CallCredentials {
        CallCredentials {
            api_key: "APIkey".into(),
            api_secret: "s3cret".into(),
            server_url: "wss://sfu.example".into(),
        }
    }

    fn request() -> CallTokenRequest {
        CallTokenRequest {
            room_name: "team-AB3XQ9".into(),
            participant_name: "Bob".into(),
            user_id: "uid-bob".into(),
            team_id: "AB3XQ9".into(),
        }
    }

    #[test]
    fn token_carries_room_grant() {
        let minter = TokenMinter::new(Some(creds()));
        let resp = minter.mint(&request()).unwrap();
        assert_eq!(resp.server_url, "wss://sfu.example");

        let decoded = jsonwebtoken::decode::<CallClaims>(
            &resp.token,
            &DecodingKey::from_secret(b"s3cret"),
            &Validation::new(Algorithm::HS256),
        )
        .unwrap();
        let claims = decoded.claims;
        assert_eq!(claims.iss, "APIkey");
        assert_eq!(claims.sub, "uid-bob");
        assert_eq!(claims.name, "Bob");
        assert_eq!(claims.exp - claims.nbf, 2 * 60 * 60);
        assert!(claims.video.room_join);
        assert_eq!(claims.video.room, "team-AB3XQ9");
    }

    #[test]
    fn missing_fields_checked_before_configuration() {
        let minter = TokenMinter::new(None);
        let incomplete = CallTokenRequest {
            participant_name: String::new(),
            ..request()
        };
        assert!(matches!(
            minter.mint_at(&incomplete, 0),
            Err(TokenError::MissingFields)
        ));
        assert!(matches!(
            minter.mint_at(&request(), 0),
            Err(TokenError::NotConfigured)
        ));
    }

    #[test]
    fn ttl_is_configurable() {
        let minter = TokenMinter::new(Some(creds())).with_ttl(Duration::from_secs(60));
        let resp = minter.mint_at(&request(), 1_000).unwrap();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        let claims = jsonwebtoken::decode::<CallClaims>(
            &resp.token,
            &DecodingKey::from_secret(b"s3cret"),
            &validation,
        )
        .unwrap()
        .claims;
        assert_eq!(claims.nbf, 1_000);
        assert_eq!(claims.exp, 1_060);
    }

    #[test]
    fn error_messages_match_http_contract() {
        assert_eq!(TokenError::MissingFields.to_string(), "Missing required fields");
        assert_eq!(
            TokenError::NotConfigured.to_string(),
            "Server configuration error"
        );
    }
}

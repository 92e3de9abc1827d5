//! Team video calls.
//!
//! Each team has one call room. Joining it needs a short-lived access
//! token minted by the store server; the SFU connection itself is out of
//! this crate's hands.

use std::future::Future;

use contrimeter_proto::call::{CallTokenRequest, CallTokenResponse};
use contrimeter_proto::model::{TeamCode, UserId};
use contrimeter_proto::store::StoreFailure;
use contrimeter_store::token::TokenError;
use thiserror::Error;

use crate::store::{EmbeddedStore, RemoteStore, StoreError};

pub use contrimeter_proto::call::room_name;

/// Errors that can occur while fetching a call token.
#[derive(Debug, Error)]
pub enum CallError {
    /// Room or participant name was missing.
    #[error("missing room or participant name")]
    MissingFields,
    /// Calls are not configured on the server.
    #[error("calls are unavailable: {0}")]
    Unavailable(String),
    /// The store connection failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<TokenError> for CallError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::MissingFields => Self::MissingFields,
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// Something that can mint call tokens.
pub trait CallTokenSource: Send + Sync {
    /// Requests a token for `request`.
    fn call_token(
        &self,
        request: CallTokenRequest,
    ) -> impl Future<Output = Result<CallTokenResponse, CallError>> + Send;
}

impl CallTokenSource for RemoteStore {
    async fn call_token(&self, request: CallTokenRequest) -> Result<CallTokenResponse, CallError> {
        match Self::call_token(self, request).await {
            Ok(response) => Ok(response),
            Err(StoreError::Rejected(StoreFailure::Invalid(_))) => Err(CallError::MissingFields),
            Err(StoreError::Rejected(StoreFailure::Unavailable(reason))) => {
                Err(CallError::Unavailable(reason))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl CallTokenSource for EmbeddedStore {
    async fn call_token(&self, request: CallTokenRequest) -> Result<CallTokenResponse, CallError> {
        let minter = self
            .minter()
            .ok_or_else(|| CallError::Unavailable("no token minter attached".to_string()))?;
        Ok(minter.mint(&request)?)
    }
}

/// Fetches a token for my team's call room.
///
/// # Errors
///
/// Returns [`CallError`] if the source refuses or fails.
pub async fn join_call<C: CallTokenSource>(
    source: &C,
    team: &TeamCode,
    me: &UserId,
    my_name: &str,
) -> Result<CallTokenResponse, CallError> {
    let request = CallTokenRequest {
        room_name: room_name(team),
        participant_name: my_name.trim().to_string(),
        user_id: me.as_str().to_string(),
        team_id: team.as_str().to_string(),
    };
    match source.call_token(request).await {
        Ok(response) => {
            tracing::info!(team = %team, user = %me, "joined call");
            Ok(response)
        }
        Err(e) => {
            tracing::warn!(team = %team, error = %e, "call token request failed");
            Err(e)
        }
    }
}

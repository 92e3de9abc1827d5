//! Video-call token request and response types.
//!
//! The JSON shape (camelCase) matches the HTTP token endpoint; the same
//! structs travel over the store protocol inside [`crate::store::Request`].

use serde::{Deserialize, Serialize};

use crate::model::TeamCode;

/// Prefix of every team call room.
pub const ROOM_PREFIX: &str = "team-";

/// Name of the SFU room a team's call takes place in.
#[must_use]
pub fn room_name(team: &TeamCode) -> String {
    format!("{ROOM_PREFIX}{team}")
}

/// Body of a token request.
///
/// Every field defaults to empty so that missing fields surface as a
/// validation error instead of a parse error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallTokenRequest {
    /// Room to join.
    pub room_name: String,
    /// Display name shown to other participants.
    pub participant_name: String,
    /// Identity of the participant; falls back to `participant_name`.
    pub user_id: String,
    /// Team the room belongs to (informational).
    pub team_id: String,
}

impl CallTokenRequest {
    /// Whether the fields required to mint a token are present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.room_name.trim().is_empty() && !self.participant_name.trim().is_empty()
    }

    /// Identity the token is issued to.
    #[must_use]
    pub fn identity(&self) -> &str {
        if self.user_id.trim().is_empty() {
            &self.participant_name
        } else {
            &self.user_id
        }
    }
}

/// Successful token response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallTokenResponse {
    /// Signed access token.
    pub token: String,
    /// URL of the SFU to connect to.
    pub server_url: String,
}

//! User profiles and display names.

use std::collections::HashMap;
use std::sync::Arc;

use contrimeter_proto::model::{UserId, UserProfile};
use contrimeter_proto::store::{Query, UserPatch, Write};
use thiserror::Error;

use crate::store::{self, DocumentStore, StoreError};
use crate::timer::{Clock, SystemClock};

/// Errors that can occur during profile operations.
#[derive(Debug, Error)]
pub enum UserError {
    /// Display name cannot be empty.
    #[error("display name cannot be empty")]
    NameEmpty,
    /// No profile exists for the user.
    #[error("no profile for {0}")]
    NotFound(UserId),
    /// The store refused or failed the request.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How `uid` is shown to `me`: `You` for myself, the profile name when
/// one is known, otherwise `User` followed by the last four characters of
/// the id.
#[must_use]
pub fn display_name(uid: &UserId, profiles: &HashMap<UserId, UserProfile>, me: &UserId) -> String {
    if uid == me {
        return "You".to_string();
    }
    if let Some(profile) = profiles.get(uid).filter(|p| !p.name.trim().is_empty()) {
        return profile.name.clone();
    }
    let chars: Vec<char> = uid.as_str().chars().collect();
    let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
    format!("User {tail}")
}

/// Profile store access.
pub struct Profiles<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: DocumentStore> Profiles<S> {
    /// Creates a profile handle.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    /// Overrides the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Reads a profile.
    ///
    /// # Errors
    ///
    /// Returns [`UserError::Store`] if the query fails.
    pub async fn profile(&self, uid: &UserId) -> Result<Option<UserProfile>, UserError> {
        Ok(store::into_user(
            self.store.query(Query::User(uid.clone())).await?,
        )?)
    }

    /// Reads the profiles of several users, skipping unknown ones.
    ///
    /// # Errors
    ///
    /// Returns [`UserError::Store`] if a query fails.
    pub async fn profiles<'a>(
        &self,
        uids: impl IntoIterator<Item = &'a UserId>,
    ) -> Result<HashMap<UserId, UserProfile>, UserError> {
        let mut found = HashMap::new();
        for uid in uids {
            if found.contains_key(uid) {
                continue;
            }
            if let Some(profile) = self.profile(uid).await? {
                found.insert(uid.clone(), profile);
            }
        }
        Ok(found)
    }

    /// Creates my profile on first sign-in. An existing profile is left
    /// untouched and returned as stored.
    ///
    /// # Errors
    ///
    /// Returns [`UserError::NameEmpty`] or a store error.
    pub async fn bootstrap_profile(
        &self,
        uid: &UserId,
        name: &str,
        email: &str,
        role: Option<&str>,
    ) -> Result<UserProfile, UserError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(UserError::NameEmpty);
        }
        let mut profile = UserProfile::new(uid.clone(), name, email.trim(), self.clock.now_ms());
        if let Some(role) = role {
            role.trim().clone_into(&mut profile.role);
        }
        self.store
            .commit(
                Write::PutUser {
                    profile,
                    only_if_absent: true,
                }
                .into(),
            )
            .await?;
        tracing::debug!(user = %uid, "profile bootstrapped");
        self.profile(uid)
            .await?
            .ok_or_else(|| UserError::NotFound(uid.clone()))
    }

    /// Updates the set fields of a profile.
    ///
    /// # Errors
    ///
    /// Returns [`UserError::NameEmpty`] for a blank new name,
    /// [`UserError::NotFound`] if there is no profile, or a store error.
    pub async fn update_profile(&self, uid: &UserId, mut patch: UserPatch) -> Result<(), UserError> {
        if let Some(name) = patch.name.as_mut() {
            let trimmed = name.trim().to_string();
            if trimmed.is_empty() {
                return Err(UserError::NameEmpty);
            }
            *name = trimmed;
        }
        match self
            .store
            .commit(
                Write::PatchUser {
                    uid: uid.clone(),
                    patch,
                }
                .into(),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Err(UserError::NotFound(uid.clone())),
            Err(e) => Err(e.into()),
        }
    }
}

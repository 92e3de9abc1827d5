//! Team membership and leadership.
//!
//! Every membership change is a single batch: the team document, the
//! departing member's tasks and the affected profile move together.

use std::sync::Arc;

use contrimeter_proto::model::{
    IdError, TEAM_CODE_ALPHABET, TEAM_CODE_LENGTH, Team, TeamCode, UserId,
};
use contrimeter_proto::store::{Query, TeamPatch, Write, WriteBatch};
use rand::Rng;
use thiserror::Error;

use crate::store::{self, DocumentStore, StoreError};
use crate::timer::{Clock, SystemClock};

/// Maximum team name length in characters.
pub const MAX_TEAM_NAME_LENGTH: usize = 64;

/// Codes tried before team creation gives up.
pub const CODE_ATTEMPTS: usize = 5;

/// Errors that can occur during team operations.
#[derive(Debug, Error)]
pub enum TeamError {
    /// Team name cannot be empty.
    #[error("team name cannot be empty")]
    NameEmpty,
    /// Team name exceeds the maximum length.
    #[error("team name too long (max {MAX_TEAM_NAME_LENGTH} characters)")]
    NameTooLong,
    /// The code is malformed.
    #[error(transparent)]
    InvalidCode(#[from] IdError),
    /// No team has this code.
    #[error("team does not exist: {0}")]
    NotFound(TeamCode),
    /// The user is not a member of the team.
    #[error("{0} is not a member of this team")]
    NotMember(UserId),
    /// Only the team leader may do this.
    #[error("only the team leader can do this")]
    NotLeader,
    /// The leader tried to remove themselves.
    #[error("the leader cannot remove themselves; leave the team instead")]
    CannotRemoveSelf,
    /// Every generated code was already taken.
    #[error("could not find a free team code after {CODE_ATTEMPTS} attempts")]
    CodeExhausted,
    /// The store refused or failed the request.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Draws a random team code from the unambiguous alphabet.
///
/// # Errors
///
/// Returns [`TeamError::InvalidCode`] only if the alphabet and the code
/// rules disagree.
pub fn generate_team_code() -> Result<TeamCode, TeamError> {
    let mut rng = rand::rng();
    let code: String = (0..TEAM_CODE_LENGTH)
        .map(|_| char::from(TEAM_CODE_ALPHABET[rng.random_range(0..TEAM_CODE_ALPHABET.len())]))
        .collect();
    Ok(TeamCode::parse(&code)?)
}

fn validate_team_name(name: &str) -> Result<String, TeamError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(TeamError::NameEmpty);
    }
    if trimmed.chars().count() > MAX_TEAM_NAME_LENGTH {
        return Err(TeamError::NameTooLong);
    }
    Ok(trimmed.to_string())
}

/// Team operations on behalf of one user.
pub struct TeamService<S> {
    store: Arc<S>,
    me: UserId,
    clock: Arc<dyn Clock>,
}

impl<S: DocumentStore> TeamService<S> {
    /// Creates a service acting as `me`.
    #[must_use]
    pub fn new(store: Arc<S>, me: UserId) -> Self {
        Self {
            store,
            me,
            clock: Arc::new(SystemClock),
        }
    }

    /// Overrides the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Reads one team.
    ///
    /// # Errors
    ///
    /// Returns [`TeamError::Store`] if the query fails.
    pub async fn team(&self, code: &TeamCode) -> Result<Option<Team>, TeamError> {
        Ok(store::into_team(
            self.store.query(Query::Team(code.clone())).await?,
        )?)
    }

    /// Creates a team led by me, retrying on code collisions.
    ///
    /// # Errors
    ///
    /// Returns a name validation error, [`TeamError::CodeExhausted`], or a
    /// store error.
    pub async fn create(&self, name: &str) -> Result<Team, TeamError> {
        let name = validate_team_name(name)?;
        for attempt in 1..=CODE_ATTEMPTS {
            let code = generate_team_code()?;
            let now = self.clock.now_ms();
            let team = Team::new(code.clone(), name.clone(), self.me.clone(), now);
            let batch = WriteBatch::new()
                .with(Write::CreateTeam(team.clone()))
                .with(Write::LinkTeam {
                    uid: self.me.clone(),
                    team: code.clone(),
                    at: now,
                });
            match self.store.commit(batch).await {
                Ok(()) => {
                    tracing::info!(team = %code, "team created");
                    return Ok(team);
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!(team = %code, attempt, "team code taken, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(TeamError::CodeExhausted)
    }

    /// Joins a team by code. Joining a team twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TeamError::NotFound`] if no team has the code, or a store
    /// error.
    pub async fn join(&self, code: &TeamCode) -> Result<Team, TeamError> {
        let mut team = self
            .team(code)
            .await?
            .ok_or_else(|| TeamError::NotFound(code.clone()))?;
        let patch = TeamPatch {
            add_member: Some(self.me.clone()),
            ..TeamPatch::default()
        };
        let batch = WriteBatch::new()
            .with(Write::PatchTeam {
                code: code.clone(),
                patch: patch.clone(),
            })
            .with(Write::LinkTeam {
                uid: self.me.clone(),
                team: code.clone(),
                at: self.clock.now_ms(),
            });
        self.commit(code, batch).await?;
        patch.apply_to(&mut team);
        tracing::info!(team = %code, "joined team");
        Ok(team)
    }

    /// Leaves a team. My non-archived tasks go to the team; if I lead it,
    /// leadership passes to the first remaining member, or the team is
    /// left without a leader.
    ///
    /// # Errors
    ///
    /// Returns [`TeamError::NotFound`], [`TeamError::NotMember`], or a store
    /// error.
    pub async fn leave(&self, code: &TeamCode) -> Result<(), TeamError> {
        let team = self.member_team(code).await?;
        let leader = team.is_leader(&self.me).then(|| {
            let next = team.users().find(|u| **u != self.me).cloned();
            if next.is_none() {
                tracing::warn!(team = %code, "last member left, team is now leaderless");
            }
            next
        });
        let batch = self.departure(code, &self.me, leader);
        self.commit(code, batch).await?;
        tracing::info!(team = %code, "left team");
        Ok(())
    }

    /// Removes a member (leader only). Their tasks go to the team.
    ///
    /// # Errors
    ///
    /// Returns [`TeamError::NotLeader`], [`TeamError::CannotRemoveSelf`],
    /// [`TeamError::NotMember`], or a store error.
    pub async fn remove_member(&self, code: &TeamCode, user: &UserId) -> Result<(), TeamError> {
        let team = self.led_team(code).await?;
        if *user == self.me {
            return Err(TeamError::CannotRemoveSelf);
        }
        if !team.is_member(user) {
            return Err(TeamError::NotMember(user.clone()));
        }
        let batch = self.departure(code, user, None);
        self.commit(code, batch).await?;
        tracing::info!(team = %code, member = %user, "member removed");
        Ok(())
    }

    /// Renames a team (leader only).
    ///
    /// # Errors
    ///
    /// Returns a name validation error, [`TeamError::NotLeader`], or a
    /// store error.
    pub async fn rename(&self, code: &TeamCode, name: &str) -> Result<(), TeamError> {
        let name = validate_team_name(name)?;
        self.led_team(code).await?;
        let batch = WriteBatch::from(Write::PatchTeam {
            code: code.clone(),
            patch: TeamPatch {
                name: Some(name),
                ..TeamPatch::default()
            },
        });
        self.commit(code, batch).await
    }

    /// Deletes a team with its tasks, counters, sessions and messages
    /// (leader only).
    ///
    /// # Errors
    ///
    /// Returns [`TeamError::NotLeader`], [`TeamError::NotFound`], or a store
    /// error.
    pub async fn delete(&self, code: &TeamCode) -> Result<(), TeamError> {
        self.led_team(code).await?;
        self.commit(code, Write::DeleteTeamCascade(code.clone()).into())
            .await?;
        tracing::info!(team = %code, "team deleted");
        Ok(())
    }

    /// Every team I belong to.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn my_teams(&self) -> Result<Vec<Team>, TeamError> {
        Ok(store::into_teams(
            self.store.query(Query::TeamsOf(self.me.clone())).await?,
        )?)
    }

    /// Drops `joined_teams` entries I am no longer a member of. Returns the
    /// dropped codes.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn sync_user_teams(&self) -> Result<Vec<TeamCode>, TeamError> {
        let Some(profile) =
            store::into_user(self.store.query(Query::User(self.me.clone())).await?)?
        else {
            return Ok(Vec::new());
        };
        let actual: Vec<TeamCode> = self.my_teams().await?.into_iter().map(|t| t.code).collect();
        let stale: Vec<TeamCode> = profile
            .joined_teams
            .iter()
            .filter(|code| !actual.contains(code))
            .cloned()
            .collect();
        if !stale.is_empty() {
            self.store
                .commit(
                    Write::SetJoinedTeams {
                        uid: self.me.clone(),
                        teams: actual,
                    }
                    .into(),
                )
                .await?;
            tracing::info!(dropped = stale.len(), "stale team links removed");
        }
        Ok(stale)
    }

    /// Batch removing `user` from the team: tasks handed to the team,
    /// membership dropped, profile unlinked.
    fn departure(
        &self,
        code: &TeamCode,
        user: &UserId,
        leader: Option<Option<UserId>>,
    ) -> WriteBatch {
        WriteBatch::new()
            .with(Write::ReassignTasks {
                team: code.clone(),
                from: user.clone(),
            })
            .with(Write::PatchTeam {
                code: code.clone(),
                patch: TeamPatch {
                    remove_member: Some(user.clone()),
                    leader,
                    ..TeamPatch::default()
                },
            })
            .with(Write::UnlinkTeam {
                uid: user.clone(),
                team: code.clone(),
            })
    }

    async fn member_team(&self, code: &TeamCode) -> Result<Team, TeamError> {
        let team = self
            .team(code)
            .await?
            .ok_or_else(|| TeamError::NotFound(code.clone()))?;
        if !team.is_member(&self.me) {
            return Err(TeamError::NotMember(self.me.clone()));
        }
        Ok(team)
    }

    async fn led_team(&self, code: &TeamCode) -> Result<Team, TeamError> {
        let team = self.member_team(code).await?;
        if !team.is_leader(&self.me) {
            return Err(TeamError::NotLeader);
        }
        Ok(team)
    }

    async fn commit(&self, code: &TeamCode, batch: WriteBatch) -> Result<(), TeamError> {
        self.store.commit(batch).await.map_err(|e| {
            if e.is_not_found() {
                TeamError::NotFound(code.clone())
            } else {
                tracing::warn!(team = %code, error = %e, "team update failed");
                e.into()
            }
        })
    }
}

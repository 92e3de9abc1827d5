//! Team chat.
//!
//! Messages are append-only documents scoped to a team. Text is sanitised
//! before it is stored; attachments are references to already uploaded
//! files and only their size is checked here.

use std::sync::Arc;

use contrimeter_proto::model::{Attachment, ChatMessage, MessageId, TeamCode, UserId};
use contrimeter_proto::store::{Query, Write};
use thiserror::Error;

use crate::store::{self, DocumentStore, StoreError, Subscription};
use crate::timer::{Clock, SystemClock};

/// Maximum message length in characters.
pub const MAX_MESSAGE_CHARS: usize = 800;

/// Maximum line breaks kept in one message.
pub const MAX_LINE_BREAKS: usize = 10;

/// Maximum attachment size in bytes (5 MiB).
pub const MAX_ATTACHMENT_BYTES: u64 = 5 * 1024 * 1024;

const FALLBACK_AUTHOR: &str = "User";

/// Errors that can occur while chatting.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Neither text nor an attachment was given.
    #[error("message is empty")]
    Empty,
    /// The attachment exceeds [`MAX_ATTACHMENT_BYTES`].
    #[error("attachment too large ({size} bytes, max {MAX_ATTACHMENT_BYTES})")]
    AttachmentTooLarge {
        /// Reported attachment size.
        size: u64,
    },
    /// The store refused or failed the request.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Truncates to [`MAX_MESSAGE_CHARS`], keeps at most [`MAX_LINE_BREAKS`]
/// line breaks and collapses runs of four or more line breaks to three.
#[must_use]
pub fn sanitize_message(text: &str) -> String {
    let mut out: String = text.chars().take(MAX_MESSAGE_CHARS).collect();

    if out.matches('\n').count() > MAX_LINE_BREAKS {
        out = out
            .split('\n')
            .take(MAX_LINE_BREAKS + 1)
            .collect::<Vec<_>>()
            .join("\n");
    }

    let mut collapsed = String::with_capacity(out.len());
    let mut run = 0usize;
    for ch in out.chars() {
        if ch == '\n' {
            run += 1;
            if run > 3 {
                continue;
            }
        } else {
            run = 0;
        }
        collapsed.push(ch);
    }
    collapsed
}

/// Chat of one team, acting as one user.
pub struct TeamChat<S> {
    store: Arc<S>,
    team: TeamCode,
    me: UserId,
    clock: Arc<dyn Clock>,
}

impl<S: DocumentStore> TeamChat<S> {
    /// Creates a chat handle.
    #[must_use]
    pub fn new(store: Arc<S>, team: TeamCode, me: UserId) -> Self {
        Self {
            store,
            team,
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

    /// Posts a message. The author name is taken from my profile.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Empty`] when there is neither text nor an
    /// attachment, [`ChatError::AttachmentTooLarge`], or a store error.
    pub async fn send_message(
        &self,
        text: &str,
        attachment: Option<Attachment>,
    ) -> Result<ChatMessage, ChatError> {
        let message = sanitize_message(text);
        if message.is_empty() && attachment.is_none() {
            return Err(ChatError::Empty);
        }
        if let Some(size) = attachment
            .as_ref()
            .map(|file| file.size)
            .filter(|size| *size > MAX_ATTACHMENT_BYTES)
        {
            return Err(ChatError::AttachmentTooLarge { size });
        }

        let user_name = store::into_user(self.store.query(Query::User(self.me.clone())).await?)?
            .map(|p| p.name)
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| FALLBACK_AUTHOR.to_string());

        let msg = ChatMessage {
            id: MessageId::new(),
            team_id: self.team.clone(),
            user_id: self.me.clone(),
            user_name,
            message,
            attachment,
            created_at: self.clock.now_ms(),
        };
        self.store.commit(Write::PutMessage(msg.clone()).into()).await?;
        tracing::debug!(team = %self.team, message = %msg.id, "message sent");
        Ok(msg)
    }

    /// All messages of the team, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the query fails.
    pub async fn messages(&self) -> Result<Vec<ChatMessage>, StoreError> {
        store::into_messages(self.store.query(Query::Messages(self.team.clone())).await?)
    }

    /// Live query over the team's messages, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the subscription cannot be registered.
    pub async fn subscribe(&self) -> Result<Subscription, StoreError> {
        self.store.subscribe(Query::Messages(self.team.clone())).await
    }
}

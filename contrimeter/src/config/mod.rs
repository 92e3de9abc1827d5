//! Configuration system for the `Contrimeter` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/contrimeter/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use contrimeter_proto::model::UserId;

use crate::contributions::ScoringPolicy;
use crate::sessions::DEFAULT_HISTORY_LIMIT;
use crate::tasks::{CommonRule, DEFAULT_START_GRACE, TaskPolicy};

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    store: StoreFileConfig,
    user: UserFileConfig,
    timer: TimerFileConfig,
    scoring: ScoringPolicy,
    tasks: TasksFileConfig,
    sessions: SessionsFileConfig,
    log: LogFileConfig,
}

/// `[store]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StoreFileConfig {
    url: Option<String>,
    connect_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
}

/// `[user]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct UserFileConfig {
    id: Option<String>,
    name: Option<String>,
}

/// `[timer]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TimerFileConfig {
    start_grace_ms: Option<u64>,
    tick_ms: Option<u64>,
}

/// `[tasks]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TasksFileConfig {
    common_archive: Option<CommonRule>,
    common_delete: Option<CommonRule>,
}

/// `[sessions]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionsFileConfig {
    history_limit: Option<u32>,
}

/// `[log]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct LogFileConfig {
    level: Option<String>,
    file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Store --
    /// WebSocket URL of the store server.
    pub store_url: String,
    /// Timeout for connecting to the store.
    pub connect_timeout: Duration,
    /// Timeout for one store request.
    pub request_timeout: Duration,

    // -- User --
    /// My user id, as issued by the identity provider.
    pub user_id: Option<UserId>,
    /// My display name, used when bootstrapping the profile.
    pub user_name: Option<String>,

    // -- Behaviour --
    /// How long a freshly started timer is protected from reconciliation.
    pub start_grace: Duration,
    /// Display tick period of running timers.
    pub tick: Duration,
    /// Contribution scoring constants.
    pub scoring: ScoringPolicy,
    /// Archive and delete rights on common tasks.
    pub task_policy: TaskPolicy,
    /// Number of sessions shown by `history`.
    pub history_limit: u32,

    // -- Logging --
    /// Log level filter string.
    pub log_level: String,
    /// Log file; `None` logs to stderr.
    pub log_file: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            store_url: "ws://127.0.0.1:9100/ws".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            user_id: None,
            user_name: None,
            start_grace: DEFAULT_START_GRACE,
            tick: Duration::from_secs(1),
            scoring: ScoringPolicy::default(),
            task_policy: TaskPolicy::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            log_level: "warn".to_string(),
            log_file: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path
    /// (`~/.config/contrimeter/config.toml`) is tried and silently ignored
    /// if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            store_url: cli
                .store_url
                .clone()
                .or_else(|| file.store.url.clone())
                .unwrap_or(defaults.store_url),
            connect_timeout: file
                .store
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            request_timeout: file
                .store
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            user_id: cli
                .user
                .clone()
                .or_else(|| file.user.id.clone())
                .filter(|id| !id.trim().is_empty())
                .map(UserId::new),
            user_name: cli.name.clone().or_else(|| file.user.name.clone()),
            start_grace: file
                .timer
                .start_grace_ms
                .map_or(defaults.start_grace, Duration::from_millis),
            tick: file
                .timer
                .tick_ms
                .filter(|ms| *ms > 0)
                .map_or(defaults.tick, Duration::from_millis),
            scoring: file.scoring,
            task_policy: TaskPolicy {
                common_archive: file
                    .tasks
                    .common_archive
                    .unwrap_or(defaults.task_policy.common_archive),
                common_delete: file
                    .tasks
                    .common_delete
                    .unwrap_or(defaults.task_policy.common_delete),
            },
            history_limit: file
                .sessions
                .history_limit
                .unwrap_or(defaults.history_limit),
            log_level: cli
                .log_level
                .clone()
                .or_else(|| file.log.level.clone())
                .unwrap_or(defaults.log_level),
            log_file: cli.log_file.clone().or_else(|| file.log.file.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(
    version,
    about = "Team task tracking with timers and contribution scores",
    arg_required_else_help = true
)]
pub struct CliArgs {
    /// WebSocket URL of the store server.
    #[arg(long, env = "CONTRIMETER_STORE_URL")]
    pub store_url: Option<String>,

    /// Your user id.
    #[arg(long, short, env = "CONTRIMETER_USER")]
    pub user: Option<String>,

    /// Your display name.
    #[arg(long, env = "CONTRIMETER_NAME")]
    pub name: Option<String>,

    /// Path to config file (default: `~/.config/contrimeter/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, env = "CONTRIMETER_LOG")]
    pub log_level: Option<String>,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// What to do.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Top-level commands.
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create or update your profile.
    Profile {
        /// New display name.
        #[arg(long)]
        display_name: Option<String>,
        /// New email.
        #[arg(long)]
        email: Option<String>,
        /// New role label.
        #[arg(long)]
        role: Option<String>,
    },
    /// Team membership.
    #[command(subcommand)]
    Team(TeamCommand),
    /// Tasks of a team.
    Task {
        /// Team code.
        #[arg(long, short, env = "CONTRIMETER_TEAM")]
        team: String,
        /// Task action.
        #[command(subcommand)]
        action: TaskCommand,
    },
    /// Run a task's timer until interrupted.
    Work {
        /// Team code.
        #[arg(long, short, env = "CONTRIMETER_TEAM")]
        team: String,
        /// Task id.
        task: String,
    },
    /// Show contribution standings.
    Standings {
        /// Team code.
        #[arg(long, short, env = "CONTRIMETER_TEAM")]
        team: String,
    },
    /// Rebuild contribution counters from sessions and tasks.
    Reconcile {
        /// Team code.
        #[arg(long, short, env = "CONTRIMETER_TEAM")]
        team: String,
    },
    /// Show recent work sessions.
    History {
        /// Team code.
        #[arg(long, short, env = "CONTRIMETER_TEAM")]
        team: String,
        /// Number of sessions to fetch.
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Team chat.
    Chat {
        /// Team code.
        #[arg(long, short, env = "CONTRIMETER_TEAM")]
        team: String,
        /// Chat action.
        #[command(subcommand)]
        action: ChatCommand,
    },
    /// Fetch a token for the team's video call.
    Call {
        /// Team code.
        #[arg(long, short, env = "CONTRIMETER_TEAM")]
        team: String,
    },
    /// Follow a team's tasks live.
    Watch {
        /// Team code.
        #[arg(long, short, env = "CONTRIMETER_TEAM")]
        team: String,
    },
}

/// Team membership commands.
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum TeamCommand {
    /// Create a team and become its leader.
    Create {
        /// Team name.
        name: String,
    },
    /// Join a team by code.
    Join {
        /// Team code.
        code: String,
    },
    /// Leave a team.
    Leave {
        /// Team code.
        code: String,
    },
    /// List my teams.
    List,
    /// Remove a member (leader only).
    Remove {
        /// Team code.
        code: String,
        /// Member to remove.
        user: String,
    },
    /// Rename a team (leader only).
    Rename {
        /// Team code.
        code: String,
        /// New name.
        name: String,
    },
    /// Delete a team and everything in it (leader only).
    Delete {
        /// Team code.
        code: String,
    },
    /// Repair my joined-teams list.
    Sync,
}

/// Task commands.
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum TaskCommand {
    /// List tasks.
    List {
        /// all, active, completed, at-risk or inactive.
        #[arg(long, default_value = "all")]
        filter: String,
        /// Only tasks assigned to me or to everyone.
        #[arg(long)]
        mine: bool,
        /// List archived tasks instead.
        #[arg(long)]
        archived: bool,
    },
    /// Create a task.
    Add {
        /// Task name.
        name: String,
        /// Optional description.
        #[arg(long)]
        description: Option<String>,
        /// A member id, or `common`.
        #[arg(long, default_value = "common")]
        assignee: String,
    },
    /// Rename a task.
    Rename {
        /// Task id.
        id: String,
        /// New name.
        name: String,
    },
    /// Set or clear a task's description.
    Describe {
        /// Task id.
        id: String,
        /// New description; omit to clear.
        text: Option<String>,
    },
    /// Hand a task to another assignee.
    Assign {
        /// Task id.
        id: String,
        /// A member id, or `common`.
        assignee: String,
    },
    /// Toggle done.
    Done {
        /// Task id.
        id: String,
    },
    /// Toggle the at-risk flag.
    Risk {
        /// Task id.
        id: String,
    },
    /// Archive a task.
    Archive {
        /// Task id.
        id: String,
    },
    /// Restore an archived task.
    Unarchive {
        /// Task id.
        id: String,
    },
    /// Delete a task.
    Delete {
        /// Task id.
        id: String,
    },
    /// Archive every done task I may archive.
    ArchiveCompleted,
}

/// Chat commands.
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// Post a message.
    Send {
        /// Message text.
        #[arg(default_value = "")]
        text: String,
        /// URL of an uploaded attachment.
        #[arg(long, requires = "attach_name")]
        attach_url: Option<String>,
        /// File name of the attachment.
        #[arg(long, requires = "attach_url")]
        attach_name: Option<String>,
        /// Size of the attachment in bytes.
        #[arg(long, default_value_t = 0)]
        attach_size: u64,
    },
    /// Print the conversation.
    Log,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("contrimeter").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}

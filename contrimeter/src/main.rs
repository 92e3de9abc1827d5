//! `Contrimeter` command-line client.
//!
//! Talks to a `contrimeter-store` server over WebSocket. Configuration via
//! CLI flags, environment variables, or config file
//! (`~/.config/contrimeter/config.toml`).
//!
//! ```bash
//! contrimeter --user alice profile --display-name Alice
//! contrimeter --user alice team create "Design Sprint"
//! contrimeter --user alice task --team AB3XQ9 add "Wireframes"
//! contrimeter --user alice work --team AB3XQ9 <task-id>
//! contrimeter --user alice standings --team AB3XQ9
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

use contrimeter::call::{self, CallError};
use contrimeter::chat::{ChatError, TeamChat};
use contrimeter::config::{
    ChatCommand, CliArgs, ClientConfig, Command, TaskCommand, TeamCommand,
};
use contrimeter::contributions::ContributionBoard;
use contrimeter::sessions::{self, SessionHistory};
use contrimeter::store::{RemoteStore, StoreError};
use contrimeter::tasks::{Coordinator, TaskError, TaskFilter, display_status};
use contrimeter::teams::{TeamError, TeamService};
use contrimeter::timer::{self, Clock, SystemClock};
use contrimeter::users::{self, Profiles, UserError};
use contrimeter_proto::model::{
    Assignee, Attachment, Task, TaskId, TeamCode, UserId, UserProfile,
};
use contrimeter_proto::store::UserPatch;

/// Everything a command can fail with.
#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Team(#[from] TeamError),
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error(transparent)]
    User(#[from] UserError),
}

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let _log_guard = init_logging(&config.log_level, config.log_file.as_deref());

    let Some(command) = cli.command else {
        eprintln!("no command given; see --help");
        std::process::exit(2);
    };

    if let Err(e) = run(command, &config).await {
        tracing::debug!(error = %e, "command failed");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

/// Initialize logging to stderr, or to a file when one is configured.
///
/// Returns a [`WorkerGuard`] for file logging that must be held until
/// shutdown to flush buffered entries.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let Some(log_path) = file_path else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(env_filter)
            .init();
        return None;
    };

    let log_dir = log_path.parent().filter(|p| !p.as_os_str().is_empty());
    let file_name = log_path.file_name()?.to_str()?;
    let file_appender =
        tracing_appender::rolling::never(log_dir.unwrap_or_else(|| Path::new(".")), file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run(command: Command, config: &ClientConfig) -> Result<(), CliError> {
    let me = config.user_id.clone().ok_or_else(|| {
        CliError::Usage("no user id; pass --user or set [user] id in the config file".into())
    })?;
    let store = Arc::new(
        RemoteStore::connect_with(
            &config.store_url,
            config.connect_timeout,
            config.request_timeout,
        )
        .await?,
    );

    match command {
        Command::Profile {
            display_name,
            email,
            role,
        } => profile(&store, &me, config, display_name, email, role).await,
        Command::Team(cmd) => team_command(&store, me, cmd).await,
        Command::Task { team, action } => {
            let coordinator = load_coordinator(&store, me, &team, config).await?;
            task_command(&store, &coordinator, action).await
        }
        Command::Work { team, task } => {
            let coordinator = load_coordinator(&store, me, &team, config).await?;
            work(&coordinator, parse_task(&task)?, config).await
        }
        Command::Standings { team } => standings(&store, &me, parse_team(&team)?, config).await,
        Command::Reconcile { team } => {
            let board = ContributionBoard::new(Arc::clone(&store), parse_team(&team)?)
                .with_policy(config.scoring);
            let drifts = board.reconcile().await?;
            if drifts.is_empty() {
                println!("counters are consistent");
            }
            for d in drifts {
                println!(
                    "{}: tasks {} -> {}, time {} -> {}",
                    d.user,
                    d.before.tasks_completed,
                    d.after.tasks_completed,
                    sessions::format_duration(d.before.seconds),
                    sessions::format_duration(d.after.seconds),
                );
            }
            Ok(())
        }
        Command::History { team, limit } => {
            let history = SessionHistory::new(Arc::clone(&store), parse_team(&team)?);
            let now = SystemClock.now_ms();
            for entry in history
                .entries(limit.unwrap_or(config.history_limit))
                .await?
            {
                println!(
                    "{:<10} {:<20} {:<30} {}",
                    sessions::format_day(entry.created_at, now),
                    entry.user_name,
                    entry.task_name,
                    sessions::format_duration(entry.duration),
                );
            }
            Ok(())
        }
        Command::Chat { team, action } => chat(&store, me, parse_team(&team)?, action).await,
        Command::Call { team } => {
            let team = parse_team(&team)?;
            let name = my_name(&store, &me, config).await?;
            let response = call::join_call(store.as_ref(), &team, &me, &name).await?;
            println!("room:   {}", call::room_name(&team));
            println!("server: {}", response.server_url);
            println!("token:  {}", response.token);
            Ok(())
        }
        Command::Watch { team } => {
            let coordinator = load_coordinator(&store, me, &team, config).await?;
            watch(&store, &coordinator).await
        }
    }
}

fn parse_team(raw: &str) -> Result<TeamCode, CliError> {
    TeamCode::parse(raw).map_err(|e| CliError::Usage(e.to_string()))
}

fn parse_task(raw: &str) -> Result<TaskId, CliError> {
    raw.parse()
        .map_err(|e| CliError::Usage(format!("invalid task id {raw:?}: {e}")))
}

fn parse_assignee(raw: &str) -> Result<Assignee, CliError> {
    Assignee::parse(raw).map_err(|_| TaskError::InvalidAssignee(raw.to_string()).into())
}

async fn load_coordinator(
    store: &Arc<RemoteStore>,
    me: UserId,
    team: &str,
    config: &ClientConfig,
) -> Result<Coordinator<RemoteStore>, CliError> {
    let coordinator = Coordinator::new(Arc::clone(store), me, parse_team(team)?)
        .with_policy(config.task_policy)
        .with_start_grace(config.start_grace);
    coordinator.load().await?;
    Ok(coordinator)
}

async fn my_name(
    store: &Arc<RemoteStore>,
    me: &UserId,
    config: &ClientConfig,
) -> Result<String, CliError> {
    let stored = Profiles::new(Arc::clone(store))
        .profile(me)
        .await?
        .map(|p| p.name)
        .filter(|n| !n.trim().is_empty());
    Ok(stored
        .or_else(|| config.user_name.clone())
        .unwrap_or_else(|| "User".to_string()))
}

async fn names_of<'a>(
    store: &Arc<RemoteStore>,
    users: impl IntoIterator<Item = &'a UserId>,
) -> Result<HashMap<UserId, UserProfile>, CliError> {
    Ok(Profiles::new(Arc::clone(store)).profiles(users).await?)
}

async fn profile(
    store: &Arc<RemoteStore>,
    me: &UserId,
    config: &ClientConfig,
    display_name: Option<String>,
    email: Option<String>,
    role: Option<String>,
) -> Result<(), CliError> {
    let profiles = Profiles::new(Arc::clone(store));
    if profiles.profile(me).await?.is_none() {
        let name = display_name
            .clone()
            .or_else(|| config.user_name.clone())
            .ok_or_else(|| CliError::Usage("a new profile needs --display-name".into()))?;
        profiles
            .bootstrap_profile(me, &name, email.as_deref().unwrap_or(""), role.as_deref())
            .await?;
    } else if display_name.is_some() || email.is_some() || role.is_some() {
        profiles
            .update_profile(
                me,
                UserPatch {
                    name: display_name,
                    email,
                    role,
                },
            )
            .await?;
    }
    if let Some(p) = profiles.profile(me).await? {
        println!("{} <{}> {}", p.name, p.email, p.role);
        let teams: Vec<String> = p.joined_teams.iter().map(ToString::to_string).collect();
        println!("teams: {}", teams.join(", "));
    }
    Ok(())
}

async fn team_command(store: &Arc<RemoteStore>, me: UserId, cmd: TeamCommand) -> Result<(), CliError> {
    let service = TeamService::new(Arc::clone(store), me.clone());
    match cmd {
        TeamCommand::Create { name } => {
            let team = service.create(&name).await?;
            println!("created {} ({})", team.name, team.code);
        }
        TeamCommand::Join { code } => {
            let team = service.join(&parse_team(&code)?).await?;
            println!("joined {} ({})", team.name, team.code);
        }
        TeamCommand::Leave { code } => service.leave(&parse_team(&code)?).await?,
        TeamCommand::List => {
            for team in service.my_teams().await? {
                let role = if team.is_leader(&me) { " (leader)" } else { "" };
                println!(
                    "{}  {}  {} members{role}",
                    team.code,
                    team.name,
                    team.users().count()
                );
            }
        }
        TeamCommand::Remove { code, user } => {
            let user = UserId::parse(&user).map_err(|e| CliError::Usage(e.to_string()))?;
            service.remove_member(&parse_team(&code)?, &user).await?;
        }
        TeamCommand::Rename { code, name } => service.rename(&parse_team(&code)?, &name).await?,
        TeamCommand::Delete { code } => service.delete(&parse_team(&code)?).await?,
        TeamCommand::Sync => {
            let teams = service.sync_user_teams().await?;
            let codes: Vec<String> = teams.iter().map(ToString::to_string).collect();
            println!("teams: {}", codes.join(", "));
        }
    }
    Ok(())
}

async fn task_command(
    store: &Arc<RemoteStore>,
    coordinator: &Coordinator<RemoteStore>,
    action: TaskCommand,
) -> Result<(), CliError> {
    match action {
        TaskCommand::List {
            filter,
            mine,
            archived,
        } => {
            let filter: TaskFilter = filter.parse().map_err(CliError::Usage)?;
            let tasks = if archived {
                coordinator.archived_tasks(mine).await?
            } else {
                coordinator.visible_tasks(filter, mine)
            };
            let names = names_of(store, tasks.iter().filter_map(|t| t.assignee.member())).await?;
            for t in &tasks {
                print_task(t, &names, coordinator.me());
            }
        }
        TaskCommand::Add {
            name,
            description,
            assignee,
        } => {
            let id = coordinator
                .create_task(&name, description.as_deref(), parse_assignee(&assignee)?)
                .await?;
            println!("{id}");
        }
        TaskCommand::Rename { id, name } => coordinator.rename_task(parse_task(&id)?, &name).await?,
        TaskCommand::Describe { id, text } => {
            coordinator
                .describe_task(parse_task(&id)?, text.as_deref())
                .await?;
        }
        TaskCommand::Assign { id, assignee } => {
            coordinator
                .reassign_task(parse_task(&id)?, parse_assignee(&assignee)?)
                .await?;
        }
        TaskCommand::Done { id } => {
            let status = coordinator.toggle_done(parse_task(&id)?).await?;
            println!("{status}");
        }
        TaskCommand::Risk { id } => {
            let flagged = coordinator.toggle_at_risk(parse_task(&id)?).await?;
            println!("{}", if flagged { "at risk" } else { "not at risk" });
        }
        TaskCommand::Archive { id } => coordinator.archive(parse_task(&id)?).await?,
        TaskCommand::Unarchive { id } => coordinator.unarchive(parse_task(&id)?).await?,
        TaskCommand::Delete { id } => coordinator.delete(parse_task(&id)?).await?,
        TaskCommand::ArchiveCompleted => {
            let archived = coordinator.archive_completed().await?;
            println!("archived {} tasks", archived.len());
        }
    }
    Ok(())
}

fn print_task(task: &Task, names: &HashMap<UserId, UserProfile>, me: &UserId) {
    let assignee = task
        .assignee
        .member()
        .map_or_else(|| "Everyone".to_string(), |u| users::display_name(u, names, me));
    println!(
        "{}  {:<9} {:<30} {:<16} {}m",
        task.id,
        display_status(task).to_string(),
        task.name,
        assignee,
        task.time_spent,
    );
}

async fn work(
    coordinator: &Coordinator<RemoteStore>,
    id: TaskId,
    config: &ClientConfig,
) -> Result<(), CliError> {
    let name = coordinator
        .task(id)
        .map(|t| t.name)
        .ok_or(TaskError::NotFound(id))?;
    let mut tasks = coordinator.subscribe_tasks().await?;
    coordinator.start_timer(id).await?;
    println!("working on {name}; Ctrl-C to stop");

    let (mut ticks, ticker) = timer::spawn_ticker(Arc::clone(coordinator.timers()), config.tick);
    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                let outcome = coordinator.stop_timer(id).await;
                break outcome
                    .map(|o| println!("\nstopped after {}", sessions::format_duration(o.seconds)))
                    .map_err(CliError::from);
            }
            changed = ticks.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let elapsed = ticks.borrow().get(&id).copied().unwrap_or_default();
                eprint!("\r{name}  {}", timer::format_hms(elapsed));
            }
            snapshot = tasks.next() => {
                let Some(snapshot) = snapshot else {
                    break Err(StoreError::ConnectionClosed.into());
                };
                if coordinator.apply_snapshot(snapshot)?.contains(&id) {
                    println!("\ntimer was stopped on another device");
                    break Ok(());
                }
            }
        }
    };
    ticker.abort();
    result
}

async fn standings(
    store: &Arc<RemoteStore>,
    me: &UserId,
    team: TeamCode,
    config: &ClientConfig,
) -> Result<(), CliError> {
    let board = ContributionBoard::new(Arc::clone(store), team).with_policy(config.scoring);
    let rows = board.standings().await?;
    let names = names_of(store, rows.iter().map(|r| &r.user)).await?;
    for row in rows {
        println!(
            "{:<20} score {:>5}  progress {:>5.1}%  {:>3}/{:<3} tasks  {:<10} {}",
            users::display_name(&row.user, &names, me),
            row.score,
            row.progress,
            row.tasks_completed,
            row.tasks_assigned,
            sessions::format_duration(row.total_seconds),
            row.status,
        );
    }
    Ok(())
}

async fn chat(
    store: &Arc<RemoteStore>,
    me: UserId,
    team: TeamCode,
    action: ChatCommand,
) -> Result<(), CliError> {
    let chat = TeamChat::new(Arc::clone(store), team, me);
    match action {
        ChatCommand::Send {
            text,
            attach_url,
            attach_name,
            attach_size,
        } => {
            let attachment = attach_url.zip(attach_name).map(|(url, name)| Attachment {
                url,
                name,
                size: attach_size,
            });
            chat.send_message(&text, attachment).await?;
        }
        ChatCommand::Log => {
            for msg in chat.messages().await? {
                let file = msg
                    .attachment
                    .as_ref()
                    .map(|a| format!(" [{}]", a.name))
                    .unwrap_or_default();
                println!("{}: {}{file}", msg.user_name, msg.message);
            }
        }
    }
    Ok(())
}

async fn watch(
    store: &Arc<RemoteStore>,
    coordinator: &Coordinator<RemoteStore>,
) -> Result<(), CliError> {
    let mut tasks = coordinator.subscribe_tasks().await?;
    let mut team = coordinator.subscribe_team().await?;
    loop {
        let snapshot = tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            s = tasks.next() => s,
            s = team.next() => s,
        };
        let Some(snapshot) = snapshot else {
            return Err(StoreError::ConnectionClosed.into());
        };
        coordinator.apply_snapshot(snapshot)?;
        let Some(current) = coordinator.team() else {
            println!("team was deleted");
            return Ok(());
        };
        let visible = coordinator.visible_tasks(TaskFilter::All, false);
        let names = names_of(store, current.users()).await?;
        println!("--- {} ({}) ---", current.name, current.code);
        for t in &visible {
            print_task(t, &names, coordinator.me());
        }
    }
}

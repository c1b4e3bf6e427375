//! # che-watch
//!
//! Connects to a workspace master's JSON-RPC endpoint and prints workspace,
//! machine, log and organization events until interrupted.

#![deny(unsafe_code)]

mod format;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use che_core::ids::{OrganizationId, UserId, WorkspaceId};
use che_session::{
    ConnectionRegistry, SessionManager, StaticToken, StatusWaiter, Subscription, WorkspaceStatus,
};
use che_settings::{ClientSettings, load_settings_from_path, settings_path};
use clap::Parser;
use tracing::{info, warn};

/// Follow events of a workspace master.
#[derive(Parser, Debug)]
#[command(name = "che-watch", version, about = "Follow workspace and organization events")]
struct Cli {
    /// WebSocket entrypoint, e.g. `wss://che.example.com/api/websocket`.
    entrypoint: String,

    /// Workspace to follow (repeatable).
    #[arg(long = "workspace", short = 'w')]
    workspaces: Vec<String>,

    /// Only show runtime output of this machine.
    #[arg(long)]
    machine: Option<String>,

    /// Skip runtime and installer output.
    #[arg(long)]
    no_logs: bool,

    /// Organization to follow (repeatable).
    #[arg(long = "organization", short = 'o')]
    organizations: Vec<String>,

    /// User whose organization memberships to follow.
    #[arg(long)]
    user: Option<String>,

    /// Exit once every followed workspace reaches this status.
    #[arg(long)]
    until: Option<WorkspaceStatus>,

    /// Bearer token appended to the connection URL.
    #[arg(long)]
    token: Option<String>,

    /// Settings file (default `~/.che/client.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log level filter, overriding settings.
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,
}

fn load(cli: &Cli) -> Result<ClientSettings> {
    let path = cli.settings.clone().unwrap_or_else(settings_path);
    load_settings_from_path(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.workspaces.is_empty() && cli.organizations.is_empty() && cli.user.is_none() {
        bail!("nothing to watch: pass --workspace, --organization or --user");
    }
    if cli.until.is_some() && cli.workspaces.is_empty() {
        bail!("--until needs at least one --workspace");
    }

    let settings = load(&cli)?;
    let level = cli.log_level.as_deref().unwrap_or(&settings.logging.level);
    che_core::logging::init(level, cli.json_logs || settings.logging.json);

    let mut registry = ConnectionRegistry::websocket(settings.transport.clone(), settings.session.clone());
    if let Some(token) = cli.token.clone() {
        registry = registry.with_token_provider(Arc::new(StaticToken(token)));
    }
    let session = registry.get_or_create(&cli.entrypoint);
    watch_state(&session);

    session
        .connect()
        .await
        .with_context(|| format!("failed to connect to {}", cli.entrypoint))?;
    info!(entrypoint = %cli.entrypoint, client_id = ?session.client_id(), "watching");

    let subscriptions = subscribe_all(&session, &cli).await?;

    let outcome = match cli.until {
        Some(status) => {
            tokio::select! {
                result = wait_for_all(&session, &cli.workspaces, status) => result,
                signal = tokio::signal::ctrl_c() => signal.context("failed to listen for ctrl-c"),
            }
        }
        None => tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c"),
    };

    for subscription in subscriptions {
        if let Err(e) = session.unsubscribe(subscription).await {
            warn!(error = %e, "unsubscribe failed");
        }
    }
    registry.clear().await;
    outcome
}

/// Report state transitions on stderr.
fn watch_state(session: &SessionManager) {
    let mut changes = session.state_changes();
    let _ = tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            let state = *changes.borrow_and_update();
            eprintln!("-- {state}");
        }
    });
}

async fn subscribe_all(session: &SessionManager, cli: &Cli) -> Result<Vec<Subscription>> {
    let mut subscriptions = Vec::new();

    for workspace in &cli.workspaces {
        let workspace = WorkspaceId::from(workspace.as_str());
        subscriptions.push(
            session
                .subscribe_workspace_status(&workspace, |e| println!("{}", format::workspace_status(e)))
                .await?,
        );
        subscriptions.push(
            session
                .subscribe_environment_status(&workspace, |e| println!("{}", format::machine_status(e)))
                .await?,
        );
        if !cli.no_logs {
            subscriptions.push(
                session
                    .subscribe_environment_output(&workspace, cli.machine.as_deref(), |e| {
                        println!("{}", format::log_line("runtime", e));
                    })
                    .await?,
            );
            subscriptions.push(
                session
                    .subscribe_ws_agent_output(&workspace, |e| {
                        println!("{}", format::log_line("installer", e));
                    })
                    .await?,
            );
        }
    }

    for organization in &cli.organizations {
        let organization = OrganizationId::from(organization.as_str());
        subscriptions.push(
            session
                .subscribe_organization_status(&organization, |e| println!("{}", format::organization(e)))
                .await?,
        );
    }

    if let Some(user) = &cli.user {
        let user = UserId::from(user.as_str());
        subscriptions.push(
            session
                .subscribe_organization_membership_status(&user, |e| println!("{}", format::membership(e)))
                .await?,
        );
    }

    Ok(subscriptions)
}

async fn wait_for_all(session: &SessionManager, workspaces: &[String], status: WorkspaceStatus) -> Result<()> {
    let waiter = StatusWaiter::new(session.clone());
    let mut pending = Vec::new();
    for workspace in workspaces {
        let workspace = WorkspaceId::from(workspace.as_str());
        pending.push((workspace.clone(), waiter.wait_for(&workspace, status)));
        waiter.track(&workspace).await?;
    }
    for (workspace, reached) in pending {
        let _ = reached
            .await
            .with_context(|| format!("stopped waiting for {workspace}"))?;
        info!(%workspace, %status, "reached");
    }
    Ok(())
}

//! # tether
//!
//! Runs persistent chat-protocol sessions through the gateway and dispatches
//! their events to the plugins under the plugins directory.

#![deny(unsafe_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tether_core::ids::SessionId;
use tether_gateway::GatewayTransport;
use tether_plugins::{HandlerCatalog, HotReloader, LoaderConfig, PluginLoader, PluginRegistry};
use tether_session::{ConfiguredPrompt, HubConfig, SessionHub};
use tether_settings::TetherSettings;
use tether_store::{SessionStore, SqliteKeyStore};
use tether_telemetry::{init_telemetry, LogQuery, SqliteLogSink, TelemetryConfig};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tether", about = "Auto-reconnecting chat sessions with hot-reloadable plugins")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect sessions and dispatch events until interrupted.
    Run {
        /// Session to connect. Repeatable. Defaults to the first persisted session.
        #[arg(long = "session")]
        sessions: Vec<u64>,
        /// Pair a brand new session.
        #[arg(long)]
        new: bool,
    },
    /// List persisted sessions.
    Sessions,
    /// Log a session out and delete its persisted state.
    Logout { id: u64 },
    /// List loadable plugins.
    Plugins,
    /// Show persisted warn+ logs.
    Logs {
        #[arg(long)]
        level: Option<String>,
        #[arg(long)]
        session: Option<u64>,
        /// Plugin id, e.g. `admin/ping#default`.
        #[arg(long)]
        plugin: Option<String>,
        #[arg(long, default_value = "50")]
        limit: u32,
    },
}

/// Everything a command needs, built from settings.
struct Runtime {
    settings: TetherSettings,
    store: SessionStore,
    plugins: Arc<PluginRegistry>,
    loader: Arc<PluginLoader>,
}

impl Runtime {
    async fn open(settings: TetherSettings) -> Result<Self> {
        let db_path = settings.database_path();
        let kv = SqliteKeyStore::open(&db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        let store = SessionStore::new(Arc::new(kv));

        let plugins_dir = settings.plugins_dir();
        ensure_dir(&plugins_dir)?;
        let loader = Arc::new(PluginLoader::new(
            plugins_dir,
            Arc::new(HandlerCatalog::with_builtins()),
            LoaderConfig::from_settings(&settings.plugins),
        ));
        let plugins = PluginRegistry::new();
        let report = loader.load_all().await;
        for (path, error) in &report.failures {
            warn!(path = %path.display(), error = %error, "plugin failed to load");
        }
        let installed = plugins.register_all(report.plugins);
        info!(installed, root = %loader.root().display(), "plugins loaded");

        Ok(Self {
            settings,
            store,
            plugins,
            loader,
        })
    }

    fn hub(&self) -> SessionHub {
        SessionHub::new(
            Arc::new(GatewayTransport::from_settings(&self.settings.gateway)),
            self.store.clone(),
            Arc::clone(&self.plugins),
            Arc::new(ConfiguredPrompt::new(self.settings.pairing.clone())),
            HubConfig::from_settings(&self.settings),
        )
    }
}

fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = tether_settings::load_settings().context("Failed to load settings")?;
    let telemetry = init_telemetry(&TelemetryConfig::from_settings(&settings));

    match cli.command {
        Command::Run { sessions, new } => run(settings, sessions, new).await,
        Command::Sessions => {
            let runtime = Runtime::open(settings).await?;
            for id in runtime.store.session_ids().await? {
                println!("{id}");
            }
            Ok(())
        }
        Command::Logout { id } => {
            let runtime = Runtime::open(settings).await?;
            let hub = runtime.hub();
            let id = SessionId::new(id);
            let options = hub.default_options().background(0);
            if let Err(e) = hub.connect(id, options).await {
                warn!(session_id = %id, error = %e, "could not reach session, deleting local state only");
            }
            hub.logout(id).await;
            hub.shutdown().await;
            println!("session {id} logged out");
            Ok(())
        }
        Command::Plugins => {
            let runtime = Runtime::open(settings).await?;
            for plugin in runtime.plugins.snapshot() {
                let events: Vec<String> = plugin.events.iter().map(ToString::to_string).collect();
                let triggers = plugin
                    .matcher
                    .as_ref()
                    .map(|m| m.literals().join(","))
                    .unwrap_or_default();
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    plugin.id,
                    plugin.handler.kind(),
                    events.join(","),
                    plugin.group.as_deref().unwrap_or("-"),
                    triggers
                );
            }
            Ok(())
        }
        Command::Logs {
            level,
            session,
            plugin,
            limit,
        } => {
            let opened;
            let sink = if let Some(sink) = telemetry.logs() {
                sink
            } else {
                let path = settings.log_database_path();
                opened = SqliteLogSink::new(&path)
                    .with_context(|| format!("Failed to open log database: {}", path.display()))?;
                &opened
            };
            let query = LogQuery {
                level,
                session_id: session.map(|s| s.to_string()),
                plugin_id: plugin,
                limit: Some(limit),
            };
            for record in sink.query(&query)? {
                println!(
                    "{} {:5} {} {}",
                    record.timestamp, record.level, record.target, record.message
                );
            }
            Ok(())
        }
    }
}

async fn run(settings: TetherSettings, sessions: Vec<u64>, new: bool) -> Result<()> {
    let runtime = Runtime::open(settings).await?;
    let hub = runtime.hub();

    let reloader = if runtime.settings.plugins.hot_reload {
        let reloader = HotReloader::new(
            Arc::clone(&runtime.plugins),
            Arc::clone(&runtime.loader),
            Duration::from_millis(runtime.settings.plugins.debounce_ms),
        );
        reloader.watch().context("Failed to watch plugins directory")?;
        Some(reloader)
    } else {
        None
    };

    let mut ids: Vec<SessionId> = sessions.into_iter().map(SessionId::new).collect();
    if new {
        ids.push(hub.new_session_id().await?);
    }
    if ids.is_empty() {
        let persisted = hub.persisted_sessions().await?;
        let first = match persisted.first() {
            Some(id) => *id,
            None => hub.new_session_id().await?,
        };
        ids.push(first);
    }

    for id in ids {
        match hub.connect(id, hub.default_options()).await {
            Ok(connected) => info!(session_id = %connected.client.id(), "session ready"),
            Err(e) => warn!(session_id = %id, error = %e, "session failed to connect"),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("shutting down");
    if let Some(reloader) = reloader {
        reloader.stop();
    }
    hub.shutdown().await;
    runtime.plugins.clear();
    Ok(())
}

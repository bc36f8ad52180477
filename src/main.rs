use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use koukoku_engine::{Engine, EngineConfig};
use koukoku_server::ServerConfig;
use koukoku_store::{Database, SqliteItemLog};
use koukoku_telemetry::{data_dir, init_telemetry, TelemetryConfig};

/// Relay between the shared chat board and local HTTP clients.
#[derive(Debug, Parser)]
#[command(name = "koukoku", version, about)]
struct Args {
    /// HTTP port for the relay server.
    #[arg(long, env = "PORT", default_value_t = 80)]
    port: u16,

    /// Token required in `Authorization: TOKEN <token>` for sends.
    #[arg(long, env = "TOKEN")]
    token: Option<String>,

    #[arg(long, env = "KOUKOKU_HOST", default_value = koukoku_engine::config::DEFAULT_HOST)]
    remote_host: String,

    #[arg(long, env = "KOUKOKU_PORT", default_value_t = koukoku_engine::config::DEFAULT_PORT)]
    remote_port: u16,

    /// Record database. Defaults to `~/.koukoku/records.db`.
    #[arg(long, env = "KOUKOKU_DB")]
    db: Option<PathBuf>,

    /// Human-readable logs instead of JSON lines.
    #[arg(long)]
    pretty: bool,

    #[arg(long, env = "CI", hide = true)]
    ci: Option<String>,

    #[arg(long, env = "PERMIT_SEND", hide = true)]
    permit_send: Option<String>,
}

impl Args {
    /// On CI nothing is relayed unless `PERMIT_SEND=yes`. An empty `CI` is
    /// not CI.
    fn dry_run(&self) -> bool {
        self.ci.as_deref().is_some_and(|ci| !ci.is_empty())
            && !self
                .permit_send
                .as_deref()
                .is_some_and(|v| v.eq_ignore_ascii_case("yes"))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _telemetry = init_telemetry(TelemetryConfig {
        json: !args.pretty,
        ..Default::default()
    });

    let db_path = args.db.clone().unwrap_or_else(|| data_dir().join("records.db"));
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let db = Database::open(&db_path).context("opening record database")?;
    tracing::info!(path = %db_path.display(), "record database opened");
    let log = Arc::new(SqliteItemLog::new(db));

    let engine = Arc::new(Engine::connect_tls(
        EngineConfig {
            host: args.remote_host.clone(),
            port: args.remote_port,
            ..Default::default()
        },
        log.clone(),
    )?);

    let dry_run = args.dry_run();
    if dry_run {
        tracing::warn!("running on CI without PERMIT_SEND=yes, sends are not relayed");
    }
    let handle = koukoku_server::start(
        ServerConfig {
            port: args.port,
            token: args.token.clone(),
            dry_run,
            ..Default::default()
        },
        Arc::clone(&engine),
        log,
    )
    .await
    .context("starting relay server")?;

    tracing::info!(port = handle.port, "koukoku ready");

    shutdown_signal().await;
    tracing::info!("shutting down");

    // settles pending sends so their requests can complete
    engine.dispose().await;
    handle.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use courier_core::identity::{Identity, Role};
use courier_core::ids::UserId;
use courier_server::auth::StaticTokenVerifier;
use courier_server::ServerConfig;
use courier_store::Database;
use courier_telemetry::TelemetryConfig;

#[derive(Parser)]
#[command(name = "courier", about = "Chat event delivery server")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 9400)]
    port: u16,

    /// Path to the event database. Defaults to ~/.courier/database/courier.db.
    #[arg(long)]
    database: Option<PathBuf>,

    /// Interval between SSE heartbeats and socket pings, in seconds.
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,

    /// Shared-secret token granting a manager-class identity. Deployments
    /// with a real identity provider wire their own verifier instead.
    #[arg(long)]
    manager_token: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let _telemetry = courier_telemetry::init_telemetry(TelemetryConfig::default());

    tracing::info!("starting courier server");

    let db_path = args
        .database
        .unwrap_or_else(|| dirs_home().join(".courier").join("database").join("courier.db"));
    let db = Database::open(&db_path).expect("failed to open database");

    let mut verifier = StaticTokenVerifier::new();
    match args.manager_token {
        Some(token) => {
            verifier.insert(
                token,
                Identity {
                    user_id: UserId::new(0),
                    role: Role::Admin,
                    email: None,
                },
            );
        }
        None => {
            tracing::warn!("no manager token configured, all connections will be rejected");
        }
    }

    let config = ServerConfig {
        port: args.port,
        heartbeat_interval: std::time::Duration::from_secs(args.heartbeat_secs),
        ..Default::default()
    };
    let handle = courier_server::start(config, db, Arc::new(verifier))
        .await
        .expect("failed to start server");

    tracing::info!(port = handle.port, "courier server ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    tracing::info!("shutting down");
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

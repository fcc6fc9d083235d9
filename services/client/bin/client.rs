//! Main Entrypoint for the Avatar Sync Client
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Restoring the persisted session cache.
//! 3. Running one session or realtime command.
//! 4. Saving the cache after any command that changes session state.

use anyhow::Context;
use avatar_sync_client::{config::Config, state::AppState};
use avatar_sync_core::RequestOutcome;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(version, about = "Session and realtime sync client for the avatar service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start verification of a user id.
    Verify { user_id: String },
    /// Exchange a verification code for a session.
    Complete { user_id: String, code: String },
    /// Invite one or more users into the session.
    Request {
        #[arg(required = true)]
        friend_ids: Vec<String>,
    },
    /// Download the avatars of all verified participants.
    FetchAvatars {
        /// Extra user ids to include without asking the service.
        #[arg(long = "with")]
        extra_ids: Vec<String>,
    },
    /// Upload the locally cached avatar images.
    Upload,
    /// Measure API round-trip latency.
    Ping {
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Link an external account id to this session cache.
    Link { external_id: String },
    /// Drop the current session.
    Reset,
    /// Stream activity until Ctrl+C or the server closes the connection.
    Connect {
        /// Extra user ids to include without asking the service.
        #[arg(long = "with")]
        extra_ids: Vec<String>,
        /// Fetch participants' avatars before connecting.
        #[arg(long)]
        fetch_avatars: bool,
    },
    /// Print the restored session state.
    Status,
}

impl Command {
    fn changes_state(&self) -> bool {
        matches!(
            self,
            Command::Complete { .. }
                | Command::Request { .. }
                | Command::Link { .. }
                | Command::Reset
        )
    }
}

/// Listens for the `Ctrl+C` signal.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Disconnecting...");
}

/// Lists the cached verified ids plus `extra_ids` as participants. The
/// participant list lives only as long as this process.
async fn restore_participants(state: &AppState, extra_ids: &[String]) {
    let verified: Vec<String> = {
        let store = state.store.lock().await;
        store.verified().iter().map(str::to_owned).collect()
    };
    for user_id in verified.iter().chain(extra_ids) {
        state.client.add_participant(user_id).await;
    }
}

async fn fetch_all_avatars(state: &AppState) {
    for (user_id, outcome) in state.client.fetch_avatars().await {
        info!(%user_id, ?outcome, "Avatar fetch");
    }
}

fn report(operation: &str, outcome: RequestOutcome) {
    match outcome {
        RequestOutcome::Completed => info!(operation, "Done"),
        RequestOutcome::Skipped => warn!(operation, "Skipped: no active session"),
        other => warn!(operation, ?other, "Request had no effect"),
    }
}

async fn run(state: &AppState, command: &Command) -> anyhow::Result<()> {
    let client = &state.client;
    match command {
        Command::Verify { user_id } => report("verify", client.initiate_session(user_id).await),
        Command::Complete { user_id, code } => {
            report("complete", client.complete_verification(user_id, code).await)
        }
        Command::Request { friend_ids } => {
            for friend_id in friend_ids {
                report("request", client.request_participant(friend_id).await);
            }
        }
        Command::FetchAvatars { extra_ids } => {
            restore_participants(state, extra_ids).await;
            fetch_all_avatars(state).await;
        }
        Command::Upload => report("upload", client.upload_avatars().await),
        Command::Ping { count } => {
            for _ in 0..*count {
                client.ping().await;
            }
            let history = client.latency_history().await;
            if !history.is_empty() {
                let mean = history.iter().sum::<f64>() / history.len() as f64;
                info!(samples = history.len(), mean_ms = mean, "Ping summary");
            }
        }
        Command::Link { external_id } => client.link_external_id(external_id).await,
        Command::Reset => client.reset_session().await,
        Command::Connect {
            extra_ids,
            fetch_avatars,
        } => {
            restore_participants(state, extra_ids).await;
            if *fetch_avatars {
                fetch_all_avatars(state).await;
            }

            let outcome = state.engine.connect().await;
            report("connect", outcome);
            if outcome == RequestOutcome::Completed {
                tokio::select! {
                    _ = state.engine.closed() => info!("Connection closed by server"),
                    _ = shutdown_signal() => state.engine.disconnect().await,
                }
            }
            info!(state = ?state.engine.state().await, "Realtime session ended");
        }
        Command::Status => {
            let store = state.store.lock().await;
            let cache = store.cache();
            println!("has_session:        {}", store.has_session());
            println!("session_id:         {}", cache.session.session_id);
            println!(
                "verified_user_ids:  {}",
                cache.verified_user_ids.iter().collect::<Vec<_>>().join(",")
            );
            println!("linked_external_id: {}", cache.linked_external_id);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!(
        host = %config.api_host,
        tls = config.use_tls,
        "Configuration loaded. Restoring session cache..."
    );

    // --- 3. Restore Session ---
    let state = AppState::new(config);
    state.load_cache().await;

    // --- 4. Run Command ---
    run(&state, &cli.command).await?;

    // --- 5. Persist ---
    if cli.command.changes_state() {
        state
            .client
            .save_cache()
            .await
            .context("Failed to save session cache")?;
    }
    Ok(())
}

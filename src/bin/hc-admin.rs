use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Serialize;

use health_check_pool::config::loader::load_config;
use health_check_pool::observability::logging;
use health_check_pool::{Services, StaleSessionReaper};

#[derive(Parser)]
#[command(name = "hc-admin")]
#[command(about = "Administration CLI for the health-check coordinator", long_about = None)]
struct Cli {
    /// TOML configuration file; environment variables override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database file, overriding the configuration.
    #[arg(short, long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and its tables
    Init,
    /// Show credential pool capacity and in-progress checks
    Status,
    /// List active proxies in failover order
    Proxies,
    /// Show one node's check state and history
    Node {
        /// Node id
        id: String,
        /// Also print the live updates of its current session
        #[arg(long)]
        updates: bool,
    },
    /// Release a credential hold
    Release {
        #[arg(long)]
        user: String,
        #[arg(long)]
        session: String,
    },
    /// Run one stale-session sweep now
    Reap,
}

#[derive(Serialize)]
struct StatusView {
    pool: health_check_pool::pool::PoolStatus,
    active_checks: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.database.path = db;
    }
    logging::init("warn");

    let services = Services::start(config)?;

    match cli.command {
        Commands::Init => {
            println!("Database ready at {}", services.config.load().database.path.display());
        }
        Commands::Status => {
            let view = StatusView {
                pool: services.pool.pool_status().await?,
                active_checks: services.tracker.active_check_count().await?,
            };
            print_json(&view)?;
        }
        Commands::Proxies => {
            print_json(&services.proxies.list_active().await?)?;
        }
        Commands::Node { id, updates } => {
            let record = services.tracker.node_record(&id).await?;
            print_json(&record)?;
            if updates {
                if let Some(session) = &record.current_session_id {
                    print_json(&services.tracker.live_updates(session).await?)?;
                }
            }
        }
        Commands::Release { user, session } => {
            let released = services.pool.release(&user, &session).await?;
            if released {
                println!("Released {} from session {}", user, session);
            } else {
                eprintln!("Session {} was not holding {}", session, user);
            }
        }
        Commands::Reap => {
            let reaper = StaleSessionReaper::new(
                services.pool.clone(),
                services.tracker.clone(),
                services.config.clone(),
            );
            print_json(&reaper.reap_once().await?)?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

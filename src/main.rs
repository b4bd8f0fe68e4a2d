//! # Pollination Station CLI (`pollen`)
//!
//! ## Usage
//!
//! ```bash
//! pollen --config ./config/pollen.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pollen init` | Create the SQLite database and schema |
//! | `pollen serve` | Start the HTTP action server |
//! | `pollen refresh need <ID>` | Recompute pollen for one need |
//! | `pollen refresh dao <ID>` | Recompute pollen for every need a DAO touches |
//! | `pollen matches` | List enriched pollen, highest confidence first |
//!
//! ## Examples
//!
//! ```bash
//! pollen init
//! pollen serve
//! pollen refresh dao 1
//! pollen matches --dao 1 --min-confidence 0.8
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pollination_station::config;
use pollination_station::matching::NeedRefresh;
use pollination_station::migrate;
use pollination_station::models::{PollenDetail, PollenQuery};
use pollination_station::server;
use pollination_station::service::{self, PollinationService};
use pollination_station::store::sqlite::SqliteStore;

/// Pollination Station: match DAO needs with DAOs that can fulfill them.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/pollen.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "pollen",
    about = "Pollination Station: embedding-based matching of DAO needs to collaborators",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/pollen.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Start the HTTP action server on `[server].bind`.
    Serve,

    /// Recompute pollen matches.
    Refresh {
        #[command(subcommand)]
        target: RefreshTarget,
    },

    /// List pollen matches with both DAOs and the need.
    Matches {
        /// Only pollen where this DAO is either party.
        #[arg(long)]
        dao: Option<i64>,

        /// Only pollen for this need.
        #[arg(long)]
        need: Option<i64>,

        /// Minimum confidence score (inclusive).
        #[arg(long)]
        min_confidence: Option<f64>,
    },
}

#[derive(Subcommand)]
enum RefreshTarget {
    /// Refresh one need.
    Need {
        /// Need id.
        id: i64,
    },
    /// Refresh every need the DAO owns or currently fulfills.
    Dao {
        /// DAO id.
        id: i64,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,pollination_station=debug")),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Refresh { target } => {
            let service = PollinationService::open(&cfg).await?;
            match target {
                RefreshTarget::Need { id } => {
                    let report = service.engine().refresh_matches_for_need(id).await?;
                    print_need_refresh(&report);
                }
                RefreshTarget::Dao { id } => {
                    let report = service.engine().refresh_matches_for_dao(id).await?;
                    println!(
                        "DAO {}: {} needs refreshed, {} failed",
                        report.dao_id,
                        report.refreshed.len(),
                        report.failures.len()
                    );
                    for need in &report.refreshed {
                        print_need_refresh(need);
                    }
                    for failure in &report.failures {
                        println!("  need {} failed: {}", failure.need_id, failure.error);
                    }
                }
            }
        }
        Commands::Matches {
            dao,
            need,
            min_confidence,
        } => {
            // Read-only: no embedding or rationale provider is built.
            let store = SqliteStore::open(&cfg).await?;
            let pollen = service::list_matches(
                &store,
                &PollenQuery {
                    dao_id: dao,
                    need_id: need,
                    min_confidence,
                },
            )
            .await?;
            if pollen.is_empty() {
                println!("No pollen found.");
            }
            for detail in &pollen {
                print_pollen(detail);
            }
        }
    }

    Ok(())
}

fn print_need_refresh(report: &NeedRefresh) {
    println!(
        "Need {}: {} pollen, {} failed, {} pruned",
        report.need_id,
        report.pollen.len(),
        report.failures.len(),
        report.pruned
    );
    for detail in &report.pollen {
        print_pollen(detail);
    }
    for failure in &report.failures {
        println!("  candidate DAO {} failed: {}", failure.dao_id, failure.error);
    }
}

fn print_pollen(detail: &PollenDetail) {
    println!(
        "  [{:.2}] need {} ({}) : {} -> {}",
        detail.pollen.confidence_score,
        detail.need.id,
        detail.need.description,
        detail.requesting_dao.name,
        detail.fulfilling_dao.name
    );
    println!("         {}", detail.pollen.collaboration_description);
}

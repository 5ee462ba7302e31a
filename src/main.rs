use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use card_offer::{
    api::{self, LedgerQuery, TransitionInput},
    config::Config,
    service::MarketplaceService,
    types::Actor,
};

#[derive(Parser)]
#[command(version, about = "Admin console for the card-offer request ledger")]
struct Cli {
    /// JSON config file; defaults are used when omitted
    #[arg(short, long)]
    config: Option<String>,

    /// Overrides the database directory from the config
    #[arg(long)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Browse the ledger, latest first
    Ledger {
        #[arg(long)]
        request_id: Option<String>,
        #[arg(long)]
        event_type: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print a request and its chronological timeline
    Show { request_id: String },
    /// Approve a submitted request
    Approve {
        request_id: String,
        #[arg(long)]
        admin: String,
    },
    /// Reject a request that has not been matched
    Reject {
        request_id: String,
        #[arg(long)]
        admin: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Mark a matched request completed
    Complete {
        request_id: String,
        #[arg(long)]
        admin: String,
    },
    /// Cancel a request as admin
    Cancel {
        request_id: String,
        #[arg(long)]
        admin: String,
        #[arg(long)]
        reason: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,card_offer=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from_file(path).context("loading config")?,
        None => Config::default(),
    };
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    let db = sled::open(&config.data_dir)
        .with_context(|| format!("opening database at {}", config.data_dir))?;
    let service = MarketplaceService::new(Arc::new(db), config)?;

    let (body, ok) = match cli.command {
        Commands::Ledger {
            request_id,
            event_type,
            limit,
        } => {
            let query = LedgerQuery {
                request_id,
                event_type,
                limit,
            };
            let response = api::handle_ledger_read(&service, &query);
            (response.to_json(), response.ok)
        }
        Commands::Show { request_id } => {
            let request = service.request(&request_id)?;
            let timeline = api::handle_request_timeline(&service, &request_id);
            let body = serde_json::json!({
                "ok": timeline.ok,
                "request": request,
                "timeline": timeline.body.map(|t| t.items),
            });
            (serde_json::to_string_pretty(&body)?, timeline.ok)
        }
        Commands::Approve { request_id, admin } => {
            transition(&service, &admin, request_id, "ADMIN_APPROVED", None)
        }
        Commands::Reject {
            request_id,
            admin,
            reason,
        } => transition(&service, &admin, request_id, "REJECTED", reason),
        Commands::Complete { request_id, admin } => {
            transition(&service, &admin, request_id, "COMPLETED", None)
        }
        Commands::Cancel {
            request_id,
            admin,
            reason,
        } => transition(&service, &admin, request_id, "CANCELLED", reason),
    };

    service.flush()?;
    println!("{body}");
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn transition(
    service: &MarketplaceService,
    admin: &str,
    request_id: String,
    target: &str,
    reason: Option<String>,
) -> (String, bool) {
    let input = TransitionInput {
        request_id,
        target_status: target.to_string(),
        expected_status: None,
        reason,
    };
    let response = api::handle_transition(service, &Actor::admin(admin), &input);
    (response.to_json(), response.ok)
}

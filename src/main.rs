use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand};
use fundledger::core::log::init_logging;
use fundledger::core::model::{CollectiveId, SchemeVersion};
use fundledger::{AppCommand, BalanceQuery};
use std::path::PathBuf;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to optional configuration file
    #[arg(short, long, global = true)]
    config_path: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Clone)]
struct QueryArgs {
    /// Currency to report in (ISO 4217 code)
    #[arg(long)]
    currency: Option<String>,

    /// Accounting scheme: v1 or v2
    #[arg(long)]
    scheme: Option<SchemeVersion>,

    /// Inclusive start of the window (RFC 3339)
    #[arg(long)]
    start: Option<DateTime<Utc>>,

    /// Exclusive end of the window (RFC 3339)
    #[arg(long)]
    end: Option<DateTime<Utc>>,

    /// Date of the FX rates to convert with (RFC 3339)
    #[arg(long)]
    fx_date: Option<DateTime<Utc>>,

    /// Subtract expenses that are scheduled or being paid out
    #[arg(long)]
    blocked_funds: bool,

    /// Count refunded transactions
    #[arg(long)]
    include_refunded: bool,
}

impl From<QueryArgs> for BalanceQuery {
    fn from(args: QueryArgs) -> Self {
        BalanceQuery {
            currency: args.currency,
            version: args.scheme,
            start_date: args.start,
            end_date: args.end,
            fx_date: args.fx_date,
            blocked_funds: args.blocked_funds,
            include_refunded: args.include_refunded,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create default configuration
    Setup,
    /// Load a JSON ledger file into the store
    Import { file: PathBuf },
    /// Show the balance and received totals of one collective
    Balance {
        collective_id: CollectiveId,
        #[command(flatten)]
        query: QueryArgs,
    },
    /// Show balances of several collectives in one currency
    Balances {
        #[arg(required = true)]
        collective_ids: Vec<CollectiveId>,
        #[command(flatten)]
        query: QueryArgs,
    },
    /// Show the total money managed by a host
    MoneyManaged {
        host_id: CollectiveId,
        #[command(flatten)]
        query: QueryArgs,
    },
    /// Show the projected yearly income of a collective
    YearlyIncome { collective_id: CollectiveId },
    /// Show point-in-time balances in the host's currency
    HostSnapshot {
        host_id: CollectiveId,
        #[arg(required = true)]
        collective_ids: Vec<CollectiveId>,
        /// Only count transactions created before this instant (RFC 3339)
        #[arg(long)]
        as_of: Option<DateTime<Utc>>,
    },
}

impl TryFrom<Commands> for AppCommand {
    type Error = anyhow::Error;

    fn try_from(cmd: Commands) -> Result<AppCommand> {
        Ok(match cmd {
            Commands::Setup => anyhow::bail!("Setup command should be handled separately"),
            Commands::Import { file } => AppCommand::Import { file },
            Commands::Balance {
                collective_id,
                query,
            } => AppCommand::Balance {
                collective_id,
                query: query.into(),
            },
            Commands::Balances {
                collective_ids,
                query,
            } => AppCommand::Balances {
                collective_ids,
                query: query.into(),
            },
            Commands::MoneyManaged { host_id, query } => AppCommand::MoneyManaged {
                host_id,
                query: query.into(),
            },
            Commands::YearlyIncome { collective_id } => AppCommand::YearlyIncome { collective_id },
            Commands::HostSnapshot {
                host_id,
                collective_ids,
                as_of,
            } => AppCommand::HostSnapshot {
                host_id,
                collective_ids,
                as_of,
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let result = match cli.command {
        Some(Commands::Setup) => fundledger::cli::setup::setup(),
        Some(cmd) => match AppCommand::try_from(cmd) {
            Ok(command) => fundledger::run_command(command, cli.config_path.as_deref()).await,
            Err(e) => Err(e),
        },
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    };

    if let Err(e) = &result {
        tracing::error!(error = %e, "Application failed");
    }
    result
}

//! # mp-cli: The "Console" of mergeproxy
//!
//! Ask every configured backend one question and print one answer.
//!
//! - `mp logspaces`: Union of all logspace names.
//! - `mp count <logspace> --from --to`: Total matching messages.
//! - `mp filter <logspace> --from --to`: First matching records, merged by
//!   `processed_timestamp`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use mp_client::{config::DEFAULT_CONFIG_PATH, FederationConfig};
use mp_core::{
    ExcludedBackend, FailurePolicy, Federated, LogRecord, MergeProxy, Query, DEFAULT_LIMIT,
    DEFAULT_OFFSET,
};

/// Query several log-search backends as if they were one.
#[derive(Parser)]
#[command(name = "mp", version, about, long_about = None)]
struct Cli {
    /// Path to config file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Skip failing backends instead of failing the command.
    #[arg(long, global = true)]
    partial: bool,

    /// Output format.
    #[arg(long, global = true, value_enum, default_value_t = Format::Json)]
    format: Format,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, ValueEnum)]
enum Format {
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// List the logspaces of every backend.
    Logspaces,

    /// Count matching messages across backends.
    Count {
        logspace: String,
        #[command(flatten)]
        range: Range,
    },

    /// Fetch matching records, merged by processed_timestamp.
    Filter {
        logspace: String,
        #[command(flatten)]
        range: Range,

        #[arg(long, default_value_t = DEFAULT_LIMIT)]
        limit: u64,

        #[arg(long, default_value_t = DEFAULT_OFFSET)]
        offset: u64,
    },
}

#[derive(clap::Args)]
struct Range {
    /// Start of the time range (unix timestamp).
    #[arg(long, allow_hyphen_values = true)]
    from: i64,

    /// End of the time range (unix timestamp).
    #[arg(long, allow_hyphen_values = true)]
    to: i64,

    /// Backend search expression.
    #[arg(long)]
    search: Option<String>,
}

impl Range {
    fn query(self, logspace: String) -> Query {
        let query = Query::new(logspace, self.from, self.to);
        match self.search {
            Some(expression) => query.with_search_expression(expression),
            None => query,
        }
    }
}

#[derive(Tabled)]
struct LogspaceRow {
    #[tabled(rename = "Logspace")]
    name: String,
}

#[derive(Tabled)]
struct CountRow {
    #[tabled(rename = "Logspace")]
    logspace: String,
    #[tabled(rename = "Messages")]
    count: u64,
}

#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Timestamp")]
    timestamp: i64,
    #[tabled(rename = "Fields")]
    fields: String,
}

impl From<&LogRecord> for RecordRow {
    fn from(record: &LogRecord) -> Self {
        let fields = record
            .fields()
            .iter()
            .filter(|(name, _)| name.as_str() != mp_core::PROCESSED_TIMESTAMP)
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            timestamp: record.processed_timestamp(),
            fields,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("mp: cannot start runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(async_main(cli)) {
        eprintln!("mp: {e}");
        std::process::exit(1);
    }
}

async fn async_main(cli: Cli) -> mp_core::Result<()> {
    let mut config = FederationConfig::load(&cli.config)?;
    if cli.partial {
        config.proxy.failure_policy = FailurePolicy::Partial;
    }

    tracing::debug!(backends = config.backends.len(), config = %cli.config.display(), "connecting");
    let proxy = mp_client::connect(&config).await?;
    let outcome = run(&proxy, cli.command, cli.format).await;
    proxy.logout_all().await;
    outcome
}

async fn run(proxy: &MergeProxy, command: Commands, format: Format) -> mp_core::Result<()> {
    match command {
        Commands::Logspaces => {
            let logspaces = proxy.list_logspaces().await?;
            print(&logspaces, format, |names| {
                names.iter().map(|name| LogspaceRow { name: name.clone() }).collect::<Vec<_>>()
            })
        }
        Commands::Count { logspace, range } => {
            let query = range.query(logspace);
            let total = proxy.count(&query).await?;
            print(&total, format, |count| {
                vec![CountRow {
                    logspace: query.logspace.clone(),
                    count: *count,
                }]
            })
        }
        Commands::Filter {
            logspace,
            range,
            limit,
            offset,
        } => {
            let query = range.query(logspace).with_limit(limit).with_offset(offset);
            let records = proxy.filter(&query).await?;
            print(&records, format, |records| {
                records.iter().map(RecordRow::from).collect::<Vec<_>>()
            })
        }
    }
    Ok(())
}

fn print<T, R, F>(answer: &Federated<T>, format: Format, rows: F)
where
    T: Serialize,
    R: Tabled,
    F: FnOnce(&T) -> Vec<R>,
{
    report_excluded(&answer.excluded);
    match format {
        Format::Json => match serde_json::to_string_pretty(&answer.value) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("mp: cannot encode result: {e}"),
        },
        Format::Table => {
            let mut table = Table::new(rows(&answer.value));
            table.with(Style::rounded());
            println!("{table}");
        }
    }
}

fn report_excluded(excluded: &[ExcludedBackend]) {
    for backend in excluded {
        eprintln!(
            "mp: backend '{}' excluded ({}): {}",
            backend.backend, backend.kind, backend.reason
        );
    }
}

use adash_ingest::{IngestConfig, IngestPipeline, IngestRequest};
use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "adash-cli")]
#[command(about = "Agency dashboard report ingestion")]
struct Cli {
    /// Log output format; falls back to ADASH_LOG_FORMAT, then `pretty`.
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP handlers on PORT.
    Serve,
    /// Ingest the landing page report of one client.
    Ads {
        #[arg(long)]
        cid: String,
        #[arg(long)]
        name: Option<String>,
        /// ISO date; the window runs from here to today. Defaults to yesterday.
        #[arg(long)]
        startdate: Option<String>,
    },
    /// Ingest the performance audit of one URL.
    Audit {
        #[arg(long)]
        url: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

fn init_logging(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty())
            .init(),
    }
}

fn log_format_from_env() -> LogFormat {
    match std::env::var("ADASH_LOG_FORMAT") {
        Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format.unwrap_or_else(log_format_from_env));

    let config = IngestConfig::from_env()?;
    let request = match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => return adash_web::serve(&config).await,
        Commands::Ads {
            cid,
            name,
            startdate,
        } => IngestRequest::ads(
            Some(&cid),
            name.as_deref(),
            startdate.as_deref(),
            Utc::now().date_naive(),
        ),
        Commands::Audit { url } => IngestRequest::audit(Some(&url)),
    };

    let request = request.map_err(|e| anyhow!(e))?;
    let pipeline = IngestPipeline::from_config(&config)?;
    match pipeline.run(&request).await {
        Ok(outcome) => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Err(err) => Err(anyhow!(
            "{} ({}, retriable: {})",
            err,
            err.code(),
            err.is_retriable()
        )),
    }
}

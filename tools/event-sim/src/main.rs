mod scenario;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use event_dispatch::retry::RetryConfig;
use event_dispatch::{
    connect_and_run, run_batch, BatchOutcome, BatchReport, ConfigError, Connection,
    DispatchConfig, EventDispatcher, InMemoryBroker, OutboundEvent, SetupError,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_CLEAN: u8 = 0;
const EXIT_SETUP_FAILURE: u8 = 1;
const EXIT_INCOMPLETE_BATCH: u8 = 2;

/// Publish lifecycle and interaction events to the topic exchange, pausing
/// between each so a downstream consumer's logs can be followed.
///
/// Broker and batch settings come from the environment (`RABBITMQ_*`,
/// `EVENT_EXCHANGE`, `EVENT_DELAY_MS`, `EVENT_SOURCE`); flags override them.
#[derive(Debug, Parser)]
#[command(name = "event-sim", version)]
struct Cli {
    /// JSON array of {"event_name", "payload"} objects (built-in simulation if omitted)
    #[arg(long)]
    events: Option<PathBuf>,

    /// Exchange to publish to
    #[arg(long)]
    exchange: Option<String>,

    /// Pause between events in milliseconds
    #[arg(long)]
    delay_ms: Option<u64>,

    /// Value of the envelope's `source` field
    #[arg(long)]
    source: Option<String>,

    /// Attempts per failed event, including the original (1 disables retry)
    #[arg(long, default_value_t = 1)]
    retry_attempts: u32,

    /// Print the envelopes that would be sent and exit
    #[arg(long)]
    dry_run: bool,

    /// Publish to an in-process broker instead of RabbitMQ
    #[arg(long)]
    in_memory: bool,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,event_dispatch=info,event_sim=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Usage errors are setup failures; `--help` and `--version` are not errors
fn usage_exit_code(err: &clap::Error) -> u8 {
    if err.use_stderr() {
        EXIT_SETUP_FAILURE
    } else {
        EXIT_CLEAN
    }
}

fn batch_exit_code(report: &BatchReport) -> u8 {
    if report.is_clean() {
        EXIT_CLEAN
    } else {
        EXIT_INCOMPLETE_BATCH
    }
}

/// Environment config with command-line overrides applied
fn resolve_config(
    from_env: Result<DispatchConfig, ConfigError>,
    cli: &Cli,
) -> anyhow::Result<DispatchConfig> {
    let mut cfg = from_env.context("invalid configuration")?;

    if let Some(exchange) = &cli.exchange {
        anyhow::ensure!(!exchange.is_empty(), "--exchange must not be empty");
        cfg.exchange = exchange.clone();
    }
    if let Some(delay_ms) = cli.delay_ms {
        cfg.inter_event_delay = Duration::from_millis(delay_ms);
    }
    if let Some(source) = &cli.source {
        anyhow::ensure!(!source.is_empty(), "--source must not be empty");
        cfg.source = source.clone();
    }
    Ok(cfg)
}

/// Run the batch against RabbitMQ, or an in-process broker when `in_memory`
async fn run(
    cfg: &DispatchConfig,
    events: &[OutboundEvent],
    retry: Option<&RetryConfig>,
    in_memory: bool,
) -> Result<BatchReport, SetupError> {
    if !in_memory {
        return connect_and_run(cfg, events, retry).await;
    }

    let connection = Connection::from_broker(Arc::new(InMemoryBroker::new()));
    let dispatcher = EventDispatcher::new(cfg.source.clone());
    run_batch(
        &connection,
        &dispatcher,
        &cfg.exchange,
        events,
        cfg.inter_event_delay,
        retry,
    )
    .await
}

fn print_report(report: &BatchReport) {
    for (idx, entry) in report.entries().iter().enumerate() {
        match &entry.result {
            Ok(receipt) => println!(
                "[{}] ok    {} -> {}{}",
                idx + 1,
                entry.event_name,
                receipt.event_id,
                if receipt.confirmed { " (confirmed)" } else { "" }
            ),
            Err(e) => println!("[{}] FAIL  {}: {}", idx + 1, entry.event_name, e),
        }
    }

    let verdict = match report.outcome() {
        BatchOutcome::Clean => "clean run",
        BatchOutcome::Partial => "partial run",
        BatchOutcome::Failed => "failed run",
    };
    println!(
        "\n{}/{} events dispatched to '{}' ({})",
        report.succeeded(),
        report.len(),
        report.exchange,
        verdict
    );
}

fn print_dry_run(cfg: &DispatchConfig, events: &[OutboundEvent]) -> anyhow::Result<()> {
    let dispatcher = EventDispatcher::new(cfg.source.clone());
    for (idx, event) in events.iter().enumerate() {
        match dispatcher.envelope(&event.event_name, event.payload.clone()) {
            Ok(envelope) => println!("{}", serde_json::to_string(&envelope)?),
            Err(e) => println!("[{}] FAIL  {}: {}", idx + 1, event.event_name, e),
        }
    }
    Ok(())
}

// An `Err` from main exits with status 1 (setup or config failure).
#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_tracing();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            e.print()?;
            return Ok(ExitCode::from(usage_exit_code(&e)));
        }
    };

    let cfg = resolve_config(DispatchConfig::from_env(), &cli)?;
    let events = match &cli.events {
        Some(path) => scenario::load(path)?,
        None => scenario::lifecycle_simulation(),
    };
    tracing::info!(
        exchange = %cfg.exchange,
        events = events.len(),
        delay_ms = cfg.inter_event_delay.as_millis() as u64,
        "config loaded"
    );

    if cli.dry_run {
        print_dry_run(&cfg, &events)?;
        return Ok(ExitCode::from(EXIT_CLEAN));
    }

    let retry = (cli.retry_attempts > 1).then(|| RetryConfig {
        max_attempts: cli.retry_attempts,
        ..RetryConfig::default()
    });

    let report = run(&cfg, &events, retry.as_ref(), cli.in_memory).await?;
    print_report(&report);

    Ok(ExitCode::from(batch_exit_code(&report)))
}

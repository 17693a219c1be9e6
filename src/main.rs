use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sqlgate::config::{GatewayConfig, LoggingConfig};
use sqlgate::ratelimit::{Clock, ManualClock, SystemClock};
use sqlgate::{Decision, KeyTemplateEngine, LimitRef, RequestContext};

/// Operator tool for the sqlgate admission limiter.
#[derive(Debug, Parser)]
#[command(name = "sqlgate", version, about)]
struct Cli {
    /// YAML configuration file; SQLGATE__* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration and list the configured pools
    Check,
    /// Replay synthetic requests through the limiter and print the decisions
    Simulate(SimulateArgs),
}

#[derive(Debug, Args)]
struct SimulateArgs {
    /// Named pool to apply (repeatable, evaluated first and in order)
    #[arg(long = "pool")]
    pools: Vec<String>,

    /// Inline limit as RPS:BURST[:TEMPLATE] (repeatable, evaluated after pools)
    #[arg(long = "inline", value_parser = parse_inline)]
    inline: Vec<LimitRef>,

    /// Client IP of every simulated request
    #[arg(long, default_value = "127.0.0.1")]
    client_ip: String,

    /// Request path
    #[arg(long, default_value = "/")]
    path: String,

    /// Request header as NAME=VALUE (repeatable)
    #[arg(long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Number of requests to send
    #[arg(short = 'n', long, default_value_t = 10)]
    requests: u32,

    /// Pause between requests, in milliseconds
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,

    /// Wait out the pauses on the wall clock instead of a simulated one
    #[arg(long)]
    realtime: bool,
}

fn parse_inline(value: &str) -> Result<LimitRef, String> {
    let mut parts = value.splitn(3, ':');
    let rps = parts
        .next()
        .and_then(|p| p.parse::<f64>().ok())
        .ok_or_else(|| format!("invalid requests per second in {:?}", value))?;
    let burst = parts
        .next()
        .and_then(|p| p.parse::<u32>().ok())
        .ok_or_else(|| format!("invalid burst in {:?}", value))?;
    Ok(LimitRef::inline(rps, burst, parts.next()))
}

fn parse_header(value: &str) -> Result<(String, String), String> {
    value
        .split_once('=')
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .ok_or_else(|| format!("expected NAME=VALUE, got {:?}", value))
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = GatewayConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    match &cli.config {
        Some(path) => info!(path = %path.display(), "Loaded configuration"),
        None => info!("Loaded configuration from environment"),
    }

    // Replays advance a simulated clock unless asked to run in real time.
    let manual = match &cli.command {
        Command::Simulate(args) if !args.realtime => Some(Arc::new(ManualClock::starting_now())),
        _ => None,
    };
    let clock: Arc<dyn Clock> = match &manual {
        Some(clock) => clock.clone() as Arc<dyn Clock>,
        None => Arc::new(SystemClock),
    };

    let limiter = config
        .rate_limiting
        .limiter_builder(Arc::new(KeyTemplateEngine::new()))
        .clock(clock)
        .build()
        .context("Invalid rate limiting configuration")?;

    match cli.command {
        Command::Check => {
            println!("configuration OK: {} pool(s)", limiter.pool_names().len());
            for name in limiter.pool_names() {
                if let Some(pool) = limiter.get_pool(&name) {
                    println!(
                        "  {:<24} rps={:<8} burst={:<6} key={}",
                        pool.name(),
                        pool.rate(),
                        pool.burst(),
                        pool.key_template()
                    );
                }
            }
        }
        Command::Simulate(args) => {
            let limits: Vec<LimitRef> = args
                .pools
                .iter()
                .map(LimitRef::pool)
                .chain(args.inline.iter().cloned())
                .collect();

            let ctx = args
                .headers
                .iter()
                .fold(
                    RequestContext::new(&args.client_ip).with_path(&args.path),
                    |ctx, (name, value)| ctx.with_header(name, value),
                )
                .with_method("GET");

            info!(
                limits = limits.len(),
                requests = args.requests,
                client_ip = %args.client_ip,
                "Starting simulation"
            );

            for request in 1..=args.requests {
                match limiter.allow(&limits, &ctx)? {
                    Decision::Allowed => println!("{:>5}  allowed", request),
                    Decision::Denied { retry_after } => {
                        println!("{:>5}  denied   retry_after={}s", request, retry_after.as_secs())
                    }
                }

                if args.interval_ms > 0 && request < args.requests {
                    let pause = Duration::from_millis(args.interval_ms);
                    match &manual {
                        Some(clock) => clock.advance(pause),
                        None => tokio::time::sleep(pause).await,
                    }
                }
            }

            println!("{}", serde_json::to_string_pretty(&limiter.snapshot())?);
        }
    }

    Ok(())
}

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use windowgate::config::WindowgateConfig;
use windowgate::ratelimit::{Decision, ManualClock};

/// Inspect and dry-run windowgate rate limit policies.
#[derive(Debug, Parser)]
#[command(name = "windowgate", version, about)]
struct Cli {
    /// Path to a YAML policy file (built-in policies when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the registered policies
    Policies,
    /// Replay a sequence of checks against a simulated clock
    Simulate {
        /// Policy to check against
        #[arg(short, long)]
        policy: String,
        /// Identifier to check
        #[arg(short, long, default_value = "127.0.0.1")]
        identifier: String,
        /// Number of checks
        #[arg(short = 'n', long, default_value_t = 10)]
        calls: u32,
        /// Simulated milliseconds between checks
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
}

/// One simulated check, as emitted with `--log-json`.
#[derive(Debug, Serialize)]
struct SimulatedCall<'a> {
    elapsed_secs: f64,
    call: u32,
    #[serde(flatten)]
    decision: &'a Decision,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let json = cli.log_json;
    init_tracing(json);

    let config = match &cli.config {
        Some(path) => WindowgateConfig::from_file(path)?,
        None => WindowgateConfig::default(),
    };
    info!(
        policies = config.policies.len(),
        key_scope = ?config.limiter.key_scope,
        "Configuration loaded"
    );

    match cli.command {
        Command::Policies => {
            let registry = config.registry()?;
            for name in registry.names() {
                let policy = registry.get(name)?;
                println!(
                    "{:<16} {:>6} per {:>6}s  {}",
                    policy.name(),
                    policy.max_admissions(),
                    policy.window().as_secs(),
                    policy.denial_message()
                );
            }
        }
        Command::Simulate {
            policy,
            identifier,
            calls,
            interval_ms,
        } => {
            let clock = ManualClock::default();
            let limiter = config.build_limiter_with_clock(clock.clone())?;
            let step = Duration::from_millis(interval_ms);

            for call in 1..=calls {
                let decision = limiter.check(&identifier, &policy)?;
                let elapsed = step * (call - 1);
                if json {
                    let line = SimulatedCall {
                        elapsed_secs: elapsed.as_secs_f64(),
                        call,
                        decision: &decision,
                    };
                    println!("{}", serde_json::to_string(&line)?);
                } else {
                    println!(
                        "t={:>8.3}s call={:<4} {} remaining={} retry_after={}s",
                        elapsed.as_secs_f64(),
                        call,
                        if decision.allowed { "allow" } else { "deny " },
                        decision.remaining,
                        decision.retry_after
                    );
                }
                clock.advance(step);
            }
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::auth::UnavailableClient;
use tollgate::config::{EngineConfig, LoggingConfig};
use tollgate::ratelimit::InMemoryCounterBackend;
use tollgate::{Policy, PolicyDocument, PolicyEngine, PolicyStore, RequestContext};

/// Request-time authorization and rate limit policy engine.
#[derive(Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Engine configuration file; `TOLLGATE_*` environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a policy and report any errors
    Validate {
        #[arg(long)]
        policy: PathBuf,
    },
    /// Evaluate a request against a policy and print each decision as JSON
    Check {
        #[arg(long)]
        policy: PathBuf,
        /// YAML description of the request
        #[arg(long)]
        request: PathBuf,
        /// Number of times to send the request
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::from_env()?,
    };
    init_tracing(&config.logging);

    match cli.command {
        Command::Validate { policy } => {
            let document = PolicyDocument::from_file(&policy)?;
            Policy::compile(document, &config)
                .with_context(|| format!("policy {} is invalid", policy.display()))?;
            println!("{}: ok", policy.display());
        }
        Command::Check {
            policy,
            request,
            repeat,
        } => {
            let document = PolicyDocument::from_file(&policy)?;
            let compiled = Policy::compile(document, &config)
                .with_context(|| format!("policy {} is invalid", policy.display()))?;

            let contents = std::fs::read_to_string(&request)
                .with_context(|| format!("reading request {}", request.display()))?;
            let request: RequestContext = serde_yaml::from_str(&contents)?;

            let remote = ["oauth2", "opa", "passthrough", "custom"];
            if compiled
                .auth
                .checks()
                .iter()
                .any(|c| remote.contains(&c.check.kind()))
            {
                warn!("No auth transport is configured; remote checks will fail as unavailable");
            }

            let engine = PolicyEngine::new(
                config,
                Arc::new(PolicyStore::new(compiled)),
                Arc::new(UnavailableClient),
                Arc::new(InMemoryCounterBackend::new()),
            );
            info!(repeat, "Evaluating request");
            for _ in 0..repeat {
                let decision = engine.handle(request.clone()).await;
                println!("{}", serde_json::to_string(&decision)?);
            }
        }
    }
    Ok(())
}

/// `RUST_LOG` wins over the configured level. Logs go to stderr so stdout
/// carries only command output.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

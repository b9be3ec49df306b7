use std::io::Read as _;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::json;

use ditto_admission::gateway::auth::hash_credential;
use ditto_admission::gateway::observability::init_tracing;
use ditto_admission::gateway::{GatewayConfig, ModelCatalog, TokenEstimator};

#[derive(Parser)]
#[command(name = "ditto-admission", about = "Operator tools for the admission gateway")]
struct Cli {
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the stored form (lowercase hex SHA-256) of a raw credential.
    HashKey { token: String },
    /// Load and validate a gateway config, then print a summary.
    CheckConfig {
        path: PathBuf,
        /// Also check that the configured Redis answers.
        #[arg(long)]
        ping_redis: bool,
    },
    /// Print the pre-flight token estimates for a request body (file or `-` for stdin).
    Estimate {
        #[arg(long)]
        model: String,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(default_value = "-")]
        input: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs)?;

    match cli.command {
        Command::HashKey { token } => {
            println!("{}", hash_credential(token.trim()));
        }
        Command::CheckConfig { path, ping_redis } => {
            let config = GatewayConfig::load(&path)?;
            #[cfg(not(feature = "gateway-store-redis"))]
            if ping_redis {
                return Err("--ping-redis needs the gateway-store-redis feature".into());
            }
            #[cfg(feature = "gateway-store-redis")]
            if ping_redis {
                let redis = config
                    .redis
                    .as_ref()
                    .ok_or("--ping-redis needs a [redis] section")?;
                ditto_admission::gateway::RedisStore::from_config(redis)?
                    .ping()
                    .await?;
                tracing::info!("redis reachable");
            }
            let summary = json!({
                "path": path.display().to_string(),
                "credentials": config.credentials.len(),
                "products": config.products.keys().collect::<Vec<_>>(),
                "throttles": config.throttles.iter().map(|t| t.name()).collect::<Vec<_>>(),
                "redis": config.redis.is_some(),
                "debug_skip_application_check": config.debug_skip_application_check,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Estimate {
            model,
            config,
            input,
        } => {
            let mut raw = String::new();
            if input == "-" {
                std::io::stdin().read_to_string(&mut raw)?;
            } else {
                raw = std::fs::read_to_string(&input)?;
            }
            let body: serde_json::Value = serde_json::from_str(&raw)?;

            let mut estimator = TokenEstimator::new();
            if let Some(path) = config {
                let config = GatewayConfig::load(&path)?;
                estimator = estimator
                    .with_default_max_output_tokens(config.estimator.default_max_output_tokens);
                if let Some(pricing) = config.catalog.litellm_pricing_path.as_ref() {
                    let catalog =
                        ModelCatalog::from_litellm_json_str(&std::fs::read_to_string(pricing)?)?;
                    estimator = estimator.with_catalog(std::sync::Arc::new(catalog));
                }
            }
            let input_tokens = estimator.estimate_request(&model, &body);
            let max_output_tokens = estimator.estimate_max_output(&model, &body, input_tokens);
            println!(
                "{}",
                json!({
                    "model": model,
                    "input_tokens": input_tokens,
                    "max_output_tokens": max_output_tokens,
                })
            );
        }
    }
    Ok(())
}

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use contact_sync::{errors, load_config, CircuitBreakerRegistry, RecoveryManager};

const USAGE: &str = "usage: contact-sync <classify <error-code> [message] | config | health>";

fn main() -> Result<()> {
    // Load environment variables from .env file if it exists
    let env_file_path = dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "contact_sync=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true).with_writer(std::io::stderr))
        .init();

    match env_file_path {
        Some(path) => info!("Loaded environment variables from {}", path.display()),
        None => debug!("No .env file found. Using existing environment variables."),
    };

    let config = load_config()?;
    let registry = Arc::new(CircuitBreakerRegistry::with_default_config(config.breaker.clone()));
    let manager = RecoveryManager::new(config.recovery.clone(), registry);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let output = match args.first().map(String::as_str) {
        Some("classify") => {
            let code = args.get(1).ok_or_else(|| anyhow!(USAGE))?;
            let message = args.get(2).map(String::as_str).unwrap_or("");
            let recommendations = manager.recovery_recommendations(&errors::service(code.as_str(), message), None);
            serde_json::to_string_pretty(&recommendations)?
        }
        Some("config") => serde_json::to_string_pretty(&config)?,
        Some("health") => serde_json::to_string_pretty(&manager.health_status())?,
        _ => return Err(anyhow!(USAGE)),
    };

    println!("{}", output);
    Ok(())
}

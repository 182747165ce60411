use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use storage_binder::account::{AccountController, ControllerSettings, StateStore};
use storage_binder::api::AccountApi;
use storage_binder::cli::{self, Cli};
use storage_binder::client::{HttpNotifier, NoopNotifier, ServerNotifier};
use storage_binder::config::{env_filter_or, BinderConfig};

#[tokio::main]
async fn main() {
    let args = Cli::parse();

    let config = BinderConfig::load_logged(&args.config, std::io::stderr);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter_or(config.log_filter()))
        .with_writer(std::io::stderr)
        .init();

    let notifier: Arc<dyn ServerNotifier> = if config.server.enabled {
        match HttpNotifier::new(&config.server.base_url, Duration::from_millis(config.server.timeout_ms)) {
            Ok(n) => Arc::new(n),
            Err(e) => {
                warn!("HTTP client unavailable ({}), server notifications disabled", e);
                Arc::new(NoopNotifier)
            }
        }
    } else {
        info!("Server notifications disabled by config");
        Arc::new(NoopNotifier)
    };

    let store = StateStore::new(config.state_path());
    let controller = match AccountController::open(store, notifier, ControllerSettings::from_config(&config)).await {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load account state: {}", e);
            std::process::exit(1);
        }
    };

    let api = AccountApi::new(controller.clone());
    let code = match cli::run(&api, args.command).await {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            error!("{}", e);
            1
        }
    };

    controller.shutdown().await;
    std::process::exit(code);
}

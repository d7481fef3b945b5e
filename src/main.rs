use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

use gatelink::admin;
use gatelink::classifier::ErrorClassifier;
use gatelink::config::{CliConfig, Command, ConfigError, GatewayConfig};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const APP_NAME: &str = "gatelink";

// -----------------------------------------------------------------------------
// ----- Main ------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = setup();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{APP_NAME}: {e}");
            ExitCode::FAILURE
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Setup -----------------------------------------------------------------

fn setup() -> CliConfig {
    // Parse args first, the log level comes from them
    let cli = CliConfig::from_args();
    init_tracing(&cli);
    cli
}

fn init_tracing(cli: &CliConfig) {
    let filter = EnvFilter::try_new(cli.log_level.filter_directive()).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

// -----------------------------------------------------------------------------
// ----- Run -------------------------------------------------------------------

async fn run(cli: CliConfig) -> Result<(), ConfigError> {
    cli.validate()?;
    let config = load_config(&cli).await?;

    match cli.command {
        Command::Classify { code, message } => {
            let classifier = ErrorClassifier::new().with_rules(config.error_codes);
            let info = classifier.format_error_info(code, &message.join(" "));
            println!("{}", admin::format_error_info(&info));
        }
        Command::Check => {
            println!("{}", admin::format_config(&config));
        }
    }

    Ok(())
}

async fn load_config(cli: &CliConfig) -> Result<GatewayConfig, ConfigError> {
    match &cli.config_file_location {
        Some(path) => {
            let config = GatewayConfig::from_file_async(path).await?;
            info!("loaded config from {}", path.display());
            Ok(config)
        }
        None => {
            info!("no config file given; using built-in defaults");
            Ok(GatewayConfig::default())
        }
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------

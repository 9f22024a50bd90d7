use clap::Parser;
use roi_mqtt_bridge::config::AppConfig;
use std::path::PathBuf;
use std::process::ExitCode;

/// Bridges a PubTrans ROI XML-over-TCP feed onto an MQTT topic.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Directory the ROI message templates are loaded from.
    #[arg(long, default_value = "templates")]
    templates: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AppConfig::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            // The logging subscriber isn't installed yet; a config load
            // failure is fatal at startup and must be reported directly.
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    roi_mqtt_bridge::logging::init(&config.logging);

    if let Err(err) = roi_mqtt_bridge::run(config, cli.templates).await {
        tracing::error!(error = %err, "fatal error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

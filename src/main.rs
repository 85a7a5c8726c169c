use color_eyre::{eyre::eyre, Result};
use realtimemq::config::RelayConfig;
use realtimemq::mqtt::mqtt_handler::ConnectionState;
use realtimemq::relay::Relay;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = RelayConfig::load().await?;
    setup_logging_env(config.logging.level());
    info!(
        "Starting realtimemq relay for {}:{}",
        config.broker.broker_host, config.broker.broker_port
    );

    let relay = Relay::from_config(config)?.start().await?;
    let mut states = relay.state_changes();

    let failure = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Unable to listen for shutdown signal: {}", e);
                }
                info!("Shutdown requested");
                break None;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break None;
                }
                let state = states.borrow().clone();
                if let ConnectionState::Failed(reason) = state {
                    error!("Relay cannot connect: {}", reason);
                    break Some(reason);
                }
            }
        }
    };

    let (_stopped, report) = relay.shutdown().await;
    info!(
        "Shutdown complete: {} drained, {} cancelled",
        report.drained,
        report.cancelled.len()
    );

    match failure {
        Some(reason) => Err(eyre!("broker connection failed: {}", reason)),
        None => Ok(()),
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    Ok(())
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

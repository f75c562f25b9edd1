use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use log::{error, info};
use tokio::sync::broadcast;

use presence::config::AppConfig;
use presence::dispatcher::{EventDispatcher, LogConsumer};
use presence::manager::{Components, Manager};
use presence::mqtt::{MqttAnnouncement, MqttClient};
use presence::ports::RandomAlternation;
use presence::presence::SystemClock;
use presence::probe::TcpProber;
use presence::store::{JsonFileStore, LastSeenStore, MemoryStore};

#[derive(Parser, Debug)]
#[command(version, about = "Announces who is home based on which phones answer on the network")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();

    let config = AppConfig::load(&args.config)
        .with_context(|| format!("reading {}", args.config.display()))?;
    let devices = config.device_configs()?;
    let scan = config.scan.clone().unwrap_or_default();

    let mut dispatcher = EventDispatcher::new(scan.consumer_queue(), scan.delivery_timeout());
    dispatcher.register(Arc::new(LogConsumer));

    let (announce_tx, mut announcements) = broadcast::channel(16);
    let mut mqtt_task = None;
    let mut mqtt_client = None;
    if let Some(mqtt_config) = &config.mqtt {
        let (client, mut eventloop) = MqttClient::new(mqtt_config);
        dispatcher.register(Arc::new(client.clone()));
        let loop_client = client.clone();
        let tx = announce_tx.clone();
        mqtt_task = Some(tokio::spawn(async move {
            loop_client.event_loop(&mut eventloop, tx).await;
        }));
        mqtt_client = Some(client);
    }

    let store: Arc<dyn LastSeenStore> = match config.state.as_ref().and_then(|s| s.path.clone()) {
        Some(path) => Arc::new(
            JsonFileStore::open(&path)
                .with_context(|| format!("opening state file {}", path.display()))?,
        ),
        None => Arc::new(MemoryStore::default()),
    };

    let components = Components {
        prober: Arc::new(TcpProber),
        ports: Arc::new(RandomAlternation::new(scan.auto_ports())),
        store,
        clock: Arc::new(SystemClock),
        dispatcher,
    };
    let manager = Manager::start(components, devices).await?;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    error!("Unable to listen for shutdown signal: {err}");
                }
                info!("Shutting down");
                break;
            }
            announcement = announcements.recv() => match announcement {
                Ok(MqttAnnouncement::ScanRequested) => manager.request_scan(),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    info!("Skipped {skipped} scan request(s)");
                    manager.request_scan();
                }
                // announce_tx is held by this function, so the channel never closes
                Err(broadcast::error::RecvError::Closed) => {}
            },
        }
    }

    manager.stop().await;
    if let Some(client) = mqtt_client {
        if let Err(err) = client.disconnect().await {
            error!("Error disconnecting from MQTT: {err:?}");
        }
    }
    if let Some(mut task) = mqtt_task {
        // give queued publishes a moment to reach the broker
        if tokio::time::timeout(Duration::from_secs(2), &mut task).await.is_err() {
            task.abort();
        }
    }
    drop(announce_tx);

    Ok(())
}

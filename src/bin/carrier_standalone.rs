//! carrier-standalone: single-process demo host.
//!
//! Wires the configured store (memory or SQLite) to the in-process channel
//! broker, registers a subscriber that answers `demo.ping` with a
//! `demo.pong` reply, publishes one ping and runs until Ctrl-C.
//!
//! ## Configuration
//! ```yaml
//! storage:
//!   type: sqlite
//!   sqlite:
//!     path: ./data/carrier.db
//! failed_retry_interval_secs: 5
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use carrier::config::{CarrierConfig, CONFIG_ENV_VAR};
use carrier::consumer::{ConsumerContext, HandlerResult};
use carrier::dispatcher::FailedInfo;
use carrier::transport::ChannelBroker;
use carrier::utils::bootstrap::init_tracing;
use carrier::Carrier;

#[derive(Debug, Serialize, Deserialize)]
struct Ping {
    sequence: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Pong {
    sequence: u64,
}

async fn on_ping(ctx: ConsumerContext, ping: Ping) -> HandlerResult<Pong> {
    info!(id = %ctx.message_id, sequence = ping.sequence, "Received ping");
    Ok(Pong {
        sequence: ping.sequence,
    })
}

async fn on_pong(ctx: ConsumerContext, pong: Pong) -> HandlerResult {
    info!(
        id = %ctx.message_id,
        correlation_id = ?ctx.correlation_id,
        sequence = pong.sequence,
        "Received pong"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    if config_path.is_none() {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            info!(path = %path, "Using configuration from environment");
        }
    }
    let config = CarrierConfig::load(config_path.as_deref())?;

    let broker = ChannelBroker::new();
    let mut carrier = Carrier::builder(config)
        .transport(Arc::new(broker.clone()))
        .consumer_factory(Arc::new(broker))
        .subscribers(|registry| {
            registry
                .subscribe_with_reply("demo.ping", None, on_ping)
                .subscribe("demo.pong", on_pong)
        })
        .on_failed_threshold(Arc::new(|failed: FailedInfo| {
            error!(
                kind = %failed.kind,
                id = failed.id,
                retries = failed.retries,
                "Message gave up"
            );
        }))
        .build()
        .await?;

    carrier.start().await?;

    let stored = carrier
        .publisher()
        .publish_with_callback("demo.ping", &Ping { sequence: 1 }, "demo.pong")
        .await?;
    info!(id = stored.id, "Published demo ping");

    info!("carrier-standalone running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    if !carrier.shutdown().await {
        error!("Shutdown timed out");
    }
    Ok(())
}

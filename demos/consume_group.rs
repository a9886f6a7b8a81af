// Joins test-group from the beginning of test-topic and logs every value
// until Ctrl-C.
//
//   KAFKA_BOOTSTRAP=localhost:9092 cargo run --example consume_group

use std::env;
use std::time::Duration;

use pg_kafka_client::{Consumer, ConsumerConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let bootstrap = env::var("KAFKA_BOOTSTRAP").unwrap_or_else(|_| "localhost:9092".to_string());
    let config = ConsumerConfig::from_properties([
        ("bootstrap.servers", bootstrap.as_str()),
        ("client.id", "node-kafka-app"),
        ("group.id", "test-group"),
        ("auto.offset.reset", "earliest"),
    ])?;
    let mut consumer = Consumer::connect(config).await?;
    consumer.subscribe("test-topic", None)?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    while !shutdown.is_cancelled() {
        match consumer
            .poll_with_cancellation(Duration::from_secs(1), &shutdown)
            .await
        {
            Ok(records) => {
                for record in &records {
                    let value = record
                        .value
                        .as_deref()
                        .map(String::from_utf8_lossy)
                        .unwrap_or_default();
                    info!("{}-{}@{}: {}", record.topic, record.partition, record.offset, value);
                }
            }
            Err(e) => warn!("Poll failed: {}", e),
        }
    }

    consumer.close().await?;
    Ok(())
}

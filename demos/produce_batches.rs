// Sends 1000 messages to test-topic in batches of 10, waiting for each batch
// to be acknowledged before starting the next.
//
//   KAFKA_BOOTSTRAP=localhost:9092 cargo run --example produce_batches

use std::env;

use futures::future::try_join_all;
use pg_kafka_client::{Producer, ProducerConfig, ProducerRecord};
use tracing::info;
use tracing_subscriber::EnvFilter;

const TOPIC: &str = "test-topic";
const MESSAGES: usize = 1000;
const BATCH: usize = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let bootstrap = env::var("KAFKA_BOOTSTRAP").unwrap_or_else(|_| "localhost:9092".to_string());
    let config = ProducerConfig::from_properties([
        ("bootstrap.servers", bootstrap.as_str()),
        ("client.id", "node-kafka-app"),
        ("batch.num.messages", "10"),
    ])?;
    let producer = Producer::connect(config).await?;

    for start in (0..MESSAGES).step_by(BATCH) {
        let mut pending = Vec::with_capacity(BATCH);
        for i in start..start + BATCH {
            let record = ProducerRecord::new(TOPIC, None, format!("message {}", i).into_bytes());
            pending.push(producer.send(record).await?);
        }
        let acked = try_join_all(pending).await?;
        if let (Some(first), Some(last)) = (acked.first(), acked.last()) {
            info!(
                "Batch {}..{} acknowledged: {}-{}@{} .. {}-{}@{}",
                start,
                start + BATCH - 1,
                first.topic,
                first.partition,
                first.offset,
                last.topic,
                last.partition,
                last.offset
            );
        }
    }

    producer.flush().await?;
    producer.close().await?;
    info!("Sent {} messages to {}", MESSAGES, TOPIC);
    Ok(())
}

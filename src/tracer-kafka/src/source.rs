use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::BorrowedMessage;
use rdkafka::Message;
use tracing::{debug, info};

use tracer_common::TraceRecord;
use tracer_config::KafkaConsumerConfig;

use crate::deserializer::decode_trace_record;

/// Queue client seen by the consumer loop.
#[async_trait]
pub trait TraceSource: Send + Sync {
    fn subscribe(&mut self, topics: &[String]) -> Result<()>;

    /// Waits up to `timeout` for records. An empty vec means nothing arrived.
    /// Undecodable records fail the whole poll.
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<TraceRecord>>;

    /// Synchronously commits the position of everything delivered so far.
    fn commit(&mut self) -> Result<()>;

    fn close(&mut self);
}

/// [`TraceSource`] over an rdkafka consumer group with manual commits.
pub struct KafkaTraceSource {
    consumer: StreamConsumer,
    max_poll_records: usize,
}

impl KafkaTraceSource {
    pub fn new(config: &KafkaConsumerConfig) -> Result<Self> {
        let client_id = format!("{}-{}", config.group_id, std::process::id());

        info!("Creating Kafka consumer {}", client_id);
        info!("  Brokers: {}", config.bootstrap_servers);
        info!("  Group ID: {}", config.group_id);

        let consumer: StreamConsumer = ClientConfig::new()
            .set("client.id", &client_id)
            .set("group.id", &config.group_id)
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("enable.partition.eof", "false")
            .create()
            .context("Failed to create Kafka consumer")?;

        Ok(Self {
            consumer,
            max_poll_records: config.max_poll_records,
        })
    }
}

#[async_trait]
impl TraceSource for KafkaTraceSource {
    fn subscribe(&mut self, topics: &[String]) -> Result<()> {
        let topics: Vec<&str> = topics.iter().map(|s| s.as_str()).collect();
        self.consumer
            .subscribe(&topics)
            .context("Failed to subscribe to topics")?;
        info!("Subscribed to topics: {:?}", topics);
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<TraceRecord>> {
        let mut records = Vec::new();

        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Ok(received) => records.push(decode_message(&received?)?),
            Err(_) => return Ok(records),
        }

        // Drain whatever is already fetched without waiting again
        while records.len() < self.max_poll_records {
            match tokio::time::timeout(Duration::ZERO, self.consumer.recv()).await {
                Ok(received) => records.push(decode_message(&received?)?),
                Err(_) => break,
            }
        }

        debug!("Polled {} records", records.len());
        Ok(records)
    }

    fn commit(&mut self) -> Result<()> {
        self.consumer
            .commit_consumer_state(CommitMode::Sync)
            .context("Offset commit failed")
    }

    fn close(&mut self) {
        info!("Closing Kafka consumer");
        self.consumer.unsubscribe();
    }
}

fn decode_message(msg: &BorrowedMessage<'_>) -> Result<TraceRecord> {
    let payload = msg.payload().ok_or_else(|| {
        anyhow::anyhow!(
            "Message at {}[{}]@{} has no payload",
            msg.topic(),
            msg.partition(),
            msg.offset()
        )
    })?;

    decode_trace_record(payload).with_context(|| {
        format!(
            "Bad trace node at {}[{}]@{}",
            msg.topic(),
            msg.partition(),
            msg.offset()
        )
    })
}

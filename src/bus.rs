use anyhow::Result;
use deadpool_lapin::{Config as PoolConfig, Pool, PoolConfig as LapinPoolConfig, Runtime};
use futures_util::stream::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Consumer, ExchangeKind,
};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::BusConfig;
use crate::Error;

/// What a consumer decides to do with a delivered message once handled.
///
/// Mirrors the Ack/NackRequeue/NackDiscard verdict contract the original
/// event bus exposes to its consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ack,
    NackRequeue,
    NackDiscard,
}

/// A durable message bus abstraction over RabbitMQ.
///
/// Generalizes the donor's single fixed-exchange `MessageBroker` into the
/// exchange/queue/bind/publish/consume primitives the spec names directly,
/// keeping the donor's connection-pooling and declare-options shape.
pub struct Bus {
    pool: Pool,
    dead_letter_exchange: String,
}

/// A delivered message, carrying its own ack/nack handle.
pub struct Delivery {
    pub body: Vec<u8>,
    pub routing_key: String,
    pub redelivered: bool,
    pub headers: FieldTable,
    inner: lapin::message::Delivery,
}

impl Delivery {
    /// Reads a string-valued header (`LongString`/`ShortString`), e.g. the
    /// `uuid` header `motion.detections` requires on every message.
    pub fn header_str(&self, name: &str) -> Option<String> {
        match self.headers.inner().get(name)? {
            AMQPValue::LongString(s) => Some(s.to_string()),
            AMQPValue::ShortString(s) => Some(s.to_string()),
            _ => None,
        }
    }
}

impl Delivery {
    pub async fn finish(self, verdict: Verdict) -> Result<()> {
        match verdict {
            Verdict::Ack => self
                .inner
                .ack(BasicAckOptions::default())
                .await
                .map_err(|e| Error::Transient(format!("ack: {e}")).into()),
            Verdict::NackRequeue => self
                .inner
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await
                .map_err(|e| Error::Transient(format!("nack requeue: {e}")).into()),
            Verdict::NackDiscard => self
                .inner
                .nack(BasicNackOptions {
                    requeue: false,
                    ..Default::default()
                })
                .await
                .map_err(|e| Error::Transient(format!("nack discard: {e}")).into()),
        }
    }
}

impl Bus {
    pub async fn new(config: &BusConfig, dead_letter_exchange: &str) -> Result<Self> {
        let pool_config = PoolConfig {
            url: Some(config.uri.clone()),
            pool: Some(LapinPoolConfig {
                max_size: config.pool_size as usize,
                ..Default::default()
            }),
            connection_properties: lapin::ConnectionProperties::default(),
        };
        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::Broker(format!("create bus pool: {e}")))?;

        let bus = Self {
            pool,
            dead_letter_exchange: dead_letter_exchange.to_string(),
        };
        bus.declare_exchange(dead_letter_exchange).await?;
        Ok(bus)
    }

    async fn channel(&self) -> Result<Channel> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| Error::Broker(format!("get bus connection: {e}")))?;
        conn.create_channel()
            .await
            .map_err(|e| Error::Broker(format!("create channel: {e}")).into())
    }

    pub async fn declare_exchange(&self, name: &str) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Broker(format!("declare exchange {name}: {e}")).into())
    }

    /// Declares an exclusive, auto-delete queue routed to the dead-letter
    /// exchange on rejection, matching the donor's per-consumer queue shape.
    pub async fn declare_queue(&self, name: &str) -> Result<()> {
        let channel = self.channel().await?;
        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(self.dead_letter_exchange.clone().into()),
        );
        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                args,
            )
            .await
            .map_err(|e| Error::Broker(format!("declare queue {name}: {e}")))?;
        Ok(())
    }

    pub async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Broker(format!("bind {queue} to {exchange}/{routing_key}: {e}")).into())
    }

    pub async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        self.publish_with_headers(exchange, routing_key, body, &[]).await
    }

    /// Publishes with AMQP message headers, e.g. the `uuid` header a
    /// `motion.detections` consumer keys its Pub/Sub fan-out on.
    pub async fn publish_with_headers(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        headers: &[(&str, &str)],
    ) -> Result<()> {
        let channel = self.channel().await?;

        let mut table = FieldTable::default();
        for (k, v) in headers {
            table.insert((*k).into(), AMQPValue::LongString((*v).into()));
        }
        let properties = BasicProperties::default().with_headers(table);

        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|e| Error::Broker(format!("publish to {exchange}/{routing_key}: {e}")))?;
        debug!(exchange, routing_key, "published bus message");
        Ok(())
    }

    /// Starts a consumer on an already-declared, already-bound queue.
    pub async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<BusConsumer> {
        let channel = self.channel().await?;
        let consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Broker(format!("consume {queue}: {e}")))?;
        Ok(BusConsumer { consumer })
    }
}

pub struct BusConsumer {
    consumer: Consumer,
}

impl BusConsumer {
    /// Pulls the next delivery, or `None` once the consumer is cancelled/closed.
    pub async fn next(&mut self) -> Option<Delivery> {
        loop {
            match self.consumer.next().await {
                Some(Ok(delivery)) => {
                    let routing_key = delivery.routing_key.to_string();
                    let redelivered = delivery.redelivered;
                    let headers = delivery
                        .properties
                        .headers()
                        .clone()
                        .unwrap_or_default();
                    return Some(Delivery {
                        body: delivery.data.clone(),
                        routing_key,
                        redelivered,
                        headers,
                        inner: delivery,
                    });
                }
                Some(Err(e)) => {
                    warn!("bus consumer error: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                None => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_variants_are_distinct() {
        assert_ne!(Verdict::Ack, Verdict::NackRequeue);
        assert_ne!(Verdict::NackRequeue, Verdict::NackDiscard);
    }
}

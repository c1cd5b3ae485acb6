//! Message bus contract used by the job loop.
//!
//! Delivery is at-least-once: a job that is not acknowledged is handed out
//! again later, so everything downstream must tolerate reruns.

pub mod redis_streams;

use std::time::Duration;

use async_trait::async_trait;

pub use redis_streams::{RedisStreamBus, StreamSettings};

/// Error from bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus connection failed: {0}")]
    Connect(String),

    #[error("bus command failed: {0}")]
    Command(String),

    #[error("malformed bus response: {0}")]
    Payload(String),
}

/// One job handed out by [`MessageBus::fetch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Bus-assigned message id, used to acknowledge the job.
    pub id: String,
    /// Raw job body.
    pub payload: String,
    /// True when this job was handed out before and never acknowledged.
    pub redelivered: bool,
}

impl Delivery {
    pub fn new(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            redelivered: false,
        }
    }
}

/// Durable, acknowledged job queue.
#[async_trait]
pub trait MessageBus: Send {
    /// Join the durable subscription, creating it if needed.
    async fn subscribe(&mut self) -> Result<(), BusError>;

    /// Next jobs for this consumer. Empty when the wait timed out.
    async fn fetch(&mut self) -> Result<Vec<Delivery>, BusError>;

    /// Publish a result to the fixed result destination.
    async fn publish(&mut self, payload: &str) -> Result<(), BusError>;

    /// Mark a job done.
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError>;

    /// Ask for a job to be handed out again.
    async fn nak(&mut self, delivery: &Delivery) -> Result<(), BusError>;

    /// Signal that `delivery` is still being worked on, so it is not handed
    /// to another consumer in the meantime.
    async fn touch(&mut self, _delivery: &Delivery) -> Result<(), BusError> {
        Ok(())
    }

    /// How often [`touch`](Self::touch) must be called while a job runs.
    /// `None` when jobs are never reassigned mid-flight.
    fn touch_interval(&self) -> Option<Duration> {
        None
    }

    /// Release the connection.
    async fn close(&mut self);
}

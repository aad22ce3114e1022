//! Host-local handlers and topic subscribers.

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;

use crate::envelope::Envelope;
use crate::types::Result;

/// Handles `Request`/`Notify` envelopes addressed to the host.
///
/// For requests, `Ok` becomes a `Response` and `Err` an `Error` reply.
#[async_trait]
pub trait HostHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> Result<Value>;
}

/// Receives events published on a subscribed topic.
///
/// Each subscription runs on its own task; an error or panic is logged and
/// delivery continues with the next event.
#[async_trait]
pub trait TopicHandler: Send + Sync {
    async fn on_event(&self, event: &Envelope) -> Result<()>;
}

/// Adapter turning an async closure into a [`HostHandler`].
pub struct FnHandler<F>(pub F);

impl<F> std::fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnHandler")
    }
}

#[async_trait]
impl<F, Fut> HostHandler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn handle(&self, envelope: &Envelope) -> Result<Value> {
        (self.0)(envelope.clone()).await
    }
}

/// Adapter turning an async closure into a [`TopicHandler`].
pub struct FnSubscriber<F>(pub F);

impl<F> std::fmt::Debug for FnSubscriber<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnSubscriber")
    }
}

#[async_trait]
impl<F, Fut> TopicHandler for FnSubscriber<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn on_event(&self, event: &Envelope) -> Result<()> {
        (self.0)(event.clone()).await
    }
}

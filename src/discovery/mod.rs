//! # Service Discovery
//!
//! Pluggable discovery providers stream [`service::Service`] documents into a
//! per-cycle channel; the discovery server fans providers out in parallel,
//! folds the results through the resource aggregator and publishes a snapshot
//! when the aggregated content changed.

pub mod memory;
pub mod registry;
pub mod server;
pub mod service;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::Result;

pub use server::{DiscoveryServer, DiscoveryServerOptions};
pub use service::Service;

/// A producer of discovered services.
///
/// Implementations emit zero or more services on `out`, never close or
/// retain the channel, and must return promptly once `token` is cancelled.
/// Errors are surfaced to the cycle, which logs them and proceeds with
/// partial data.
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    /// Short name used in structured logs.
    fn name(&self) -> &str;

    async fn discover(
        &self,
        token: CancellationToken,
        out: mpsc::Sender<Service>,
    ) -> Result<()>;
}

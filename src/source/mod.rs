pub mod redis;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::event::RawMessage;

/// Transport delivering allocation events.
pub trait EventSource: Send {
    /// Returns the source's name for logging.
    fn name(&self) -> &str;

    /// Lists the `status` keys of allocations that exist right now.
    fn existing_allocations(
        &mut self,
    ) -> impl std::future::Future<Output = Result<Vec<String>>> + Send;

    /// Forwards events into `tx` until `ctx` is cancelled or the receiver
    /// is dropped.
    fn run(
        self,
        tx: mpsc::Sender<RawMessage>,
        ctx: CancellationToken,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

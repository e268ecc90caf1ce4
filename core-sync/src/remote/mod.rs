//! # Remote Store Adapters
//!
//! Implementations of [`bridge_traits::RemoteStore`] that live next to the
//! engine:
//!
//! - [`InMemoryRemoteStore`]: atomic conditional writes over a map, with
//!   change notifications and fault injection. Used by tests and demos, and
//!   as a local single-process authority.
//! - [`ReadCompareWriteStore`]: emulates conditional writes on top of a plain
//!   [`bridge_traits::DocumentStore`].
//!
//! The HTTP backend lives in the `provider-rest` crate.

mod emulated;
mod memory;

pub use emulated::ReadCompareWriteStore;
pub use memory::{FaultKind, InMemoryRemoteStore};

use bridge_traits::{RemoteChange, RemoteChangeStream};
use tokio::sync::broadcast;
use tracing::warn;

/// [`RemoteChangeStream`] over a broadcast receiver; lag skips ahead.
pub(crate) struct BroadcastChangeStream {
    receiver: broadcast::Receiver<RemoteChange>,
}

impl BroadcastChangeStream {
    pub(crate) fn new(receiver: broadcast::Receiver<RemoteChange>) -> Self {
        Self { receiver }
    }
}

#[async_trait::async_trait]
impl RemoteChangeStream for BroadcastChangeStream {
    async fn next(&mut self) -> Option<RemoteChange> {
        loop {
            match self.receiver.recv().await {
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Remote change stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

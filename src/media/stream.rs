//! Stream supervisor seam.
//!
//! Streaming children are external processes that own a listener socket and
//! stream audio to subscribers. The dispatcher starts them through this
//! trait and joins running ones via their [`StreamChild`] handle.

use super::ports::PortLease;
use crate::SbResult;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Whether a child plays once to a single subscriber or keeps streaming for
/// late joiners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Single,
    Continuous,
}

/// Fully resolved media location handed to a stream child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaLocator {
    pub db: String,
    pub doc: String,
    pub attachment: String,
    pub content_type: Option<String>,
}

/// Join request delivered to a running stream child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddListener {
    pub reply_to: String,
}

/// Handle to a live streaming child.
#[derive(Debug, Clone)]
pub struct StreamChild {
    pub id: u64,
    /// Mailbox for subscribers joining the running stream.
    pub listeners: mpsc::UnboundedSender<AddListener>,
    /// Cancelled when the child exits.
    pub liveness: CancellationToken,
}

impl StreamChild {
    /// Ask the child to add a subscriber. Returns false if the child's
    /// mailbox is already gone.
    pub fn add_listener(&self, reply_to: &str) -> bool {
        self.listeners
            .send(AddListener {
                reply_to: reply_to.to_string(),
            })
            .is_ok()
    }
}

#[async_trait]
pub trait StreamSupervisor: Send + Sync + 'static {
    /// Start a streaming child on the already-bound `port`, answering to
    /// `reply_to` once the stream is up.
    async fn start_stream(
        &self,
        media: MediaLocator,
        reply_to: &str,
        mode: StreamMode,
        port: PortLease,
    ) -> SbResult<StreamChild>;
}

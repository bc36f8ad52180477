//! In-process connector. Every connect creates a `tokio::io::duplex` pipe and
//! hands the far end to a [`LoopbackRemote`], which plays the remote service.
//! Used by tests and by local runs without network access.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use koukoku_core::errors::TransportError;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use crate::connection::Connector;

const PIPE_CAPACITY: usize = 64 * 1024;

struct Inner {
    peers: mpsc::UnboundedSender<DuplexStream>,
    attempts: AtomicU32,
    failures_left: AtomicU32,
}

#[derive(Clone)]
pub struct LoopbackConnector {
    inner: Arc<Inner>,
}

/// Receives the remote side of every connection the connector opens.
pub struct LoopbackRemote {
    peers: mpsc::UnboundedReceiver<DuplexStream>,
}

impl LoopbackConnector {
    pub fn pair() -> (Self, LoopbackRemote) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            inner: Arc::new(Inner {
                peers: tx,
                attempts: AtomicU32::new(0),
                failures_left: AtomicU32::new(0),
            }),
        };
        (connector, LoopbackRemote { peers: rx })
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next(&self, n: u32) {
        self.inner.failures_left.store(n, Ordering::SeqCst);
    }

    /// Connect attempts so far, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    type Stream = DuplexStream;

    async fn connect(&self) -> Result<DuplexStream, TransportError> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .inner
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect("connection refused".into()));
        }

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        self.inner
            .peers
            .send(remote)
            .map_err(|_| TransportError::Connect("loopback remote is gone".into()))?;
        Ok(local)
    }

    fn describe(&self) -> String {
        "loopback".into()
    }
}

impl LoopbackRemote {
    /// Next connection opened by the engine.
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.peers.recv().await
    }
}

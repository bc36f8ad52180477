//! Owns the transport to the remote service: connect, reconnect, keepalive,
//! reads, and line writes.
//!
//! `next_event` is cancel-safe so the engine task can `select!` on it next to
//! its own timers. Connect attempts run on a spawned task for that reason.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use koukoku_core::errors::TransportError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::chunks::RawChunk;
use crate::text::hex;

const READ_BUFFER_SIZE: usize = 8 * 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Opens byte streams to the remote service.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn connect(&self) -> Result<Self::Stream, TransportError>;

    /// Human-readable remote address for logs.
    fn describe(&self) -> String;
}

#[derive(Debug)]
pub enum ConnectionEvent {
    Connected { generation: u64 },
    Data(RawChunk),
    KeepaliveDue,
    Closed { generation: u64, reason: String },
    ConnectFailed { error: TransportError, retry_in: Duration },
}

struct Link<S> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    keepalive: Interval,
    generation: u64,
}

enum LinkState<S> {
    Waiting { retry_at: Instant },
    Connecting(JoinHandle<Result<S, TransportError>>),
    Open(Link<S>),
    Shutdown,
}

enum Wake<S> {
    RetryDue,
    Connected(Result<S, TransportError>),
    Read(io::Result<usize>),
    Keepalive,
}

pub struct ConnectionManager<C: Connector> {
    connector: Arc<C>,
    state: LinkState<C::Stream>,
    generation: u64,
    failures: u32,
    keepalive_interval: Duration,
    base_delay: Duration,
    max_delay: Duration,
    read_buf: Vec<u8>,
}

impl<C: Connector> ConnectionManager<C> {
    /// The first connect attempt starts on the first `next_event` call.
    pub fn new(
        connector: C,
        keepalive_interval: Duration,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        Self {
            connector: Arc::new(connector),
            state: LinkState::Waiting {
                retry_at: Instant::now(),
            },
            generation: 0,
            failures: 0,
            keepalive_interval,
            base_delay,
            max_delay,
            read_buf: vec![0; READ_BUFFER_SIZE],
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, LinkState::Open(_))
    }

    /// Number of successful connects so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Wait for the next thing that happens on the transport. Reconnects are
    /// driven from here, so the engine must keep polling this.
    pub async fn next_event(&mut self) -> ConnectionEvent {
        loop {
            let wake = match &mut self.state {
                LinkState::Shutdown => return std::future::pending().await,
                LinkState::Waiting { retry_at } => {
                    sleep_until(*retry_at).await;
                    Wake::RetryDue
                }
                LinkState::Connecting(handle) => Wake::Connected(match handle.await {
                    Ok(result) => result,
                    Err(e) => Err(TransportError::Connect(e.to_string())),
                }),
                LinkState::Open(link) => tokio::select! {
                    read = link.reader.read(&mut self.read_buf) => Wake::Read(read),
                    _ = link.keepalive.tick() => Wake::Keepalive,
                },
            };

            match wake {
                Wake::RetryDue => {
                    debug!(remote = %self.connector.describe(), "connecting");
                    let connector = Arc::clone(&self.connector);
                    self.state = LinkState::Connecting(tokio::spawn(async move {
                        connector.connect().await
                    }));
                }
                Wake::Connected(Ok(stream)) => {
                    self.generation += 1;
                    self.failures = 0;
                    let (reader, writer) = tokio::io::split(stream);
                    let mut keepalive = interval_at(
                        Instant::now() + self.keepalive_interval,
                        self.keepalive_interval,
                    );
                    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    self.state = LinkState::Open(Link {
                        reader,
                        writer,
                        keepalive,
                        generation: self.generation,
                    });
                    info!(
                        generation = self.generation,
                        remote = %self.connector.describe(),
                        "connected"
                    );
                    return ConnectionEvent::Connected {
                        generation: self.generation,
                    };
                }
                Wake::Connected(Err(error)) => {
                    self.failures += 1;
                    let retry_in = self.backoff();
                    self.state = LinkState::Waiting {
                        retry_at: Instant::now() + retry_in,
                    };
                    warn!(
                        error = %error,
                        attempt = self.failures,
                        retry_ms = retry_in.as_millis() as u64,
                        "connect failed"
                    );
                    return ConnectionEvent::ConnectFailed { error, retry_in };
                }
                Wake::Read(Ok(0)) => {
                    let generation = self.drop_link();
                    return ConnectionEvent::Closed {
                        generation,
                        reason: "closed by peer".into(),
                    };
                }
                Wake::Read(Ok(n)) => {
                    let bytes = self.read_buf[..n].to_vec();
                    trace!(
                        generation = self.generation,
                        bytes = n,
                        hex = %hex(&bytes),
                        "received"
                    );
                    return ConnectionEvent::Data(RawChunk::new(bytes, Utc::now()));
                }
                Wake::Read(Err(e)) => {
                    let generation = self.drop_link();
                    return ConnectionEvent::Closed {
                        generation,
                        reason: TransportError::Read(e.to_string()).to_string(),
                    };
                }
                Wake::Keepalive => return ConnectionEvent::KeepaliveDue,
            }
        }
    }

    /// Write `text` followed by CRLF and flush. A failed write tears the link
    /// down and schedules a reconnect.
    pub async fn write_line(&mut self, text: &str) -> Result<(), TransportError> {
        let LinkState::Open(link) = &mut self.state else {
            return Err(TransportError::NotConnected);
        };

        let mut line = Vec::with_capacity(text.len() + 2);
        line.extend_from_slice(text.as_bytes());
        line.extend_from_slice(b"\r\n");

        let result = match link.writer.write_all(&line).await {
            Ok(()) => link.writer.flush().await,
            Err(e) => Err(e),
        };
        let generation = link.generation;

        match result {
            Ok(()) => {
                trace!(generation, bytes = line.len(), "wrote line");
                Ok(())
            }
            Err(e) => {
                warn!(generation, error = %e, "write failed");
                self.drop_link();
                Err(TransportError::Write(e.to_string()))
            }
        }
    }

    /// Close the transport gracefully and stop reconnecting.
    pub async fn shutdown(&mut self) {
        match std::mem::replace(&mut self.state, LinkState::Shutdown) {
            LinkState::Open(mut link) => {
                match tokio::time::timeout(SHUTDOWN_GRACE, link.writer.shutdown()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(error = %e, "transport shutdown error"),
                    Err(_) => debug!("transport shutdown timed out"),
                }
                info!(generation = link.generation, "connection closed");
            }
            LinkState::Connecting(handle) => handle.abort(),
            LinkState::Waiting { .. } | LinkState::Shutdown => {}
        }
    }

    /// Drop the open link and reconnect right away. Returns its generation.
    fn drop_link(&mut self) -> u64 {
        let previous = std::mem::replace(
            &mut self.state,
            LinkState::Waiting {
                retry_at: Instant::now(),
            },
        );
        match previous {
            LinkState::Open(link) => {
                warn!(generation = link.generation, "connection lost");
                link.generation
            }
            other => {
                self.state = other;
                self.generation
            }
        }
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    fn backoff(&self) -> Duration {
        let exponent = self.failures.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(2u32.pow(exponent))
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackConnector;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn manager(connector: LoopbackConnector) -> ConnectionManager<LoopbackConnector> {
        ConnectionManager::new(
            connector,
            Duration::from_secs(15),
            Duration::from_secs(1),
            Duration::from_secs(60),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn connects_and_forwards_data() {
        let (connector, mut remote) = LoopbackConnector::pair();
        let mut conn = manager(connector);

        let event = conn.next_event().await;
        assert!(matches!(event, ConnectionEvent::Connected { generation: 1 }));
        assert!(conn.is_connected());

        let mut peer = remote.accept().await.unwrap();
        peer.write_all(b"hello").await.unwrap();
        match conn.next_event().await {
            ConnectionEvent::Data(chunk) => assert_eq!(chunk.bytes(), b"hello"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn write_line_appends_crlf() {
        let (connector, mut remote) = LoopbackConnector::pair();
        let mut conn = manager(connector);
        conn.next_event().await;
        let peer = remote.accept().await.unwrap();

        conn.write_line("nobody").await.unwrap();
        let mut lines = BufReader::new(peer);
        let mut line = String::new();
        lines.read_line(&mut line).await.unwrap();
        assert_eq!(line, "nobody\r\n");
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_fires_on_interval() {
        let (connector, _remote) = LoopbackConnector::pair();
        let mut conn = manager(connector);
        conn.next_event().await;
        let connected_at = Instant::now();

        assert!(matches!(conn.next_event().await, ConnectionEvent::KeepaliveDue));
        assert_eq!(connected_at.elapsed(), Duration::from_secs(15));
        assert!(matches!(conn.next_event().await, ConnectionEvent::KeepaliveDue));
        assert_eq!(connected_at.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_immediately_after_close() {
        let (connector, mut remote) = LoopbackConnector::pair();
        let mut conn = manager(connector.clone());
        conn.next_event().await;
        drop(remote.accept().await.unwrap());

        let closed_at = Instant::now();
        assert!(matches!(
            conn.next_event().await,
            ConnectionEvent::Closed { generation: 1, .. }
        ));
        assert!(!conn.is_connected());
        assert!(matches!(
            conn.next_event().await,
            ConnectionEvent::Connected { generation: 2 }
        ));
        assert_eq!(closed_at.elapsed(), Duration::ZERO);
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connects_back_off() {
        let (connector, _remote) = LoopbackConnector::pair();
        connector.fail_next(3);
        let mut conn = manager(connector.clone());

        let mut delays = Vec::new();
        loop {
            match conn.next_event().await {
                ConnectionEvent::ConnectFailed { retry_in, .. } => delays.push(retry_in),
                ConnectionEvent::Connected { generation } => {
                    assert_eq!(generation, 1);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert_eq!(connector.attempts(), 4);
    }

    #[test]
    fn backoff_is_capped() {
        let (connector, _remote) = LoopbackConnector::pair();
        let mut conn = manager(connector);
        conn.failures = 30;
        assert_eq!(conn.backoff(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn write_without_link_is_not_connected() {
        let (connector, _remote) = LoopbackConnector::pair();
        let mut conn = manager(connector);
        let err = conn.write_line("ping").await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_transport() {
        let (connector, mut remote) = LoopbackConnector::pair();
        let mut conn = manager(connector);
        conn.next_event().await;
        let mut peer = remote.accept().await.unwrap();

        conn.shutdown().await;
        assert!(!conn.is_connected());
        let mut buf = [0u8; 8];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    }
}

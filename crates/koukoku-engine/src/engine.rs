//! The engine task and its public handle.
//!
//! One task owns the connection, the parser and the send queue. Callers talk to
//! it over an mpsc channel and get replies on oneshots; parsed records leave
//! through a broadcast channel after they are persisted.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::Utc;
use koukoku_core::errors::{EngineError, SendError};
use koukoku_core::events::EngineEvent;
use koukoku_core::items::Record;
use koukoku_core::outcome::SendResult;
use koukoku_store::ItemLog;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::EngineConfig;
use crate::connection::{ConnectionEvent, ConnectionManager, Connector};
use crate::parser::{ParserEvent, StreamParser};
use crate::queue::SendQueue;
use crate::tls::TlsConnector;

const COMMAND_CAPACITY: usize = 256;

enum Command {
    Send {
        text: String,
        reply: oneshot::Sender<SendResult>,
    },
    Dispose {
        done: oneshot::Sender<()>,
    },
}

/// Resolves once the send is written (broadcast URLs) or echoed back (chat
/// text), or fails.
#[derive(Debug)]
pub struct SendTicket {
    rx: oneshot::Receiver<SendResult>,
}

impl Future for SendTicket {
    type Output = SendResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(SendError::EngineClosed)))
    }
}

/// Handle to a running engine. Dropping it shuts the engine down the same way
/// [`Engine::dispose`] does, without waiting.
pub struct Engine {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<EngineEvent>,
    /// Flips to `true` once the task has shut down. Closed early if it panicked.
    stopped: watch::Receiver<bool>,
}

impl Engine {
    /// Connect to the configured host over TLS.
    pub fn connect_tls(config: EngineConfig, log: Arc<dyn ItemLog>) -> Result<Self, EngineError> {
        config.validate()?;
        let connector = TlsConnector::new(&config.host, config.port)?;
        Self::start(config, connector, log)
    }

    /// Spawn the engine task on the current runtime.
    pub fn start<C: Connector>(
        config: EngineConfig,
        connector: C,
        log: Arc<dyn ItemLog>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events, _) = broadcast::channel(config.event_capacity);
        let span = info_span!("engine", remote = %connector.describe());

        let task = EngineTask {
            connection: ConnectionManager::new(
                connector,
                config.keepalive_interval,
                config.reconnect_base_delay,
                config.reconnect_max_delay,
            ),
            parser: StreamParser::new(config.quiet_period, config.max_buffer_bytes),
            queue: SendQueue::new(
                config.pacing_interval,
                config.idle_interval,
                config.echo_policy,
                config.echo_timeout,
            ),
            log,
            events: events.clone(),
            config,
        };
        let (stopped_tx, stopped) = watch::channel(false);
        tokio::spawn(async move {
            task.run(rx).instrument(span).await;
            let _ = stopped_tx.send(true);
        });

        Ok(Self {
            commands,
            events,
            stopped,
        })
    }

    /// Queue `text` and wait for its outcome.
    pub async fn send(&self, text: impl Into<String>) -> SendResult {
        self.submit(text).await?.await
    }

    /// Queue `text`. Returns once the engine task has the request; await the
    /// ticket for the outcome.
    pub async fn submit(&self, text: impl Into<String>) -> Result<SendTicket, SendError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                text: text.into(),
                reply,
            })
            .await
            .map_err(|_| SendError::EngineClosed)?;
        Ok(SendTicket { rx })
    }

    /// Receive every `message` and `speech` event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        !*self.stopped.borrow() && self.stopped.has_changed().is_ok()
    }

    /// Settle every outstanding send with a shutdown failure, close the
    /// transport, and wait for the task to exit. Safe to call more than once,
    /// including concurrently; every call returns only after shutdown is done.
    pub async fn dispose(&self) {
        let (done, ack) = oneshot::channel();
        if self.commands.send(Command::Dispose { done }).await.is_ok() {
            let _ = ack.await;
        }

        let mut stopped = self.stopped.clone();
        if stopped.wait_for(|stopped| *stopped).await.is_err() {
            warn!("engine task ended abnormally");
        }
    }
}

enum Wake {
    Command(Option<Command>),
    Connection(ConnectionEvent),
    QuietPeriod,
    SendTick,
    EchoExpiry,
}

struct EngineTask<C: Connector> {
    config: EngineConfig,
    connection: ConnectionManager<C>,
    parser: StreamParser,
    queue: SendQueue,
    log: Arc<dyn ItemLog>,
    events: broadcast::Sender<EngineEvent>,
}

impl<C: Connector> EngineTask<C> {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!("engine started");
        loop {
            let quiet = self.parser.quiet_deadline();
            let tick = self.queue.next_tick();
            let expiry = self.queue.next_expiry();

            let wake = tokio::select! {
                command = commands.recv() => Wake::Command(command),
                event = self.connection.next_event() => Wake::Connection(event),
                _ = sleep_until_some(quiet) => Wake::QuietPeriod,
                _ = sleep_until_some(tick) => Wake::SendTick,
                _ = sleep_until_some(expiry) => Wake::EchoExpiry,
            };

            match wake {
                Wake::Command(Some(Command::Send { text, reply })) => {
                    self.queue.enqueue(text, reply, Instant::now());
                }
                Wake::Command(Some(Command::Dispose { done })) => {
                    self.shutdown().await;
                    let _ = done.send(());
                    return;
                }
                Wake::Command(None) => {
                    debug!("engine handle dropped");
                    self.shutdown().await;
                    return;
                }
                Wake::Connection(event) => self.on_connection_event(event).await,
                Wake::QuietPeriod => {
                    let events = self.parser.flush_speech(Utc::now());
                    self.dispatch(events);
                }
                Wake::SendTick => self.on_send_tick().await,
                Wake::EchoExpiry => {
                    self.queue.expire(Instant::now());
                }
            }
        }
    }

    async fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected { generation } => {
                let identification = self.config.identification.clone();
                if let Err(e) = self.connection.write_line(&identification).await {
                    warn!(generation, error = %e, "identification failed");
                }
            }
            ConnectionEvent::Data(chunk) => {
                let events = self.parser.write(chunk, Instant::now());
                self.dispatch(events);
            }
            ConnectionEvent::KeepaliveDue => {
                if let Err(e) = self.connection.write_line("ping").await {
                    warn!(error = %e, "keepalive failed");
                }
            }
            ConnectionEvent::Closed { generation, reason } => {
                warn!(generation, reason = %reason, "disconnected, reconnecting");
                // the replacement stream starts fresh
                self.parser.reset();
            }
            ConnectionEvent::ConnectFailed { .. } => {}
        }
    }

    async fn on_send_tick(&mut self) {
        let now = Instant::now();
        if !self.connection.is_connected() {
            if self.queue.queued() > 0 {
                debug!(queued = self.queue.queued(), "not connected, deferring send");
            }
            self.queue.defer(now);
            return;
        }
        let Some(item) = self.queue.on_tick(now) else {
            return;
        };
        let result = self.connection.write_line(item.text()).await;
        self.queue.complete_write(item, result, Instant::now());
    }

    fn dispatch(&mut self, events: Vec<ParserEvent>) {
        if events.is_empty() {
            return;
        }
        let _span = info_span!("connection", generation = self.connection.generation()).entered();
        for event in events {
            match event {
                ParserEvent::Message(item) => self.publish(Record::Message(item)),
                ParserEvent::Speech(item) => self.publish(Record::Speech(item)),
                ParserEvent::SelfEcho(text) => {
                    self.queue.on_echo(&text);
                }
            }
        }
    }

    /// Persist, index, then broadcast. Subscribers see the assigned id.
    fn publish(&self, record: Record) {
        let id = match self.log.append(&record) {
            Ok(id) => {
                if let Err(e) = self.log.index_by_timestamp(id, record.timestamp()) {
                    warn!(id = %id, error = %e, "failed to index record");
                }
                Some(id)
            }
            Err(e) => {
                error!(kind = record.kind(), error = %e, "failed to persist record");
                None
            }
        };
        debug!(kind = record.kind(), id = ?id, "publishing record");
        // no subscribers is fine
        let _ = self.events.send(EngineEvent::from_record(id, record));
    }

    async fn shutdown(&mut self) {
        self.parser.dispose();
        let settled = self.queue.dispose();
        self.connection.shutdown().await;
        info!(settled, "engine stopped");
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackConnector;
    use koukoku_store::{Database, SqliteItemLog};
    use tokio::io::AsyncReadExt;

    fn log() -> Arc<dyn ItemLog> {
        Arc::new(SqliteItemLog::new(Database::in_memory().unwrap()))
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let (connector, _remote) = LoopbackConnector::pair();
        let config = EngineConfig {
            pacing_interval: std::time::Duration::ZERO,
            ..Default::default()
        };
        assert!(Engine::start(config, connector, log()).is_err());
    }

    #[tokio::test]
    async fn ticket_reports_closed_engine() {
        let (tx, rx) = oneshot::channel::<SendResult>();
        drop(tx);
        assert_eq!(SendTicket { rx }.await, Err(SendError::EngineClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_is_idempotent() {
        let (connector, _remote) = LoopbackConnector::pair();
        let engine = Engine::start(EngineConfig::default(), connector, log()).unwrap();
        assert!(engine.is_running());

        engine.dispose().await;
        assert!(!engine.is_running());
        engine.dispose().await;
        assert_eq!(engine.send("late").await, Err(SendError::EngineClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_dispose_calls_all_wait_for_shutdown() {
        let (connector, mut remote) = LoopbackConnector::pair();
        let engine = Engine::start(EngineConfig::default(), connector, log()).unwrap();
        let mut peer = remote.accept().await.unwrap();
        let mut line = [0u8; 8];
        peer.read_exact(&mut line).await.unwrap();
        let ticket = engine.submit("queued").await.unwrap();

        let check = || {
            assert!(!engine.is_running());
            assert!(*engine.stopped.borrow());
        };
        tokio::join!(
            async {
                engine.dispose().await;
                check();
            },
            async {
                engine.dispose().await;
                check();
            },
            async {
                engine.dispose().await;
                check();
            },
        );
        assert_eq!(ticket.await, Err(SendError::Shutdown));
        // closed by the time any call returned
        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_stops_task() {
        let (connector, mut remote) = LoopbackConnector::pair();
        let engine = Engine::start(EngineConfig::default(), connector, log()).unwrap();
        let mut peer = remote.accept().await.unwrap();
        let mut line = [0u8; 8];
        peer.read_exact(&mut line).await.unwrap();
        assert_eq!(&line, b"nobody\r\n");
        drop(engine);

        // the task closes the transport on its way out
        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}

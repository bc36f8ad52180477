//! Paced outbound queue with echo correlation.
//!
//! The queue owns no timers either: it exposes the next instant it wants to be
//! ticked at and the engine task sleeps until then.

use std::collections::VecDeque;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use koukoku_core::errors::{SendError, TransportError};
use koukoku_core::outcome::SendResult;
use regex::Regex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EchoPolicy;
use crate::text::squash_whitespace;

/// Bare URLs are posted as broadcasts; the service never echoes them back.
static SPEECH_SEND_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://[./0-9A-Za-z_]+$").unwrap());

pub fn is_speech_text(text: &str) -> bool {
    SPEECH_SEND_PATTERN.is_match(text)
}

/// A caller's send, from enqueue until its reply is settled.
#[derive(Debug)]
pub struct PendingSend {
    text: String,
    is_speech: bool,
    enqueued_at: DateTime<Utc>,
    written_at: Option<Instant>,
    reply: oneshot::Sender<SendResult>,
}

impl PendingSend {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_speech(&self) -> bool {
        self.is_speech
    }

    fn settle(self, result: SendResult) {
        // the caller may have stopped waiting
        let _ = self.reply.send(result);
    }
}

pub struct SendQueue {
    queue: VecDeque<PendingSend>,
    awaiting: Vec<PendingSend>,
    next_tick: Option<Instant>,
    last_write: Option<Instant>,
    pacing: Duration,
    idle: Duration,
    echo_policy: EchoPolicy,
    echo_timeout: Option<Duration>,
}

impl SendQueue {
    pub fn new(
        pacing: Duration,
        idle: Duration,
        echo_policy: EchoPolicy,
        echo_timeout: Option<Duration>,
    ) -> Self {
        Self {
            queue: VecDeque::new(),
            awaiting: Vec::new(),
            next_tick: None,
            last_write: None,
            pacing,
            idle,
            echo_policy,
            echo_timeout,
        }
    }

    /// Append a send and make sure a tick is scheduled no later than pacing
    /// allows.
    pub fn enqueue(&mut self, text: String, reply: oneshot::Sender<SendResult>, now: Instant) {
        let is_speech = is_speech_text(&text);
        debug!(speech = is_speech, queued = self.queue.len() + 1, "send enqueued");
        self.queue.push_back(PendingSend {
            text,
            is_speech,
            enqueued_at: Utc::now(),
            written_at: None,
            reply,
        });

        let earliest = self
            .last_write
            .map_or(now, |last| (last + self.pacing).max(now));
        self.next_tick = Some(match self.next_tick {
            Some(tick) => tick.min(earliest),
            None => earliest,
        });
    }

    pub fn next_tick(&self) -> Option<Instant> {
        self.next_tick
    }

    /// Take the head of the queue for writing. An empty queue schedules the
    /// next check after the idle interval.
    pub fn on_tick(&mut self, now: Instant) -> Option<PendingSend> {
        self.next_tick = None;
        match self.queue.pop_front() {
            Some(item) => {
                debug!(
                    enqueued_at = %item.enqueued_at,
                    speech = item.is_speech,
                    "dequeued send"
                );
                Some(item)
            }
            None => {
                debug!(
                    queued = self.queue.len(),
                    awaiting = self.awaiting.len(),
                    "send queue idle"
                );
                self.next_tick = Some(now + self.idle);
                None
            }
        }
    }

    /// Postpone the head item by one pacing interval, e.g. while disconnected.
    pub fn defer(&mut self, now: Instant) {
        self.next_tick = if self.queue.is_empty() {
            Some(now + self.idle)
        } else {
            Some(now + self.pacing)
        };
    }

    /// Record the outcome of writing `item`. Failures and broadcasts settle at
    /// once; ordinary text waits for its echo.
    pub fn complete_write(
        &mut self,
        mut item: PendingSend,
        result: Result<(), TransportError>,
        now: Instant,
    ) {
        self.last_write = Some(now);
        self.next_tick = Some(now + self.pacing);

        match result {
            Err(e) => {
                warn!(error = %e, "send write failed");
                item.settle(Err(SendError::from(e)));
            }
            Ok(()) if item.is_speech => item.settle(Ok(())),
            Ok(()) => {
                item.written_at = Some(now);
                self.awaiting.push(item);
            }
        }
    }

    /// Settle awaiting sends matched by a self-echo. Returns how many settled.
    pub fn on_echo(&mut self, echo: &str) -> usize {
        let wanted = squash_whitespace(echo);
        let Some(index) = self
            .awaiting
            .iter()
            .position(|p| squash_whitespace(&p.text) == wanted)
        else {
            debug!(echo = %wanted, "echo matched nothing");
            return 0;
        };

        info!(echo = %wanted, index, "echo confirmed send");
        let settled: Vec<PendingSend> = match self.echo_policy {
            EchoPolicy::Single => vec![self.awaiting.remove(index)],
            EchoPolicy::MatchAndYounger => self.awaiting.drain(index..).collect(),
        };
        let count = settled.len();
        for item in settled {
            item.settle(Ok(()));
        }
        count
    }

    /// Earliest instant an awaiting send runs out of echo time.
    pub fn next_expiry(&self) -> Option<Instant> {
        let timeout = self.echo_timeout?;
        self.awaiting
            .iter()
            .filter_map(|p| p.written_at)
            .min()
            .map(|written| written + timeout)
    }

    /// Fail awaiting sends whose echo deadline has passed.
    pub fn expire(&mut self, now: Instant) -> usize {
        let Some(timeout) = self.echo_timeout else {
            return 0;
        };
        let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.awaiting)
            .into_iter()
            .partition(|p| p.written_at.is_some_and(|w| w + timeout <= now));
        self.awaiting = kept;

        let count = expired.len();
        if count > 0 {
            warn!(count, "sends expired without echo");
        }
        for item in expired {
            item.settle(Err(SendError::EchoTimeout(timeout)));
        }
        count
    }

    /// Fail everything still outstanding with a shutdown notice.
    pub fn dispose(&mut self) -> usize {
        self.next_tick = None;
        let pending: Vec<PendingSend> = self
            .queue
            .drain(..)
            .chain(self.awaiting.drain(..))
            .collect();
        let count = pending.len();
        for item in pending {
            item.settle(Err(SendError::Shutdown));
        }
        count
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn awaiting(&self) -> usize {
        self.awaiting.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot::error::TryRecvError;

    fn queue() -> SendQueue {
        SendQueue::new(
            Duration::from_millis(992),
            Duration::from_millis(3000),
            EchoPolicy::Single,
            None,
        )
    }

    fn push(q: &mut SendQueue, text: &str, now: Instant) -> oneshot::Receiver<SendResult> {
        let (tx, rx) = oneshot::channel();
        q.enqueue(text.into(), tx, now);
        rx
    }

    /// Dequeue and report a successful write.
    fn write_next(q: &mut SendQueue, now: Instant) -> String {
        let item = q.on_tick(now).expect("queued item");
        let text = item.text().to_owned();
        q.complete_write(item, Ok(()), now);
        text
    }

    #[test]
    fn speech_classification() {
        assert!(is_speech_text("http://example.test/x"));
        assert!(is_speech_text("https://example.test/a/b.html"));
        assert!(!is_speech_text("hello http://example.test"));
        assert!(!is_speech_text("http://example.test/x?y=1"));
        assert!(!is_speech_text("ftp://example.test"));
    }

    #[tokio::test]
    async fn first_enqueue_ticks_immediately() {
        let mut q = queue();
        let now = Instant::now();
        let _rx = push(&mut q, "hello", now);
        assert_eq!(q.next_tick(), Some(now));
    }

    #[tokio::test]
    async fn enqueue_respects_pacing_after_write() {
        let mut q = queue();
        let now = Instant::now();
        let _a = push(&mut q, "a", now);
        write_next(&mut q, now);
        assert_eq!(q.next_tick(), Some(now + Duration::from_millis(992)));

        // queue drained and idled
        let later = now + Duration::from_millis(992);
        assert!(q.on_tick(later).is_none());
        assert_eq!(q.next_tick(), Some(later + Duration::from_millis(3000)));

        // a new send shortly after the idle tick still waits out pacing from the last write
        let _b = push(&mut q, "b", later);
        assert_eq!(q.next_tick(), Some(later));
        let _c = push(&mut q, "c", now + Duration::from_millis(100));
        assert_eq!(q.next_tick(), Some(later));
    }

    #[tokio::test]
    async fn speech_settles_after_write() {
        let mut q = queue();
        let now = Instant::now();
        let mut rx = push(&mut q, "http://example.test/x", now);
        write_next(&mut q, now);
        assert_eq!(rx.try_recv(), Ok(Ok(())));
        assert_eq!(q.awaiting(), 0);
    }

    #[tokio::test]
    async fn ordinary_waits_for_echo() {
        let mut q = queue();
        let now = Instant::now();
        let mut rx = push(&mut q, "hello world", now);
        write_next(&mut q, now);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(q.awaiting(), 1);

        assert_eq!(q.on_echo("something else"), 0);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        assert_eq!(q.on_echo(" hello\u{3000}world "), 1);
        assert_eq!(rx.try_recv(), Ok(Ok(())));
    }

    #[tokio::test]
    async fn write_failure_settles_with_error() {
        let mut q = queue();
        let now = Instant::now();
        let mut rx = push(&mut q, "hello", now);
        let item = q.on_tick(now).unwrap();
        q.complete_write(item, Err(TransportError::Write("broken pipe".into())), now);
        assert_eq!(rx.try_recv(), Ok(Err(SendError::Write("broken pipe".into()))));
        // pacing still applies after a failed write
        assert_eq!(q.next_tick(), Some(now + Duration::from_millis(992)));
    }

    #[tokio::test]
    async fn single_policy_settles_oldest_match_only() {
        let mut q = queue();
        let now = Instant::now();
        let mut first = push(&mut q, "same", now);
        let mut other = push(&mut q, "other", now);
        let mut second = push(&mut q, "same", now);
        for _ in 0..3 {
            write_next(&mut q, now);
        }

        assert_eq!(q.on_echo("same"), 1);
        assert_eq!(first.try_recv(), Ok(Ok(())));
        assert_eq!(other.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(second.try_recv(), Err(TryRecvError::Empty));

        assert_eq!(q.on_echo("same"), 1);
        assert_eq!(second.try_recv(), Ok(Ok(())));
        assert_eq!(q.awaiting(), 1);
    }

    #[tokio::test]
    async fn match_and_younger_policy_settles_tail() {
        let mut q = SendQueue::new(
            Duration::from_millis(992),
            Duration::from_millis(3000),
            EchoPolicy::MatchAndYounger,
            None,
        );
        let now = Instant::now();
        let mut older = push(&mut q, "older", now);
        let mut hit = push(&mut q, "hit", now);
        let mut younger = push(&mut q, "younger", now);
        for _ in 0..3 {
            write_next(&mut q, now);
        }

        assert_eq!(q.on_echo("hit"), 2);
        assert_eq!(older.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(hit.try_recv(), Ok(Ok(())));
        assert_eq!(younger.try_recv(), Ok(Ok(())));
    }

    #[tokio::test]
    async fn echo_timeout_expires_awaiting() {
        let timeout = Duration::from_secs(30);
        let mut q = SendQueue::new(
            Duration::from_millis(992),
            Duration::from_millis(3000),
            EchoPolicy::Single,
            Some(timeout),
        );
        let now = Instant::now();
        let mut rx = push(&mut q, "hello", now);
        assert_eq!(q.next_expiry(), None);
        write_next(&mut q, now);
        assert_eq!(q.next_expiry(), Some(now + timeout));

        assert_eq!(q.expire(now + Duration::from_secs(29)), 0);
        assert_eq!(q.expire(now + timeout), 1);
        assert_eq!(rx.try_recv(), Ok(Err(SendError::EchoTimeout(timeout))));
        assert_eq!(q.next_expiry(), None);
    }

    #[tokio::test]
    async fn no_expiry_without_timeout() {
        let mut q = queue();
        let now = Instant::now();
        let _rx = push(&mut q, "hello", now);
        write_next(&mut q, now);
        assert_eq!(q.next_expiry(), None);
        assert_eq!(q.expire(now + Duration::from_secs(3600)), 0);
    }

    #[tokio::test]
    async fn defer_keeps_head_queued() {
        let mut q = queue();
        let now = Instant::now();
        let _rx = push(&mut q, "hello", now);
        q.defer(now);
        assert_eq!(q.queued(), 1);
        assert_eq!(q.next_tick(), Some(now + Duration::from_millis(992)));
    }

    #[tokio::test]
    async fn dispose_settles_everything_with_shutdown() {
        let mut q = queue();
        let now = Instant::now();
        let mut awaiting = push(&mut q, "first", now);
        write_next(&mut q, now);
        let mut queued_a = push(&mut q, "second", now);
        let mut queued_b = push(&mut q, "third", now);

        assert_eq!(q.dispose(), 3);
        for rx in [&mut awaiting, &mut queued_a, &mut queued_b] {
            assert_eq!(rx.try_recv(), Ok(Err(SendError::Shutdown)));
        }
        assert_eq!(q.next_tick(), None);
        assert_eq!((q.queued(), q.awaiting()), (0, 0));
    }
}

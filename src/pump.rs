//! Output pump state: render-path batching and the throttled notification path.
//!
//! Both types here are plain state machines. The event loop owns the clock
//! and the timers; these only decide *whether* a flush or a delivery is due.

use std::time::Duration;

use bytes::BytesMut;
use tokio::time::Instant;

/// One frame at 60 Hz.
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(16);

pub const DEFAULT_NOTIFY_INTERVAL: Duration = Duration::from_millis(100);

/// Accumulates PTY output between render flushes.
///
/// Every chunk is appended; at most one flush is scheduled at a time. A flush
/// hands back everything accumulated so far as one string, minus a trailing
/// partial UTF-8 sequence, which is held for the next flush.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    pending: BytesMut,
    flush_scheduled: bool,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk. Returns `true` if the caller must schedule a flush.
    pub fn push(&mut self, chunk: &[u8]) -> bool {
        self.pending.extend_from_slice(chunk);
        if self.flush_scheduled {
            false
        } else {
            self.flush_scheduled = true;
            true
        }
    }

    /// Take the flushable contents and clear the scheduled flag.
    pub fn take(&mut self) -> Option<String> {
        self.flush_scheduled = false;
        let len = flushable_len(&self.pending);
        if len == 0 {
            return None;
        }
        let chunk = self.pending.split_to(len);
        Some(String::from_utf8_lossy(&chunk).into_owned())
    }

    /// Take everything, including an incomplete trailing sequence. Used when
    /// no more output can follow.
    pub fn take_all(&mut self) -> Option<String> {
        self.flush_scheduled = false;
        if self.pending.is_empty() {
            return None;
        }
        let chunk = self.pending.split();
        Some(String::from_utf8_lossy(&chunk).into_owned())
    }

    pub fn is_flush_scheduled(&self) -> bool {
        self.flush_scheduled
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Length of the prefix of `buf` that does not end in the middle of a UTF-8
/// sequence.
fn flushable_len(buf: &[u8]) -> usize {
    let len = buf.len();
    for back in 1..=len.min(3) {
        let b = buf[len - back];
        if b & 0x80 == 0 {
            return len;
        }
        if b & 0xC0 == 0xC0 {
            let needed = if b >= 0xF0 {
                4
            } else if b >= 0xE0 {
                3
            } else {
                2
            };
            return if needed > back { len - back } else { len };
        }
    }
    len
}

/// What the caller should do with a notification payload.
#[derive(Debug, PartialEq, Eq)]
pub enum ThrottleDecision<T> {
    /// Deliver now.
    Deliver(T),
    /// Payload is held; arm a timer and call [`Throttle::fire`] after this delay.
    Schedule(Duration),
    /// Payload replaced an already-held one; a timer is already armed.
    Coalesced,
}

/// Leading + trailing rate limiter.
///
/// The first call in a window is delivered immediately. Calls inside the
/// window replace the held payload; the latest one is delivered exactly once
/// when the window closes.
#[derive(Debug)]
pub struct Throttle<T> {
    interval: Duration,
    last_delivery: Option<Instant>,
    pending: Option<T>,
    timer_armed: bool,
}

impl<T> Throttle<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_delivery: None,
            pending: None,
            timer_armed: false,
        }
    }

    pub fn call(&mut self, now: Instant, payload: T) -> ThrottleDecision<T> {
        match self.last_delivery {
            Some(last) if now.saturating_duration_since(last) < self.interval => {
                self.pending = Some(payload);
                if self.timer_armed {
                    ThrottleDecision::Coalesced
                } else {
                    self.timer_armed = true;
                    ThrottleDecision::Schedule(self.interval - now.saturating_duration_since(last))
                }
            }
            _ => {
                // A late timer may still be armed; this delivery supersedes
                // whatever it was holding.
                self.pending = None;
                self.last_delivery = Some(now);
                ThrottleDecision::Deliver(payload)
            }
        }
    }

    /// Trailing edge. Returns the held payload, if any.
    pub fn fire(&mut self, now: Instant) -> Option<T> {
        self.timer_armed = false;
        let payload = self.pending.take()?;
        self.last_delivery = Some(now);
        Some(payload)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

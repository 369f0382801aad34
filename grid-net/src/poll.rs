use std::pin::pin;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use grid_core::time::safe_time_millis;
use grid_core::{GridError, MemberId, Result};

use crate::member_set::MemberIdSet;

/// Poll ids travel on the wire as their low 24 bits; the guard bit keeps a
/// decoded id distinct from the 0 "no poll" sentinel.
pub const POLL_ID_BITS: u32 = 24;
pub const POLL_ID_MASK: u64 = (1 << POLL_ID_BITS) - 1;
pub const POLL_ID_GUARD: u64 = 1 << POLL_ID_BITS;

pub fn encode_wire_id(id: u64) -> u32 {
    (id & POLL_ID_MASK) as u32
}

pub fn decode_wire_id(wire: u32) -> u64 {
    wire as u64 & POLL_ID_MASK | POLL_ID_GUARD
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum PollState {
    Open,
    Closing,
    Closed,
}

/// Tracks one outstanding request against a set of recipients. Every
/// recipient is accounted for exactly once, as a response or as a departure,
/// and the poll closes exactly once when no recipient remains outstanding.
/// `Closed` is terminal; late responses and departures are ignored.
#[derive(Debug)]
pub struct Poll {
    id: u64,
    init_time: u64,
    inner: Mutex<PollInner>,
    notify: Notify,
}

#[derive(Debug)]
struct PollInner {
    state: PollState,
    remaining: MemberIdSet,
    responded: MemberIdSet,
    left: MemberIdSet,
    result: Option<Result<Bytes>>,
    /// Holds the poll open until the request delivery is confirmed, even if
    /// every recipient has already been accounted for.
    pending_delivery: bool,
}

/// What a completed poll yields: the last response payload recorded (if
/// any), and how each recipient was accounted for.
#[derive(Debug)]
pub struct PollOutcome {
    pub result: Option<Bytes>,
    pub responded: MemberIdSet,
    pub left: MemberIdSet,
}

impl Poll {
    pub fn new(id: u64, recipients: MemberIdSet, notify_delivery: bool) -> Self {
        Poll {
            id,
            init_time: safe_time_millis(),
            inner: Mutex::new(PollInner {
                state: PollState::Open,
                remaining: recipients,
                responded: MemberIdSet::new(),
                left: MemberIdSet::new(),
                result: None,
                pending_delivery: notify_delivery,
            }),
            notify: Notify::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn init_time(&self) -> u64 {
        self.init_time
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().state == PollState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().state == PollState::Closed
    }

    pub fn outstanding(&self) -> usize {
        self.inner.lock().remaining.len()
    }

    /// A recipient answered. Its payload replaces any earlier one.
    pub fn on_response(&self, from: MemberId, payload: Bytes) {
        {
            let mut inner = self.inner.lock();
            if inner.state != PollState::Open {
                trace!("poll {} dropped late response from {}", self.id, from);
                return;
            }
            inner.result = Some(Ok(payload));
        }
        self.on_responded(from);
    }

    /// A recipient answered without a payload.
    pub fn on_responded(&self, from: MemberId) {
        let close = {
            let mut inner = self.inner.lock();
            if inner.state != PollState::Open || !inner.remaining.remove(from) {
                return;
            }
            inner.responded.insert(from);
            inner.closeable()
        };
        if close {
            self.close();
        }
    }

    /// A recipient left the service; it will never answer.
    pub fn on_left(&self, id: MemberId) {
        let close = {
            let mut inner = self.inner.lock();
            if inner.state != PollState::Open || !inner.remaining.remove(id) {
                return;
            }
            inner.left.insert(id);
            inner.closeable()
        };
        if close {
            self.close();
        }
    }

    /// The request carrying this poll has been delivered.
    pub fn on_delivery(&self) {
        let close = {
            let mut inner = self.inner.lock();
            if inner.state != PollState::Open {
                return;
            }
            inner.pending_delivery = false;
            inner.closeable()
        };
        if close {
            self.close();
        }
    }

    /// Fail the poll. The error becomes the result seen by the waiter.
    pub fn on_exception(&self, error: GridError) {
        {
            let mut inner = self.inner.lock();
            if inner.state != PollState::Open {
                return;
            }
            inner.result = Some(Err(error));
        }
        self.close();
    }

    /// Close the poll and wake the waiter. Idempotent; only the first call
    /// transitions the state.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state != PollState::Open {
                return;
            }
            inner.state = PollState::Closing;
            // recipients still outstanding at close time stay unaccounted
            inner.remaining.clear();
            inner.state = PollState::Closed;
        }
        trace!("poll {} closed", self.id);
        self.notify.notify_waiters();
    }

    /// Wait until the poll closes or the deadline elapses. A deadline of 0
    /// waits indefinitely. An elapsed deadline closes the poll with the
    /// `Timeout` error, so late responses cannot resurrect it.
    pub async fn wait_completion(&self, deadline: u64) -> Result<PollOutcome> {
        loop {
            let mut notified = pin!(self.notify.notified());
            // register before checking state so a concurrent close is not missed
            notified.as_mut().enable();
            if let Some(outcome) = self.take_outcome() {
                return outcome;
            }
            let remaining = match check_timeout_remaining(deadline) {
                Ok(remaining) => remaining,
                Err(error) => {
                    // a concurrent close wins over the timeout; the next
                    // take_outcome surfaces whichever result landed first
                    self.on_exception(error);
                    continue;
                }
            };
            if remaining == 0 {
                notified.await;
            } else {
                let _ = tokio::time::timeout(Duration::from_millis(remaining), notified).await;
            }
        }
    }

    fn take_outcome(&self) -> Option<Result<PollOutcome>> {
        let mut inner = self.inner.lock();
        if inner.state != PollState::Closed {
            return None;
        }
        let result = match inner.result.take() {
            Some(Err(error)) => return Some(Err(error)),
            Some(Ok(payload)) => Some(payload),
            None => None,
        };
        Some(Ok(PollOutcome {
            result,
            responded: inner.responded.clone(),
            left: inner.left.clone(),
        }))
    }
}

impl PollInner {
    fn closeable(&self) -> bool {
        self.remaining.is_empty() && !self.pending_delivery
    }
}

impl std::fmt::Display for Poll {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        write!(
            f,
            "Poll(Id={}, State={:?}, Remaining={}, Responded={}, Left={})",
            self.id, inner.state, inner.remaining, inner.responded, inner.left
        )
    }
}

/// Milliseconds left before `deadline` on the safe clock. A deadline of 0
/// means no timeout and always yields `Ok(0)`; an elapsed deadline is a
/// `Timeout` error carrying how far overdue the request is.
pub fn check_timeout_remaining(deadline: u64) -> Result<u64> {
    if deadline == 0 {
        return Ok(0);
    }
    let now = safe_time_millis();
    if now >= deadline {
        Err(GridError::Timeout {
            overdue_ms: now - deadline,
        })
    } else {
        Ok(deadline - now)
    }
}

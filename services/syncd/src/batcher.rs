//! Uplink batcher: ships translated messages and waits for per-message acks.
//!
//! One batch is in flight at a time.  Each attempt arms a fresh latch sized
//! to the pending map; positive acks remove the message and count down,
//! negative acks count down but leave the message pending for the next
//! attempt, oversize messages are dropped up front and counted.  A batch
//! succeeds when the latch drains AND the pending map is empty.  After
//! [`MAX_UPLINK_ATTEMPTS`] the remainder is discarded and the batch reports
//! success so the cursor advances past it.

use crate::state::SharedState;
use el_protocol::{UplinkMsg, UplinkResponseMsg, WsMessage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

pub const MAX_UPLINK_ATTEMPTS: u32 = 10;
pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// AckLatch
// ---------------------------------------------------------------------------

/// Count-down latch for one send attempt.
///
/// RPC callbacks hold a reference captured when the attempt was armed, so a
/// late ack for a previous attempt can only touch its own latch.
pub struct AckLatch {
    remaining: AtomicUsize,
    notify: Notify,
}

impl AckLatch {
    pub fn new(count: usize) -> Self {
        AckLatch {
            remaining: AtomicUsize::new(count),
            notify: Notify::new(),
        }
    }

    pub fn count_down(&self) {
        let mut current = self.remaining.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return;
            }
            match self.remaining.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        if self.remaining.load(Ordering::Acquire) == 0 {
            self.notify.notify_waiters();
        }
    }

    /// Wait until the latch drains or `timeout` elapses.
    ///
    /// Returns true iff the latch reached zero.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            // Register the waiter before the zero check so a notify landing
            // in between cannot be missed.
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            if self.remaining.load(Ordering::Acquire) == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return self.remaining.load(Ordering::Acquire) == 0;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// AckRegistry
// ---------------------------------------------------------------------------

/// Pending-message map plus the latch of the attempt currently in flight.
///
/// The session read task resolves acks through this; the batcher owns the
/// batch lifecycle.  The map is non-empty only while a batch is awaiting
/// acks.
pub struct AckRegistry {
    pending: StdMutex<HashMap<i32, UplinkMsg>>,
    latch: StdMutex<Option<Arc<AckLatch>>>,
}

impl AckRegistry {
    pub fn new() -> Self {
        AckRegistry {
            pending: StdMutex::new(HashMap::new()),
            latch: StdMutex::new(None),
        }
    }

    /// Resolve one ack from the cloud.
    ///
    /// Positive acks drop the message from the pending map; negative acks
    /// keep it for resend.  Either way the current attempt's latch counts
    /// down.
    pub fn on_response(&self, resp: &UplinkResponseMsg) {
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if resp.success {
                if pending.remove(&resp.uplink_msg_id).is_some() {
                    trace!(uplink_msg_id = resp.uplink_msg_id, "uplink acked");
                }
            } else {
                warn!(
                    uplink_msg_id = resp.uplink_msg_id,
                    error = resp.error_msg.as_deref().unwrap_or(""),
                    "uplink rejected by cloud, will resend"
                );
            }
        }
        let latch = {
            let guard = self.latch.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        if let Some(latch) = latch {
            latch.count_down();
        }
    }

    fn begin_batch(&self, msgs: Vec<UplinkMsg>) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.clear();
        for msg in msgs {
            pending.insert(msg.uplink_msg_id, msg);
        }
    }

    fn arm_latch(&self, count: usize) -> Arc<AckLatch> {
        let latch = Arc::new(AckLatch::new(count));
        *self.latch.lock().unwrap_or_else(|e| e.into_inner()) = Some(latch.clone());
        latch
    }

    fn pending_msgs(&self) -> Vec<UplinkMsg> {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let mut msgs: Vec<UplinkMsg> = pending.values().cloned().collect();
        msgs.sort_by_key(|m| m.uplink_msg_id);
        msgs
    }

    fn remove(&self, uplink_msg_id: i32) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&uplink_msg_id);
    }

    fn pending_is_empty(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    /// Drain and return the ids still pending (discard path).
    fn take_remaining(&self) -> Vec<i32> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<i32> = pending.keys().copied().collect();
        ids.sort_unstable();
        pending.clear();
        ids
    }

    fn clear(&self) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        *self.latch.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl Default for AckRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// UplinkBatcher
// ---------------------------------------------------------------------------

/// Outcome of a batch send.
#[derive(Debug, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every message was positively acknowledged.
    Delivered,
    /// Attempts exhausted; the listed ids were dropped.  The cursor still
    /// advances (at-least-once with an availability escape valve).
    Discarded(Vec<i32>),
    /// The session went away mid-batch; cursor must not advance.
    Aborted,
}

impl BatchOutcome {
    /// True when the caller should advance the cursor past this batch.
    pub fn advances_cursor(&self) -> bool {
        !matches!(self, BatchOutcome::Aborted)
    }
}

pub struct UplinkBatcher {
    // Serializes batches: at most one in flight.
    lock: Mutex<()>,
    registry: Arc<AckRegistry>,
    state: Arc<SharedState>,
    sleep_between_batches: Duration,
    ack_timeout: Duration,
}

impl UplinkBatcher {
    pub fn new(
        registry: Arc<AckRegistry>,
        state: Arc<SharedState>,
        sleep_between_batches: Duration,
    ) -> Self {
        UplinkBatcher {
            lock: Mutex::new(()),
            registry,
            state,
            sleep_between_batches,
            ack_timeout: ACK_TIMEOUT,
        }
    }

    /// Shorten the per-attempt ack wait.  Production keeps [`ACK_TIMEOUT`].
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Ship a batch, retrying until every message is acked, the attempt
    /// budget runs out, or the session dies.
    pub async fn send_batch(&self, msgs: Vec<UplinkMsg>) -> BatchOutcome {
        let _guard = self.lock.lock().await;
        self.registry.begin_batch(msgs);

        for attempt in 1..=MAX_UPLINK_ATTEMPTS {
            if !self.state.initialized() {
                debug!(attempt, "manager uninitialized, abandoning batch");
                self.registry.clear();
                return BatchOutcome::Aborted;
            }

            let pending = self.registry.pending_msgs();
            if pending.is_empty() {
                return BatchOutcome::Delivered;
            }

            let latch = self.registry.arm_latch(pending.len());
            let max_size = self.state.max_inbound_message_size();
            for msg in pending {
                let size = msg.serialized_size();
                if size > max_size {
                    warn!(
                        uplink_msg_id = msg.uplink_msg_id,
                        size,
                        max_size,
                        "uplink message exceeds max inbound size, dropping"
                    );
                    self.registry.remove(msg.uplink_msg_id);
                    latch.count_down();
                    continue;
                }
                if !self.state.send_to_cloud(WsMessage::UplinkMsg(msg)).await {
                    debug!("no active session for uplink send");
                }
            }

            let drained = latch.wait(self.ack_timeout).await;
            if drained && self.registry.pending_is_empty() {
                return BatchOutcome::Delivered;
            }

            warn!(
                attempt,
                max_attempts = MAX_UPLINK_ATTEMPTS,
                "uplink batch not fully acknowledged"
            );
            if attempt < MAX_UPLINK_ATTEMPTS {
                tokio::time::sleep(self.sleep_between_batches).await;
            }
        }

        let dropped = self.registry.take_remaining();
        warn!(
            dropped_ids = ?dropped,
            "discarding uplink messages after exhausted attempts"
        );
        BatchOutcome::Discarded(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use el_protocol::UplinkPayload;
    use uuid::Uuid;

    fn msg(id: i32) -> UplinkMsg {
        UplinkMsg {
            uplink_msg_id: id,
            payloads: vec![UplinkPayload::AttributesRequest {
                entity_id: Uuid::nil(),
            }],
        }
    }

    fn ack(id: i32, success: bool) -> UplinkResponseMsg {
        UplinkResponseMsg {
            uplink_msg_id: id,
            success,
            error_msg: None,
        }
    }

    #[tokio::test]
    async fn latch_drains_on_count_down() {
        let latch = Arc::new(AckLatch::new(2));
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait(Duration::from_secs(5)).await })
        };
        latch.count_down();
        latch.count_down();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn latch_times_out_when_not_drained() {
        let latch = AckLatch::new(3);
        latch.count_down();
        assert!(!latch.wait(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn latch_extra_count_down_is_saturating() {
        let latch = AckLatch::new(1);
        latch.count_down();
        latch.count_down();
        assert!(latch.wait(Duration::from_millis(10)).await);
    }

    #[test]
    fn positive_ack_removes_pending_negative_keeps() {
        let registry = AckRegistry::new();
        registry.begin_batch(vec![msg(1), msg(2)]);
        let latch = registry.arm_latch(2);

        registry.on_response(&ack(1, true));
        registry.on_response(&ack(2, false));

        assert!(!registry.pending_is_empty());
        assert_eq!(registry.pending_msgs().len(), 1);
        assert_eq!(registry.pending_msgs()[0].uplink_msg_id, 2);
        assert_eq!(latch.remaining.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn batch_aborts_when_uninitialized() {
        let registry = Arc::new(AckRegistry::new());
        let state = Arc::new(SharedState::new());
        let batcher = UplinkBatcher::new(registry.clone(), state, Duration::from_millis(1))
            .with_ack_timeout(Duration::from_millis(10));

        let outcome = batcher.send_batch(vec![msg(1)]).await;
        assert_eq!(outcome, BatchOutcome::Aborted);
        assert!(registry.pending_is_empty());
    }

    #[tokio::test]
    async fn oversize_messages_are_dropped_and_counted() {
        let registry = Arc::new(AckRegistry::new());
        let state = Arc::new(SharedState::new());
        state.set_initialized(true);
        state.set_max_inbound_message_size(1);
        let batcher = UplinkBatcher::new(registry.clone(), state, Duration::from_millis(1))
            .with_ack_timeout(Duration::from_millis(50));

        // Every message exceeds 1 byte, so the latch drains without a send.
        let outcome = batcher.send_batch(vec![msg(1), msg(2)]).await;
        assert_eq!(outcome, BatchOutcome::Delivered);
        assert!(registry.pending_is_empty());
    }

    #[tokio::test]
    async fn exhausted_attempts_discard_and_report() {
        let registry = Arc::new(AckRegistry::new());
        let state = Arc::new(SharedState::new());
        state.set_initialized(true);
        // No session attached: sends go nowhere and no acks ever arrive.
        let batcher = UplinkBatcher::new(registry.clone(), state, Duration::from_millis(1))
            .with_ack_timeout(Duration::from_millis(5));

        let outcome = batcher.send_batch(vec![msg(1), msg(2)]).await;
        assert_eq!(outcome, BatchOutcome::Discarded(vec![1, 2]));
        assert!(outcome.advances_cursor());
        assert!(registry.pending_is_empty());
    }
}

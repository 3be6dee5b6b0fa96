//! Sync manager facade.
//!
//! Composes the controller, reader, translators, and batcher, and drives
//! the outer sync loop: load cursor, probe the log, page, translate, batch,
//! advance.  The loop drains back-to-back pages without sleeping and idles
//! on `no_records_sleep_ms` otherwise.

use crate::batcher::{AckRegistry, UplinkBatcher};
use crate::config::SyncConfig;
use crate::controller::{ExitReason, SessionController, idle};
use crate::cursor::CursorStore;
use crate::downlink::{DownlinkProcessor, StoreDownlinkProcessor};
use crate::reader::EventLogReader;
use crate::state::SharedState;
use crate::storage::SyncStore;
use crate::translate::TranslatorRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

/// Complaint cadence while routing credentials are missing.
const COMPLAINT_INTERVAL: Duration = Duration::from_secs(10);
/// Outer loop poll cadence while the session is not yet initialized.
const UNINITIALIZED_SLEEP: Duration = Duration::from_secs(1);

pub struct SyncManager {
    cfg: SyncConfig,
    store: Arc<Mutex<SyncStore>>,
    state: Arc<SharedState>,
    registry: Arc<AckRegistry>,
    translators: Arc<TranslatorRegistry>,
    processor: Arc<dyn DownlinkProcessor>,
    ack_timeout: Option<Duration>,
}

impl SyncManager {
    pub fn new(cfg: SyncConfig, store: Arc<Mutex<SyncStore>>) -> Self {
        let state = Arc::new(SharedState::new());
        let processor = Arc::new(StoreDownlinkProcessor::new(store.clone(), state.clone()));
        SyncManager {
            cfg,
            store,
            state,
            registry: Arc::new(AckRegistry::new()),
            translators: Arc::new(TranslatorRegistry::with_defaults()),
            processor,
            ack_timeout: None,
        }
    }

    /// Swap the downlink processor (tests, embedders).
    pub fn with_processor(mut self, processor: Arc<dyn DownlinkProcessor>) -> Self {
        self.processor = processor;
        self
    }

    /// Shorten the batcher's ack wait.  Production keeps the default.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = Some(timeout);
        self
    }

    /// Shared state handle, for observation from the outside.
    pub fn state(&self) -> Arc<SharedState> {
        self.state.clone()
    }

    /// Run until shutdown.  Returns an exit reason only when the process
    /// should terminate abnormally (non-CE cloud).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Option<ExitReason> {
        if !self.cfg.cloud.has_credentials() {
            warn!("cloud routing credentials missing, sync stays inactive");
            loop {
                if !idle(&mut shutdown, COMPLAINT_INTERVAL).await {
                    return None;
                }
                warn!("cloud routing credentials missing, sync stays inactive");
            }
        }

        let mut batcher = UplinkBatcher::new(
            self.registry.clone(),
            self.state.clone(),
            Duration::from_millis(self.cfg.event_storage.sleep_between_batches_ms),
        );
        if let Some(timeout) = self.ack_timeout {
            batcher = batcher.with_ack_timeout(timeout);
        }

        let reader = EventLogReader::new(self.store.clone(), self.cfg.event_storage.max_read_records);
        let cursor = CursorStore::new(self.store.clone());
        let no_records_sleep = Duration::from_millis(self.cfg.event_storage.no_records_sleep_ms);

        // The outer loop stops when the controller returns, whatever the cause.
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = tokio::spawn(outer_loop(
            self.state.clone(),
            cursor,
            reader,
            self.translators.clone(),
            batcher,
            no_records_sleep,
            stop_rx,
        ));

        let controller = SessionController::new(
            self.cfg.clone(),
            self.store.clone(),
            self.state.clone(),
            self.registry.clone(),
            self.processor.clone(),
        );
        let reason = controller.run(shutdown).await;

        let _ = stop_tx.send(true);
        if let Err(e) = worker.await {
            warn!(error = %e, "sync worker panicked");
        }
        info!("sync manager stopped");
        reason
    }
}

/// The outer sync loop: one page per iteration, cursor advanced only after
/// the batch reports success (delivery or deliberate discard).
async fn outer_loop(
    state: Arc<SharedState>,
    cursor: CursorStore,
    reader: EventLogReader,
    translators: Arc<TranslatorRegistry>,
    batcher: UplinkBatcher,
    no_records_sleep: Duration,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            return;
        }
        if !state.initialized() {
            if !idle(&mut stop, UNINITIALIZED_SLEEP).await {
                return;
            }
            continue;
        }
        let Some(tenant_id) = state.tenant() else {
            if !idle(&mut stop, UNINITIALIZED_SLEEP).await {
                return;
            }
            continue;
        };

        let (queue_start_ts, seq_id_offset) = match cursor.load(tenant_id).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "cursor load failed");
                if !idle(&mut stop, no_records_sleep).await {
                    return;
                }
                continue;
            }
        };

        match reader.check_new_work(seq_id_offset, queue_start_ts).await {
            Ok(true) => {}
            Ok(false) => {
                if !idle(&mut stop, no_records_sleep).await {
                    return;
                }
                continue;
            }
            Err(e) => {
                warn!(error = %e, "event log probe failed");
                if !idle(&mut stop, no_records_sleep).await {
                    return;
                }
                continue;
            }
        }

        let page = match reader.read_page(seq_id_offset, queue_start_ts).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "event log read failed");
                if !idle(&mut stop, no_records_sleep).await {
                    return;
                }
                continue;
            }
        };
        let Some(last) = page.entries.last().cloned() else {
            if !idle(&mut stop, no_records_sleep).await {
                return;
            }
            continue;
        };

        let msgs = translators.translate_all(&page.entries);
        if !msgs.is_empty() {
            debug!(events = page.entries.len(), msgs = msgs.len(), "shipping batch");
            let outcome = batcher.send_batch(msgs).await;
            if !outcome.advances_cursor() {
                debug!("batch abandoned, cursor stays");
                continue;
            }
        }

        // The new window starts at the wall-clock instant of the last
        // shipped event, recovered from its time-ordered uuid.
        let new_start_ts = last.ts_millis();
        state.set_queue_start_ts(new_start_ts);
        cursor.store(tenant_id, new_start_ts, last.seq_id).await;

        if !page.has_next {
            if !idle(&mut stop, no_records_sleep).await {
                return;
            }
        }
    }
}

//! Signal bus coordinating capture lifecycle with rotation.
//!
//! Two pot-addressed, best-effort channels:
//!
//! - **stop**: one single-slot channel per live capture. Sending never
//!   blocks; a second stop while one is already queued is coalesced. Only the
//!   capture registered for a pot can receive its stop.
//! - **resume**: a set of pending pot names plus a wakeup. Repeated resumes
//!   for the same pot before the dispatcher drains them collapse into one.
//! - **abort**: same shape as resume. Sent when a capture ignored its stop;
//!   the task owner tears the capture down.
//!
//! Registering a capture hands out a [`StopReceiver`]. While it is alive no
//! second capture can register for the same pot, which is what keeps captures
//! mutually exclusive. Dropping it (after the capture file is closed) marks
//! the capture finished, which is what a [`StopTicket`] waits for.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, mpsc, watch};
use tracing::debug;

use crate::error::CaptureError;

#[derive(Debug, Default)]
struct BusState {
    stops: HashMap<String, StopSlot>,
    resumes: BTreeSet<String>,
    aborts: BTreeSet<String>,
    next_token: u64,
}

#[derive(Debug)]
struct StopSlot {
    token: u64,
    tx: mpsc::Sender<()>,
    finished: watch::Receiver<()>,
}

/// Shared stop/resume signaling, cheap to clone
#[derive(Debug, Clone, Default)]
pub struct SignalBus {
    state: Arc<Mutex<BusState>>,
    resume_wakeup: Arc<Notify>,
    abort_wakeup: Arc<Notify>,
}

/// What happened to a stop signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDelivery {
    /// Queued for the live capture
    Delivered,
    /// A stop was already queued; coalesced with it
    AlreadyPending,
    /// No capture is registered for this pot
    NoCapture,
}

/// Handle for waiting until a stopped capture has released its file
#[derive(Debug)]
pub struct StopTicket {
    pub delivery: StopDelivery,
    finished: Option<watch::Receiver<()>>,
}

impl StopTicket {
    /// Wait until the capture has finished, up to `limit`.
    ///
    /// Returns false on timeout. Returns true immediately when there was no
    /// capture to stop.
    pub async fn wait_finished(mut self, limit: Duration) -> bool {
        let Some(rx) = self.finished.as_mut() else {
            return true;
        };
        // The sender only ever closes; `changed` errors exactly when it does.
        tokio::time::timeout(limit, async {
            while rx.changed().await.is_ok() {}
        })
        .await
        .is_ok()
    }
}

/// Receiving end of one capture's stop slot
#[derive(Debug)]
pub struct StopReceiver {
    pot: String,
    token: u64,
    rx: mpsc::Receiver<()>,
    _finished: watch::Sender<()>,
    bus: SignalBus,
}

impl StopReceiver {
    #[must_use]
    pub fn pot(&self) -> &str {
        &self.pot
    }

    /// Resolves when a stop for this pot arrives.
    ///
    /// Cancel-safe, so it can sit in a `select!` next to packet reads.
    pub async fn stopped(&mut self) {
        // The bus keeps a sender while this receiver is registered, so `None`
        // only happens if the slot was torn down; treat that as a stop too.
        let _ = self.rx.recv().await;
    }
}

impl Drop for StopReceiver {
    fn drop(&mut self) {
        let mut state = self.bus.lock();
        if state
            .stops
            .get(&self.pot)
            .is_some_and(|slot| slot.token == self.token)
        {
            state.stops.remove(&self.pot);
        }
    }
}

impl SignalBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the stop slot for `pot`. Fails while another capture holds it.
    pub fn register_capture(&self, pot: &str) -> Result<StopReceiver, CaptureError> {
        let mut state = self.lock();
        if state.stops.contains_key(pot) {
            return Err(CaptureError::AlreadyRunning(pot.to_string()));
        }
        let token = state.next_token;
        state.next_token += 1;
        let (tx, rx) = mpsc::channel(1);
        let (finished_tx, finished_rx) = watch::channel(());
        state.stops.insert(
            pot.to_string(),
            StopSlot {
                token,
                tx,
                finished: finished_rx,
            },
        );
        drop(state);
        Ok(StopReceiver {
            pot: pot.to_string(),
            token,
            rx,
            _finished: finished_tx,
            bus: self.clone(),
        })
    }

    /// Send a stop to the capture of `pot` without blocking.
    pub fn send_stop(&self, pot: &str) -> StopTicket {
        let state = self.lock();
        let Some(slot) = state.stops.get(pot) else {
            debug!(pot, "stop signal with no live capture");
            return StopTicket {
                delivery: StopDelivery::NoCapture,
                finished: None,
            };
        };
        let delivery = match slot.tx.try_send(()) {
            Ok(()) => StopDelivery::Delivered,
            Err(mpsc::error::TrySendError::Full(())) => StopDelivery::AlreadyPending,
            Err(mpsc::error::TrySendError::Closed(())) => StopDelivery::AlreadyPending,
        };
        StopTicket {
            delivery,
            finished: Some(slot.finished.clone()),
        }
    }

    /// Whether a capture currently holds the stop slot for `pot`
    #[must_use]
    pub fn is_capturing(&self, pot: &str) -> bool {
        self.lock().stops.contains_key(pot)
    }

    /// Pots with a registered capture, sorted
    #[must_use]
    pub fn live_captures(&self) -> Vec<String> {
        let mut pots: Vec<String> = self.lock().stops.keys().cloned().collect();
        pots.sort();
        pots
    }

    /// Ask the dispatcher to restart capture for `pot`.
    pub fn send_resume(&self, pot: &str) {
        self.lock().resumes.insert(pot.to_string());
        self.resume_wakeup.notify_one();
    }

    /// Drain pending resume requests in name order.
    #[must_use]
    pub fn take_resumes(&self) -> Vec<String> {
        std::mem::take(&mut self.lock().resumes).into_iter().collect()
    }

    /// Resolves once a resume has been sent since the last wakeup.
    ///
    /// A resume sent while nobody waits is remembered, so none are missed.
    pub async fn resume_requested(&self) {
        self.resume_wakeup.notified().await;
    }

    /// Ask the owner of the capture task for `pot` to abort it.
    ///
    /// The returned ticket resolves once the capture has released its slot.
    pub fn request_abort(&self, pot: &str) -> StopTicket {
        let mut state = self.lock();
        let Some(slot) = state.stops.get(pot) else {
            return StopTicket {
                delivery: StopDelivery::NoCapture,
                finished: None,
            };
        };
        let finished = Some(slot.finished.clone());
        let delivery = if state.aborts.insert(pot.to_string()) {
            StopDelivery::Delivered
        } else {
            StopDelivery::AlreadyPending
        };
        drop(state);
        self.abort_wakeup.notify_one();
        StopTicket { delivery, finished }
    }

    /// Drain pending abort requests in name order.
    #[must_use]
    pub fn take_aborts(&self) -> Vec<String> {
        std::mem::take(&mut self.lock().aborts).into_iter().collect()
    }

    /// Resolves once an abort has been requested since the last wakeup.
    pub async fn abort_requested(&self) {
        self.abort_wakeup.notified().await;
    }
}

//! Per-URL publish/subscribe rate limiter. Grounded on `vsoa_regulator_t`: a dedicated timer
//! thread wakes up every `period` and, for each dirty slot, hands the last buffered payload to
//! that slot's `ondelay` callback — coalescing any number of intervening `update` calls into at
//! most one delivery per period.

use slog::Logger;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use vsoa_support::error::{VsoaError, VsoaErrorKind, VsoaResult};

type OnDelay = dyn Fn(&[u8], &[u8]) + Send + Sync;

struct Slot {
    url: Vec<u8>,
    buf_size: usize,
    payload: Mutex<Option<Vec<u8>>>,
    dirty: AtomicBool,
    ondelay: Box<OnDelay>,
}

struct Inner {
    period_ms: AtomicU64,
    slots: Mutex<HashMap<Vec<u8>, Arc<Slot>>>,
    shutdown: AtomicBool,
    log: Logger,
}

/// A speed regulator. Shared cheaply (`Clone`) so both the timer thread and the caller hold a
/// handle to the same slot table.
#[derive(Clone)]
pub struct Regulator {
    inner: Arc<Inner>,
    timer: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Regulator {
    /// `period` must be at least 1ms.
    pub fn new(period: Duration, log: Logger) -> Regulator {
        let inner = Arc::new(Inner {
            period_ms: AtomicU64::new(period.as_millis().max(1) as u64),
            slots: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            log,
        });

        let timer_inner = inner.clone();
        let handle = thread::Builder::new()
            .name("vsoa-regulator".to_owned())
            .spawn(move || timer_loop(timer_inner))
            .expect("failed to spawn regulator timer thread");

        Regulator { inner, timer: Arc::new(Mutex::new(Some(handle))) }
    }

    pub fn set_period(&self, period: Duration) {
        self.inner.period_ms.store(period.as_millis().max(1) as u64, Ordering::SeqCst);
    }

    /// Adds a slot keyed by `url`. `buf_size` bounds the payload `update` may submit.
    pub fn slot<F>(&self, url: &[u8], buf_size: usize, ondelay: F)
    where
        F: Fn(&[u8], &[u8]) + Send + Sync + 'static,
    {
        self.inner.slots.lock().expect("regulator lock poisoned").insert(
            url.to_vec(),
            Arc::new(Slot {
                url: url.to_vec(),
                buf_size,
                payload: Mutex::new(None),
                dirty: AtomicBool::new(false),
                ondelay: Box::new(ondelay),
            }),
        );
    }

    pub fn unslot(&self, url: &[u8]) -> bool {
        self.inner.slots.lock().expect("regulator lock poisoned").remove(url).is_some()
    }

    pub fn has_slot(&self, url: &[u8]) -> Option<usize> {
        self.inner.slots.lock().expect("regulator lock poisoned").get(url).map(|s| s.buf_size)
    }

    /// Coalesces `payload` into the slot for `url`: the most recent call wins.
    pub fn update(&self, url: &[u8], payload: &[u8]) -> VsoaResult<()> {
        let slot = self.find(url)?;
        if payload.len() > slot.buf_size {
            return Err(VsoaError::Fatal(VsoaErrorKind::SlotTooSmall));
        }
        *slot.payload.lock().expect("slot lock poisoned") = Some(payload.to_vec());
        slot.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Drops any buffered (not yet delivered) payload for `url`, without removing the slot.
    pub fn clear(&self, url: &[u8]) -> VsoaResult<()> {
        let slot = self.find(url)?;
        *slot.payload.lock().expect("slot lock poisoned") = None;
        slot.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn find(&self, url: &[u8]) -> VsoaResult<Arc<Slot>> {
        self.inner
            .slots
            .lock()
            .expect("regulator lock poisoned")
            .get(url)
            .cloned()
            .ok_or(VsoaError::Fatal(VsoaErrorKind::NoSuchSlot))
    }
}

impl Drop for Regulator {
    fn drop(&mut self) {
        // Only the last handle (timer thread's Arc clone aside) tears the thread down.
        if Arc::strong_count(&self.inner) <= 2 {
            self.inner.shutdown.store(true, Ordering::SeqCst);
            if let Some(handle) = self.timer.lock().expect("timer lock poisoned").take() {
                let _ = handle.join();
            }
        }
    }
}

fn timer_loop(inner: Arc<Inner>) {
    while !inner.shutdown.load(Ordering::SeqCst) {
        let period = Duration::from_millis(inner.period_ms.load(Ordering::SeqCst));
        thread::sleep(period);

        let slots: Vec<Arc<Slot>> = inner.slots.lock().expect("regulator lock poisoned").values().cloned().collect();
        for slot in slots {
            if !slot.dirty.swap(false, Ordering::SeqCst) {
                continue;
            }
            let mut guard = slot.payload.lock().expect("slot lock poisoned");
            if let Some(payload) = guard.as_ref() {
                (slot.ondelay)(&slot.url, payload);
            }
            // keep buffer around (ondelay may be called again with the same payload if a newer
            // `update` doesn't land before the next tick is irrelevant: `dirty` already reset).
            let _ = &mut *guard;
        }
    }
    slog::debug!(inner.log, "regulator timer thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn coalesces_updates_within_one_period() {
        let (tx, rx) = mpsc::channel();
        let reg = Regulator::new(Duration::from_millis(50), vsoa_support::logging::default_logger());
        reg.slot(b"/rate", 16, move |url, payload| {
            tx.send((url.to_vec(), payload.to_vec())).unwrap();
        });

        reg.update(b"/rate", b"1").unwrap();
        thread::sleep(Duration::from_millis(10));
        reg.update(b"/rate", b"2").unwrap();

        let (got_url, got_payload) = rx.recv_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(got_url, b"/rate");
        assert_eq!(got_payload, b"2");
        assert!(rx.recv_timeout(Duration::from_millis(80)).is_err());
    }

    #[test]
    fn unslot_removes_buffered_data() {
        let reg = Regulator::new(Duration::from_millis(1000), vsoa_support::logging::default_logger());
        reg.slot(b"/x", 8, |_, _| {});
        reg.update(b"/x", b"hi").unwrap();
        assert!(reg.unslot(b"/x"));
        assert!(reg.update(b"/x", b"hi").is_err());
    }

    #[test]
    fn rejects_oversized_payload() {
        let reg = Regulator::new(Duration::from_millis(1000), vsoa_support::logging::default_logger());
        reg.slot(b"/x", 2, |_, _| {});
        assert!(reg.update(b"/x", b"too big").is_err());
    }
}

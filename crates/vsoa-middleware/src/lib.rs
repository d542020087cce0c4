//! Chained RPC command handlers sharing a refcounted "resolve" scratchpad. Grounded on
//! `vsoa_mware_t`/`vsoa_mware_resolve_t`: each step in a chain may stash typed data for the next
//! step, or outlive the chain entirely by holding an extra reference and replying later from an
//! asynchronous context.

use hashbrown::HashMap;
use std::any::Any;
use std::sync::{Arc, Mutex};

/// Payload handed to a reply sink: reference-only, valid for the duration of the call.
pub struct ReplyPayload<'a> {
    pub param: &'a [u8],
    pub data: &'a [u8],
}

/// Whatever owns the original RPC connection implements this so a middleware step can reply
/// immediately, or stash a `Resolve` reference and reply later from another thread.
pub trait ReplySink: Send + Sync {
    fn reply(&self, status: u8, tunid: u16, payload: ReplyPayload<'_>);
}

struct ResolveInner {
    data: Mutex<HashMap<String, Box<dyn Any + Send>>>,
    sink: Arc<dyn ReplySink>,
}

/// Refcounted, thread-shareable scratchpad passed through a middleware chain. Cloning is the
/// `vsoa_mware_ref_resolve` operation; the last clone dropped is the `unref` that actually frees
/// the stored values (Rust's `Drop` stands in for the C API's explicit free callbacks).
#[derive(Clone)]
pub struct Resolve {
    inner: Arc<ResolveInner>,
}

impl Resolve {
    pub fn new(sink: Arc<dyn ReplySink>) -> Resolve {
        Resolve {
            inner: Arc::new(ResolveInner { data: Mutex::new(HashMap::new()), sink }),
        }
    }

    pub fn add<T: Any + Send>(&self, key: &str, value: T) {
        self.inner.data.lock().expect("resolve lock poisoned").insert(key.to_owned(), Box::new(value));
    }

    pub fn get<T: Any + Send + Clone>(&self, key: &str) -> Option<T> {
        self.inner
            .data
            .lock()
            .expect("resolve lock poisoned")
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Current reference count; mirrors `vsoa_mware_ref_resolve`'s return value (this count
    /// already includes the caller's own handle).
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Reply to the caller using this resolve's saved RPC context.
    pub fn reply(&self, status: u8, tunid: u16, param: &[u8], data: &[u8]) {
        self.inner.sink.reply(status, tunid, ReplyPayload { param, data });
    }
}

/// A single chain step: returns `true` to continue to the next step, `false` to stop the chain
/// (the step is expected to have replied itself, or to reply later via a retained `Resolve`).
pub type Step<Req> = Box<dyn Fn(&Req, &Resolve) -> bool + Send + Sync>;

/// An ordered chain of command handlers sharing one `Resolve` per invocation. Generic over the
/// request type so this crate stays decoupled from the server's RPC request shape.
pub struct Chain<Req> {
    steps: Mutex<Vec<Step<Req>>>,
}

impl<Req> Chain<Req> {
    pub fn new() -> Chain<Req> {
        Chain { steps: Mutex::new(Vec::new()) }
    }

    pub fn add_listener(&self, step: Step<Req>) {
        self.steps.lock().expect("chain lock poisoned").push(step);
    }

    /// Runs every step in registration order against a fresh `Resolve`, stopping early if a
    /// step returns `false`. Returns the `Resolve` so the caller can check its final refcount
    /// (`> 1` means a step retained it for an asynchronous reply).
    pub fn run(&self, req: &Req, sink: Arc<dyn ReplySink>) -> Resolve {
        let resolve = Resolve::new(sink);
        let steps = self.steps.lock().expect("chain lock poisoned");
        for step in steps.iter() {
            if !step(req, &resolve) {
                break;
            }
        }
        resolve
    }
}

impl<Req> Default for Chain<Req> {
    fn default() -> Chain<Req> {
        Chain::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink(StdMutex<Vec<(u8, Vec<u8>)>>);
    impl ReplySink for RecordingSink {
        fn reply(&self, status: u8, _tunid: u16, payload: ReplyPayload<'_>) {
            self.0.lock().unwrap().push((status, payload.param.to_vec()));
        }
    }

    #[test]
    fn steps_run_in_order_and_share_resolve_data() {
        let chain: Chain<()> = Chain::new();
        chain.add_listener(Box::new(|_req, resolve| {
            resolve.add("count", 1u32);
            true
        }));
        chain.add_listener(Box::new(|_req, resolve| {
            let count: u32 = resolve.get("count").unwrap();
            resolve.add("count", count + 1);
            true
        }));

        let sink = Arc::new(RecordingSink(StdMutex::new(Vec::new())));
        let resolve = chain.run(&(), sink);
        assert_eq!(resolve.get::<u32>("count"), Some(2));
    }

    #[test]
    fn returning_false_stops_the_chain() {
        let chain: Chain<()> = Chain::new();
        chain.add_listener(Box::new(|_req, resolve| {
            resolve.reply(0, 0, b"early", b"");
            false
        }));
        chain.add_listener(Box::new(|_req, resolve| {
            resolve.add("unreachable", true);
            true
        }));

        let sink = Arc::new(RecordingSink(StdMutex::new(Vec::new())));
        let resolve = chain.run(&(), sink.clone());
        assert!(resolve.get::<bool>("unreachable").is_none());
        assert_eq!(sink.0.lock().unwrap()[0].0, 0);
    }

    #[test]
    fn ref_and_unref_track_async_retention() {
        let sink = Arc::new(RecordingSink(StdMutex::new(Vec::new())));
        let resolve = Resolve::new(sink);
        assert_eq!(resolve.refcount(), 1);
        let retained = resolve.clone();
        assert_eq!(resolve.refcount(), 2);
        drop(retained);
        assert_eq!(resolve.refcount(), 1);
    }
}

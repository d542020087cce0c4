//! RPC listener registration and the bounded parallel-dispatch worker pool. Grounded on
//! `vsoa_server_add_listener`/`vsoa_plistener_t`: a listener is a middleware chain routed by URL;
//! a parallel listener additionally hands each invocation to a fixed worker pool instead of
//! running it inline on the dispatcher thread, with a bounded queue so a slow handler applies
//! backpressure instead of unbounded memory growth.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use slog::Logger;
use vsoa_middleware::{Chain, ReplySink};

use crate::config::MAX_RPC_WORKER_THREADS;

/// One RPC call, fully decoded, handed to a listener's chain.
#[derive(Clone)]
pub struct RpcRequest {
    pub client: crate::client::ClientId,
    pub seqno: u32,
    pub tunid: u16,
    pub url: Vec<u8>,
    pub param: Vec<u8>,
    pub data: Vec<u8>,
}

/// A registered RPC route: the middleware chain plus an optional parallel worker pool.
pub struct RpcListener {
    pub pattern: Vec<u8>,
    pub chain: Chain<RpcRequest>,
    pub plistener: Option<Arc<Plistener>>,
}

// Identity equality so `Arc<RpcListener>` can live in `vsoa_trie::Trie`, which dedups by value;
// two listeners are "the same" only if they're the same registration.
impl PartialEq for RpcListener {
    fn eq(&self, other: &RpcListener) -> bool {
        std::ptr::eq(self, other)
    }
}
impl Eq for RpcListener {}
impl std::hash::Hash for RpcListener {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (self as *const RpcListener).hash(state)
    }
}

impl RpcListener {
    pub fn new(pattern: &[u8]) -> RpcListener {
        RpcListener { pattern: pattern.to_vec(), chain: Chain::new(), plistener: None }
    }

    /// Dispatches `req` either inline (on the caller's thread, i.e. the dispatcher) or onto this
    /// listener's parallel pool.
    pub fn dispatch(self: &Arc<Self>, req: RpcRequest, sink: Arc<dyn ReplySink>) {
        match &self.plistener {
            Some(pool) => pool.submit(self.clone(), req, sink),
            None => {
                self.chain.run(&req, sink);
            }
        }
    }
}

struct Job {
    listener: Arc<RpcListener>,
    req: RpcRequest,
    sink: Arc<dyn ReplySink>,
}

struct PoolState {
    jobs: Mutex<VecDeque<Job>>,
    cond: Condvar,
    space_cond: Condvar,
    shutdown: Mutex<bool>,
    max_queued: usize,
}

/// Fixed-size worker pool shared by every parallel RPC listener registered against it. A single
/// pool may back several URL patterns (mirrors `vsoa_plistener_create`'s "one pool, many
/// listeners" usage).
pub struct Plistener {
    state: Arc<PoolState>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Plistener {
    /// `worker_count` is clamped to `[1, MAX_RPC_WORKER_THREADS]`. `max_queued` bounds how many
    /// jobs may wait for a free worker before `submit` blocks the caller; `max_queued == 0` means
    /// the queue is unbounded.
    pub fn new(worker_count: usize, max_queued: usize, log: Logger) -> Arc<Plistener> {
        let worker_count = worker_count.clamp(1, MAX_RPC_WORKER_THREADS);
        let state = Arc::new(PoolState {
            jobs: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            space_cond: Condvar::new(),
            shutdown: Mutex::new(false),
            max_queued,
        });

        let workers = (0..worker_count)
            .map(|idx| {
                let worker_state = state.clone();
                let worker_log = log.new(slog::o!("component" => "plistener", "worker" => idx));
                thread::Builder::new()
                    .name(format!("vsoa-plistener-{}", idx))
                    .spawn(move || worker_loop(worker_state, worker_log))
                    .expect("failed to spawn plistener worker thread")
            })
            .collect();

        Arc::new(Plistener { state, workers: Mutex::new(workers) })
    }

    /// Queues a job. `max_queued == 0` means the queue is unbounded and this always returns
    /// immediately. Otherwise, once the queue holds `max_queued` jobs, the caller (the dispatcher
    /// thread) blocks here until a worker frees a slot, applying backpressure instead of growing
    /// memory without bound.
    fn submit(&self, listener: Arc<RpcListener>, req: RpcRequest, sink: Arc<dyn ReplySink>) {
        let mut jobs = self.state.jobs.lock().expect("plistener queue lock poisoned");
        if self.state.max_queued > 0 {
            while jobs.len() >= self.state.max_queued {
                if *self.state.shutdown.lock().expect("plistener shutdown lock poisoned") {
                    return;
                }
                jobs = self.state.space_cond.wait(jobs).expect("plistener queue lock poisoned");
            }
        }
        jobs.push_back(Job { listener, req, sink });
        self.state.cond.notify_one();
    }

    pub fn queued(&self) -> usize {
        self.state.jobs.lock().expect("plistener queue lock poisoned").len()
    }
}

impl Drop for Plistener {
    fn drop(&mut self) {
        *self.state.shutdown.lock().expect("plistener shutdown lock poisoned") = true;
        self.state.cond.notify_all();
        self.state.space_cond.notify_all();
        for handle in self.workers.lock().expect("plistener workers lock poisoned").drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(state: Arc<PoolState>, _log: Logger) {
    loop {
        let job = {
            let mut jobs = state.jobs.lock().expect("plistener queue lock poisoned");
            loop {
                if let Some(job) = jobs.pop_front() {
                    state.space_cond.notify_one();
                    break Some(job);
                }
                if *state.shutdown.lock().expect("plistener shutdown lock poisoned") {
                    return;
                }
                jobs = state.cond.wait(jobs).expect("plistener queue lock poisoned");
            }
        };

        let Some(job) = job else { return };
        job.listener.chain.run(&job.req, job.sink);
    }
}

//! `N` worker threads, each owning a FIFO of outbound writes. Grounded on `vsoa_parallel_t`:
//! callers assign a destination socket to a worker by stable hash so per-client ordering is
//! preserved, while different clients' writes proceed on independent workers in parallel.

use slog::Logger;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use vsoa_pool::PacketBuf;

pub type SockId = u64;

/// Minimal write surface a parallel sender needs from a destination socket.
pub trait Socket: Send {
    fn write_frame(&mut self, buf: &[u8], timeout: Duration) -> io::Result<()>;
}

struct Job {
    sock: SockId,
    buf: PacketBuf,
}

struct WorkerQueue {
    jobs: Mutex<VecDeque<Job>>,
    cond: Condvar,
    shutdown: Mutex<bool>,
}

struct Worker {
    queue: Arc<WorkerQueue>,
    handle: Option<JoinHandle<()>>,
}

type Registry = Arc<Mutex<std::collections::HashMap<SockId, Arc<Mutex<Box<dyn Socket>>>>>>;
type FailureLog = Arc<Mutex<Vec<SockId>>>;

/// A parallel sender with a fixed number of worker threads.
pub struct Sender {
    workers: Vec<Worker>,
    registry: Registry,
    failures: FailureLog,
    send_timeout: Duration,
}

impl Sender {
    pub fn new(worker_count: usize, send_timeout: Duration, log: Logger) -> Sender {
        let registry: Registry = Arc::new(Mutex::new(std::collections::HashMap::new()));
        let failures: FailureLog = Arc::new(Mutex::new(Vec::new()));

        let workers = (0..worker_count.max(1))
            .map(|idx| {
                let queue = Arc::new(WorkerQueue {
                    jobs: Mutex::new(VecDeque::new()),
                    cond: Condvar::new(),
                    shutdown: Mutex::new(false),
                });
                let worker_queue = queue.clone();
                let worker_registry = registry.clone();
                let worker_failures = failures.clone();
                let worker_log = log.new(slog::o!("component" => "sender", "worker" => idx));

                let handle = thread::Builder::new()
                    .name(format!("vsoa-sender-{}", idx))
                    .spawn(move || worker_loop(worker_queue, worker_registry, worker_failures, send_timeout, worker_log))
                    .expect("failed to spawn sender worker thread");

                Worker { queue, handle: Some(handle) }
            })
            .collect();

        Sender { workers, registry, failures, send_timeout }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stable hash of `sock` into a worker index; callers use this so a client's writes always
    /// land on the same worker and therefore stay strictly ordered.
    pub fn worker_for(&self, sock: SockId) -> usize {
        (sock as usize) % self.workers.len().max(1)
    }

    pub fn register(&self, sock: SockId, socket: Box<dyn Socket>) {
        self.registry.lock().expect("registry lock poisoned").insert(sock, Arc::new(Mutex::new(socket)));
    }

    pub fn deregister(&self, sock: SockId) {
        self.registry.lock().expect("registry lock poisoned").remove(&sock);
    }

    /// Enqueues `buf` for delivery to `sock` on worker `idx` (see `worker_for`).
    pub fn write(&self, idx: usize, sock: SockId, buf: PacketBuf) {
        let worker = &self.workers[idx];
        worker.queue.jobs.lock().expect("queue lock poisoned").push_back(Job { sock, buf });
        worker.queue.cond.notify_one();
    }

    /// Drops any buffers still queued for `sock` on worker `idx` without sending them (used when
    /// a client disconnects).
    pub fn discard(&self, idx: usize, sock: SockId) {
        let worker = &self.workers[idx];
        let mut jobs = worker.queue.jobs.lock().expect("queue lock poisoned");
        jobs.retain(|job| job.sock != sock);
    }

    /// Total number of frames queued across all workers.
    pub fn count(&self) -> usize {
        self.workers
            .iter()
            .map(|w| w.queue.jobs.lock().expect("queue lock poisoned").len())
            .sum()
    }

    /// Drains sockets that failed to send since the last call; the server core closes these.
    pub fn take_failures(&self) -> Vec<SockId> {
        std::mem::take(&mut *self.failures.lock().expect("failures lock poisoned"))
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        for worker in &self.workers {
            *worker.queue.shutdown.lock().expect("queue lock poisoned") = true;
            worker.queue.cond.notify_all();
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

fn worker_loop(queue: Arc<WorkerQueue>, registry: Registry, failures: FailureLog, send_timeout: Duration, log: Logger) {
    loop {
        let job = {
            let mut jobs = queue.jobs.lock().expect("queue lock poisoned");
            loop {
                if let Some(job) = jobs.pop_front() {
                    break Some(job);
                }
                if *queue.shutdown.lock().expect("shutdown lock poisoned") {
                    return;
                }
                jobs = queue.cond.wait(jobs).expect("queue lock poisoned");
            }
        };

        let Some(job) = job else { return };

        let socket = registry.lock().expect("registry lock poisoned").get(&job.sock).cloned();
        let Some(socket) = socket else {
            continue; // client already gone; silently drop.
        };

        let mut socket = socket.lock().expect("socket lock poisoned");
        if let Err(err) = socket.write_frame(job.buf.payload(), send_timeout) {
            slog::debug!(log, "send failed, marking client failed"; "sock" => job.sock, "error" => %err);
            failures.lock().expect("failures lock poisoned").push(job.sock);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use vsoa_pool::Pool;

    struct ChannelSocket(mpsc::Sender<Vec<u8>>);

    impl Socket for ChannelSocket {
        fn write_frame(&mut self, buf: &[u8], _timeout: Duration) -> io::Result<()> {
            self.0.send(buf.to_vec()).map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }
    }

    #[test]
    fn preserves_per_socket_order() {
        let log = vsoa_support::logging::default_logger();
        let sender = Sender::new(2, Duration::from_millis(100), log.clone());
        let pool = Pool::new(4, log);

        let (tx, rx) = mpsc::channel();
        sender.register(1, Box::new(ChannelSocket(tx)));

        let idx = sender.worker_for(1);
        for i in 0..5u8 {
            let mut buf = pool.alloc(1).unwrap();
            buf.payload_mut().unwrap()[0] = i;
            sender.write(idx, 1, buf);
        }

        for i in 0..5u8 {
            let got = rx.recv_timeout(Duration::from_secs(1)).unwrap();
            assert_eq!(got[0], i);
        }
    }

    #[test]
    fn discard_drops_pending_writes_for_socket() {
        let log = vsoa_support::logging::default_logger();
        let sender = Sender::new(1, Duration::from_millis(100), log.clone());
        let pool = Pool::new(4, log);

        let (tx, rx) = mpsc::channel();
        sender.register(1, Box::new(ChannelSocket(tx)));

        // Block the worker so we can race the discard against an enqueued job.
        let (block_tx, block_rx) = mpsc::channel::<()>();
        sender.register(2, Box::new(BlockingSocket(block_rx)));
        sender.write(0, 2, pool.alloc(1).unwrap());
        thread::sleep(Duration::from_millis(50));
        sender.write(0, 1, pool.alloc(1).unwrap());
        sender.discard(0, 1);
        block_tx.send(()).unwrap();

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    struct BlockingSocket(mpsc::Receiver<()>);
    impl Socket for BlockingSocket {
        fn write_frame(&mut self, _buf: &[u8], _timeout: Duration) -> io::Result<()> {
            let _ = self.0.recv();
            Ok(())
        }
    }
}

//! Simulated server: one bounded admission queue drained by one sequential
//! worker, with best-effort pre-emption of still-queued requests.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::messages::{CancelCause, Request, Response};
use crate::simulation::LatencyVarier;
use crate::utils::{CancelCtx, TailsimError};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

mod worker;

use worker::{PendingSlot, WorkItem, Worker};

/// Function extracting the ID a server keys a request by.
pub type RequestIdFn = fn(&Request) -> String;

/// Map from request ID -> reply slot, holding exactly the requests that are
/// queued but not yet dequeued by the worker.
pub(crate) type PendingIndex = Arc<Mutex<HashMap<String, PendingSlot>>>;

/// Locks a pending index. Critical sections only do O(1) map operations and
/// non-blocking sends, so a poisoned lock still guards a consistent map.
#[inline]
pub(crate) fn lock_pending(
    pending: &PendingIndex,
) -> MutexGuard<'_, HashMap<String, PendingSlot>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// Configuration parameters struct of a simulated server.
#[derive(Clone)]
pub struct ServerConfig {
    /// Server identity.
    pub id: String,

    /// Typical processing latency in microsecs.
    pub base_latency_us: u64,

    /// Tail (p99) processing latency in microsecs.
    pub p99_latency_us: u64,

    /// Probability in [0, 1] that a processed request fails.
    pub failure_rate: f64,

    /// Admission queue capacity.
    pub queue_size: usize,

    /// Seed of the failure-draw random source.
    pub rng_seed: u64,

    /// Request ID extraction function; not settable from TOML.
    pub request_id_fn: RequestIdFn,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            id: "s0".into(),
            base_latency_us: 1000,
            p99_latency_us: 10000,
            failure_rate: 0.0,
            queue_size: 1024,
            rng_seed: 0,
            request_id_fn: Request::id_of,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("id", &self.id)
            .field("base_latency_us", &self.base_latency_us)
            .field("p99_latency_us", &self.p99_latency_us)
            .field("failure_rate", &self.failure_rate)
            .field("queue_size", &self.queue_size)
            .field("rng_seed", &self.rng_seed)
            .finish_non_exhaustive()
    }
}

impl ServerConfig {
    /// Composes a config from defaults overwritten by an optional TOML
    /// string.
    pub fn from_config_str(
        config_str: Option<&str>,
    ) -> Result<Self, TailsimError> {
        parsed_config!(config_str => ServerConfig;
                       id, base_latency_us, p99_latency_us,
                       failure_rate, queue_size, rng_seed)
    }

    pub fn base_latency(&self) -> Duration {
        Duration::from_micros(self.base_latency_us)
    }

    pub fn p99_latency(&self) -> Duration {
        Duration::from_micros(self.p99_latency_us)
    }
}

/// Removes a caller's own pending entry when dropped while still armed, so
/// a `handle` future dropped before admission completes leaves nothing
/// behind in the pending index.
struct PendingGuard<'a> {
    server: &'a SimServer,
    req_id: String,
    ticket: u64,
    armed: bool,
}

impl PendingGuard<'_> {
    /// Hands the entry over to the worker.
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.server.forget(&self.req_id, self.ticket);
        }
    }
}

/// A simulated backend server.
///
/// Requests are admitted into a bounded FIFO queue and processed strictly
/// one at a time by a dedicated worker task. Each admitted request gets
/// exactly one reply, produced either by the worker, by a winning
/// `cancel()`, or by the shutdown drain; a caller whose context fires first
/// stops waiting and observes a cancellation instead.
#[derive(Debug)]
pub struct SimServer {
    /// My server ID.
    id: String,

    /// Config the server was created with.
    config: ServerConfig,

    /// Sender side of the admission queue.
    tx_queue: mpsc::Sender<WorkItem>,

    /// Queued-but-not-dequeued requests, shared with the worker.
    pending: PendingIndex,

    /// Admission ticket counter, distinguishing reuses of the same ID.
    next_ticket: AtomicU64,

    /// Worker slot of a zero-capacity server. Admission must hold its only
    /// permit, which the worker releases when done with the item, so no
    /// request ever waits inside the queue.
    handoff: Option<Arc<Semaphore>>,

    /// Worker stop signal.
    shutdown: Arc<Notify>,

    /// Join handle of the worker thread.
    worker_handle: JoinHandle<()>,
}

impl SimServer {
    /// Creates a new server and spawns its worker thread. Must be called
    /// within the context of a tokio runtime.
    pub fn new_and_setup(
        config: ServerConfig,
        varier: Box<dyn LatencyVarier>,
    ) -> Result<Self, TailsimError> {
        if config.id.is_empty() {
            return logged_err!("-"; "server id must not be empty");
        }
        if !(0.0..=1.0).contains(&config.failure_rate) {
            return logged_err!(
                config.id;
                "invalid failure_rate {}",
                config.failure_rate
            );
        }
        if Handle::try_current().is_err() {
            return logged_err!(config.id; "setup called outside tokio runtime");
        }

        // tokio channels need at least one slot; a zero-sized queue admits
        // only while the worker is idle
        let queue_cap = config.queue_size.max(1);
        let (tx_queue, rx_queue) = mpsc::channel(queue_cap);
        let handoff = if config.queue_size == 0 {
            Some(Arc::new(Semaphore::new(1)))
        } else {
            None
        };
        let pending: PendingIndex = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(Notify::new());

        let worker = Worker::new(&config, varier, pending.clone());
        let worker_handle =
            tokio::spawn(worker.run(rx_queue, shutdown.clone()));

        Ok(SimServer {
            id: config.id.clone(),
            config,
            tx_queue,
            pending,
            next_ticket: AtomicU64::new(0),
            handoff,
            shutdown,
            worker_handle,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Admits the request and waits for its reply, racing both steps
    /// against the caller's context.
    pub async fn handle(&self, ctx: &CancelCtx, req: Request) -> Response {
        let req_id = (self.config.request_id_fn)(&req);
        if let Some(e) = ctx.err() {
            return Response::cancelled(req_id, &self.id, e.into());
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx_reply, rx_reply) = oneshot::channel();
        let displaced = lock_pending(&self.pending)
            .insert(req_id.clone(), PendingSlot { ticket, tx_reply });
        let guard = PendingGuard {
            server: self,
            req_id: req_id.clone(),
            ticket,
            armed: true,
        };
        if let Some(slot) = displaced {
            // same ID re-issued while the previous one is still queued; the
            // older caller is answered as pre-empted and its queue item
            // becomes an orphan the worker skips
            pf_warn!(self.id; "request '{}' re-admitted while queued", req_id);
            let _ = slot.tx_reply.send(Response::cancelled(
                req_id.clone(),
                &self.id,
                CancelCause::Preempted,
            ));
        }

        // admission
        let enqueued = Instant::now();
        let admitted = tokio::select! {
            res = self.admit(&req_id, ticket, ctx, enqueued) => res,
            e = ctx.done() => Err(e.into()),
        };
        if let Err(cause) = admitted {
            drop(guard);
            pf_debug!(self.id; "request '{}' not admitted: {:?}",
                               req_id, cause);
            return Response::cancelled(req_id, &self.id, cause);
        }
        guard.disarm();

        // reply
        tokio::select! {
            reply = rx_reply => match reply {
                Ok(resp) => resp,
                Err(_) => {
                    // reply slot dropped unanswered: worker is gone
                    Response::cancelled(req_id, &self.id, CancelCause::Shutdown)
                }
            },

            e = ctx.done() => {
                // the worker may still process this request internally
                pf_trace!(self.id; "request '{}' abandoned by caller", req_id);
                Response::cancelled(req_id, &self.id, e.into())
            }
        }
    }

    /// Puts the work item into the admission queue, first waiting for the
    /// worker slot if the server has zero capacity.
    async fn admit(
        &self,
        req_id: &str,
        ticket: u64,
        ctx: &CancelCtx,
        enqueued: Instant,
    ) -> Result<(), CancelCause> {
        let handoff = match &self.handoff {
            Some(slot) => Some(
                slot.clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| CancelCause::Shutdown)?,
            ),
            None => None,
        };
        let item = WorkItem {
            req_id: req_id.into(),
            ticket,
            ctx: ctx.clone(),
            enqueued,
            handoff,
        };
        self.tx_queue
            .send(item)
            .await
            .map_err(|_| CancelCause::Shutdown)
    }

    /// Removes my own pending entry after a failed admission, leaving any
    /// newer entry under the same ID alone.
    fn forget(&self, req_id: &str, ticket: u64) {
        let mut pending = lock_pending(&self.pending);
        if pending.get(req_id).is_some_and(|slot| slot.ticket == ticket) {
            pending.remove(req_id);
        }
    }

    /// Pre-empts a request that is still sitting in the admission queue,
    /// delivering a cancellation reply to its caller. Returns false if the
    /// request was never admitted, has already been picked up by the worker,
    /// or its caller has already stopped waiting.
    pub fn cancel(&self, request_id: &str) -> bool {
        let mut pending = lock_pending(&self.pending);
        let Some(slot) = pending.remove(request_id) else {
            return false;
        };
        let delivered = slot
            .tx_reply
            .send(Response::cancelled(
                request_id,
                &self.id,
                CancelCause::Preempted,
            ))
            .is_ok();
        pf_debug!(self.id; "cancel '{}' delivered {}", request_id, delivered);
        delivered
    }

    /// Number of admitted requests not yet dequeued by the worker. Advisory
    /// only, as it may change right after returning. Always zero for a
    /// zero-capacity server, whose admissions are handed straight to an
    /// idle worker.
    pub fn queue_depth(&self) -> usize {
        if self.handoff.is_some() {
            return 0;
        }
        self.tx_queue.max_capacity() - self.tx_queue.capacity()
    }

    /// Signals the worker to stop after its current item. Still-queued
    /// requests get cancellation replies and later admissions are refused.
    pub fn shutdown(&self) {
        pf_info!(self.id; "shutting down");
        self.shutdown.notify_one();
    }

    /// Returns true while the worker thread is alive.
    pub fn is_running(&self) -> bool {
        !self.worker_handle.is_finished()
    }
}

#[cfg(test)]
mod server_tests {
    use super::*;
    use crate::messages::ResponseError;
    use crate::simulation::RandomLatencyVarier;
    use std::sync::atomic::AtomicUsize;
    use tokio::time;

    /// Varier returning a fixed duration, for timing-sensitive tests.
    struct FixedVarier(Duration);

    impl LatencyVarier for FixedVarier {
        fn add_variability(&mut self, _: Duration, _: Duration) -> Duration {
            self.0
        }
    }

    /// Fixed-duration varier counting the requests that reached processing.
    struct CountingVarier(Duration, Arc<AtomicUsize>);

    impl LatencyVarier for CountingVarier {
        fn add_variability(&mut self, _: Duration, _: Duration) -> Duration {
            self.1.fetch_add(1, Ordering::SeqCst);
            self.0
        }
    }

    fn counting_server(
        latency: Duration,
        queue_size: usize,
    ) -> Result<(Arc<SimServer>, Arc<AtomicUsize>), TailsimError> {
        let processed = Arc::new(AtomicUsize::new(0));
        let server = SimServer::new_and_setup(
            ServerConfig {
                queue_size,
                ..Default::default()
            },
            Box::new(CountingVarier(latency, processed.clone())),
        )?;
        Ok((Arc::new(server), processed))
    }

    fn spawn_handle(
        server: &Arc<SimServer>,
        id: &str,
    ) -> JoinHandle<Response> {
        let (server, id) = (server.clone(), id.to_string());
        tokio::spawn(async move {
            server.handle(&CancelCtx::background(), Request::new(id, "x")).await
        })
    }

    /// Keeps the worker busy with "busy" and fills a one-slot queue with
    /// "filler".
    async fn occupy_worker_and_queue(
        server: &Arc<SimServer>,
    ) -> (JoinHandle<Response>, JoinHandle<Response>) {
        let busy = spawn_handle(server, "busy");
        time::sleep(Duration::from_millis(10)).await;
        let filler = spawn_handle(server, "filler");
        wait_for_depth(server, 1).await;
        (busy, filler)
    }

    fn fixed_server(
        id: &str,
        latency: Duration,
        queue_size: usize,
    ) -> Result<SimServer, TailsimError> {
        SimServer::new_and_setup(
            ServerConfig {
                id: id.into(),
                queue_size,
                ..Default::default()
            },
            Box::new(FixedVarier(latency)),
        )
    }

    async fn wait_for_depth(server: &SimServer, depth: usize) {
        while server.queue_depth() != depth {
            time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[test]
    fn config_from_str() -> Result<(), TailsimError> {
        let config = ServerConfig::from_config_str(Some(
            "id = 'slow'\np99_latency_us = 50000\nfailure_rate = 0.3",
        ))?;
        assert_eq!(config.id, "slow");
        assert_eq!(config.base_latency(), Duration::from_millis(1));
        assert_eq!(config.p99_latency(), Duration::from_millis(50));
        assert_eq!(config.failure_rate, 0.3);
        assert!(ServerConfig::from_config_str(Some("latency = 3")).is_err());
        Ok(())
    }

    #[test]
    fn setup_outside_runtime() {
        assert!(fixed_server("s0", Duration::ZERO, 4).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn setup_invalid_config() {
        let varier = || Box::new(FixedVarier(Duration::ZERO));
        assert!(SimServer::new_and_setup(
            ServerConfig {
                id: "".into(),
                ..Default::default()
            },
            varier()
        )
        .is_err());
        assert!(SimServer::new_and_setup(
            ServerConfig {
                failure_rate: 1.5,
                ..Default::default()
            },
            varier()
        )
        .is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handle_success() -> Result<(), TailsimError> {
        let server = fixed_server("s0", Duration::from_millis(5), 4)?;
        let resp = server
            .handle(&CancelCtx::background(), Request::new("r0", "x"))
            .await;
        assert!(resp.success);
        assert_eq!(resp.err, None);
        assert_eq!(resp.request_id, "r0");
        assert_eq!(resp.server_id, "s0");
        assert_eq!(resp.processing_time, Duration::from_millis(5));
        assert_eq!(resp.latency, resp.queue_wait + resp.processing_time);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handle_always_fails() -> Result<(), TailsimError> {
        let server = SimServer::new_and_setup(
            ServerConfig {
                failure_rate: 1.0,
                ..Default::default()
            },
            Box::new(FixedVarier(Duration::ZERO)),
        )?;
        let resp = server
            .handle(&CancelCtx::background(), Request::new("r0", "x"))
            .await;
        assert!(!resp.success);
        assert_eq!(resp.err, None); // semantic failure, not an error
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handle_precancelled_zero_queue() -> Result<(), TailsimError> {
        let (server, processed) =
            counting_server(Duration::from_millis(5), 0)?;
        let ctx = CancelCtx::background();
        ctx.cancel();
        let resp = server.handle(&ctx, Request::new("r0", "x")).await;
        assert_eq!(
            resp.err,
            Some(ResponseError::Cancelled(CancelCause::Context))
        );
        assert!(resp.latency.is_zero());
        assert!(resp.queue_wait.is_zero());
        assert!(resp.processing_time.is_zero());
        assert_eq!(server.queue_depth(), 0);
        assert!(lock_pending(&server.pending).is_empty());

        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(processed.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deadline_while_admission_blocked() -> Result<(), TailsimError> {
        let (server, processed) =
            counting_server(Duration::from_millis(100), 1)?;
        let (busy, filler) = occupy_worker_and_queue(&server).await;

        let ctx =
            CancelCtx::background().with_timeout(Duration::from_millis(20));
        let resp = server.handle(&ctx, Request::new("late", "x")).await;
        assert_eq!(
            resp.err,
            Some(ResponseError::Cancelled(CancelCause::Deadline))
        );
        assert!(resp.latency.is_zero());
        assert!(resp.queue_wait.is_zero());
        assert!(resp.processing_time.is_zero());
        assert!(!lock_pending(&server.pending).contains_key("late"));

        assert!(busy.await?.success);
        assert!(filler.await?.success);
        // only "busy" and "filler" ever got processed
        assert_eq!(processed.load(Ordering::SeqCst), 2);
        assert!(lock_pending(&server.pending).is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_while_admission_blocked() -> Result<(), TailsimError> {
        let (server, processed) =
            counting_server(Duration::from_millis(50), 1)?;
        let (busy, filler) = occupy_worker_and_queue(&server).await;

        let dropped = time::timeout(
            Duration::from_millis(5),
            server.handle(&CancelCtx::background(), Request::new("gone", "x")),
        )
        .await;
        assert!(dropped.is_err());
        assert!(!lock_pending(&server.pending).contains_key("gone"));

        assert!(busy.await?.success);
        assert!(filler.await?.success);
        wait_for_depth(&server, 0).await;
        assert!(lock_pending(&server.pending).is_empty());
        assert_eq!(processed.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn zero_queue_admits_only_when_idle() -> Result<(), TailsimError> {
        let (server, processed) =
            counting_server(Duration::from_millis(50), 0)?;
        let first = spawn_handle(&server, "r0");
        time::sleep(Duration::from_millis(10)).await;
        let second = spawn_handle(&server, "r1");
        time::sleep(Duration::from_millis(10)).await;

        // "r1" waits for the worker outside the queue
        assert_eq!(server.queue_depth(), 0);
        assert_eq!(server.tx_queue.capacity(), 1);

        // giving up while waiting leaves nothing behind
        let dropped = time::timeout(
            Duration::from_millis(5),
            server.handle(&CancelCtx::background(), Request::new("gone", "x")),
        )
        .await;
        assert!(dropped.is_err());
        assert!(!lock_pending(&server.pending).contains_key("gone"));

        let (r0, r1) = (first.await?, second.await?);
        assert!(r0.success && r1.success);
        assert!(r1.queue_wait >= Duration::from_millis(30));
        assert_eq!(processed.load(Ordering::SeqCst), 2);
        assert!(lock_pending(&server.pending).is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handle_deadline_while_processing() -> Result<(), TailsimError> {
        let server = fixed_server("s0", Duration::from_secs(10), 4)?;
        let ctx =
            CancelCtx::background().with_timeout(Duration::from_millis(20));
        let start = Instant::now();
        let resp = server.handle(&ctx, Request::new("r0", "x")).await;
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(
            resp.err,
            Some(ResponseError::Cancelled(CancelCause::Deadline))
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fifo_sequential_processing() -> Result<(), TailsimError> {
        let server = fixed_server("s0", Duration::from_millis(20), 8)?;
        let ctx = CancelCtx::background();
        // `join!` polls in order, so admission order is r0, r1, r2
        let (r0, r1, r2) = tokio::join!(
            server.handle(&ctx, Request::new("r0", "x")),
            server.handle(&ctx, Request::new("r1", "x")),
            server.handle(&ctx, Request::new("r2", "x")),
        );
        assert!(r0.success && r1.success && r2.success);
        // later requests waited behind earlier ones
        assert!(r1.queue_wait >= Duration::from_millis(15));
        assert!(r2.queue_wait >= Duration::from_millis(35));
        assert!(r2.latency >= Duration::from_millis(50));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_queued_request() -> Result<(), TailsimError> {
        let server =
            Arc::new(fixed_server("s0", Duration::from_millis(200), 4)?);
        let blocker = {
            let server = server.clone();
            tokio::spawn(async move {
                server
                    .handle(&CancelCtx::background(), Request::new("busy", "x"))
                    .await
            })
        };
        // worker picks up "busy", leaving the queue empty
        wait_for_depth(&server, 0).await;
        time::sleep(Duration::from_millis(10)).await;

        let queued = {
            let server = server.clone();
            tokio::spawn(async move {
                let req = Request::new("victim", "x");
                server.handle(&CancelCtx::background(), req).await
            })
        };
        wait_for_depth(&server, 1).await;

        assert!(server.cancel("victim"));
        let resp = queued.await?;
        assert_eq!(
            resp.err,
            Some(ResponseError::Cancelled(CancelCause::Preempted))
        );
        assert!(!server.cancel("victim")); // already consumed
        assert!(!server.cancel("never-seen"));

        // in-flight request cannot be pre-empted
        assert!(!server.cancel("busy"));
        assert!(blocker.await?.success);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_loses_to_worker() -> Result<(), TailsimError> {
        let server = fixed_server("s0", Duration::from_millis(30), 4)?;
        let ctx = CancelCtx::background();
        let (resp, cancelled) = tokio::join!(
            server.handle(&ctx, Request::new("r0", "x")),
            async {
                // worker dequeues immediately since the queue is idle
                time::sleep(Duration::from_millis(10)).await;
                server.cancel("r0")
            }
        );
        assert!(!cancelled);
        assert!(resp.success);
        assert!(lock_pending(&server.pending).is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn exactly_one_reply_under_races() -> Result<(), TailsimError> {
        let server =
            Arc::new(fixed_server("s0", Duration::from_millis(1), 64)?);
        let mut handles = vec![];
        for i in 0..200 {
            let server = server.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("r{}", i);
                let ctx = CancelCtx::background();
                let canceller = {
                    let (server, id, ctx) =
                        (server.clone(), id.clone(), ctx.clone());
                    tokio::spawn(async move {
                        time::sleep(Duration::from_micros((i % 7) * 300)).await;
                        match i % 3 {
                            0 => {
                                server.cancel(&id);
                            }
                            1 => ctx.cancel(),
                            _ => {}
                        }
                    })
                };
                let req = Request::new(id.clone(), "x");
                let resp = server.handle(&ctx, req).await;
                let _ = canceller.await;
                (id, resp)
            }));
        }
        for handle in handles {
            let (id, resp) = handle.await?;
            assert_eq!(resp.request_id, id);
            // either processed or cancelled, never both
            assert!(resp.success != resp.err.is_some());
        }
        wait_for_depth(&server, 0).await;
        time::sleep(Duration::from_millis(10)).await;
        assert!(lock_pending(&server.pending).is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reissued_id_preempts_older() -> Result<(), TailsimError> {
        let server =
            Arc::new(fixed_server("s0", Duration::from_millis(50), 4)?);
        let blocker = {
            let server = server.clone();
            tokio::spawn(async move {
                server
                    .handle(&CancelCtx::background(), Request::new("busy", "x"))
                    .await
            })
        };
        wait_for_depth(&server, 0).await;
        time::sleep(Duration::from_millis(5)).await;

        let first = {
            let server = server.clone();
            tokio::spawn(async move {
                server
                    .handle(&CancelCtx::background(), Request::new("dup", "x"))
                    .await
            })
        };
        wait_for_depth(&server, 1).await;
        let second = server
            .handle(&CancelCtx::background(), Request::new("dup", "x"))
            .await;

        assert_eq!(
            first.await?.err,
            Some(ResponseError::Cancelled(CancelCause::Preempted))
        );
        assert!(second.success);
        assert!(blocker.await?.success);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_releases_waiters() -> Result<(), TailsimError> {
        let server =
            Arc::new(fixed_server("s0", Duration::from_millis(100), 4)?);
        let mut handles = vec![];
        for i in 0..3 {
            let server = server.clone();
            handles.push(tokio::spawn(async move {
                let req = Request::new(format!("r{}", i), "x");
                server.handle(&CancelCtx::background(), req).await
            }));
            if i == 0 {
                // let the worker pick up r0 first
                time::sleep(Duration::from_millis(20)).await;
            }
        }
        wait_for_depth(&server, 2).await;
        server.shutdown();
        server.shutdown();

        let resps: Vec<Response> = {
            let mut resps = vec![];
            for handle in handles {
                resps.push(handle.await?);
            }
            resps
        };
        assert_eq!(resps.iter().filter(|r| r.success).count(), 1);
        assert_eq!(
            resps
                .iter()
                .filter(|r| r.err
                    == Some(ResponseError::Cancelled(CancelCause::Shutdown)))
                .count(),
            2
        );

        while server.is_running() {
            time::sleep(Duration::from_millis(1)).await;
        }
        let late = server
            .handle(&CancelCtx::background(), Request::new("late", "x"))
            .await;
        assert_eq!(
            late.err,
            Some(ResponseError::Cancelled(CancelCause::Shutdown))
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failure_rate_converges() -> Result<(), TailsimError> {
        let server = SimServer::new_and_setup(
            ServerConfig {
                failure_rate: 0.3,
                rng_seed: 2024,
                ..Default::default()
            },
            Box::new(FixedVarier(Duration::ZERO)),
        )?;
        let ctx = CancelCtx::background();
        let total = 5000;
        let mut failures = 0;
        for i in 0..total {
            let req = Request::new(format!("r{}", i), "");
            let resp = server.handle(&ctx, req).await;
            assert_eq!(resp.err, None);
            if !resp.success {
                failures += 1;
            }
        }
        let frac = failures as f64 / total as f64;
        assert!((frac - 0.3).abs() < 0.03, "failure fraction {}", frac);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn seeded_outcomes_replay() -> Result<(), TailsimError> {
        let run = || async {
            let server = SimServer::new_and_setup(
                ServerConfig {
                    base_latency_us: 100,
                    p99_latency_us: 500,
                    failure_rate: 0.5,
                    rng_seed: 99,
                    ..Default::default()
                },
                Box::new(RandomLatencyVarier::new(
                    7,
                    Duration::from_micros(50),
                )),
            )?;
            let ctx = CancelCtx::background();
            let mut outcomes = vec![];
            for i in 0..50 {
                let req = Request::new(format!("r{}", i), "");
                let resp = server.handle(&ctx, req).await;
                outcomes.push((resp.success, resp.processing_time));
            }
            Ok::<_, TailsimError>(outcomes)
        };
        assert_eq!(run().await?, run().await?);
        Ok(())
    }
}

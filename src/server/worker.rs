//! Sequential worker draining one server's admission queue.

use std::sync::Arc;

use crate::messages::{CancelCause, Response};
use crate::server::{lock_pending, PendingIndex, ServerConfig};
use crate::simulation::LatencyVarier;
use crate::utils::{CancelCtx, Timer};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tokio::sync::{mpsc, oneshot, Notify, OwnedSemaphorePermit};
use tokio::time::{Duration, Instant};

/// Admitted request travelling through the admission queue.
#[derive(Debug)]
pub(crate) struct WorkItem {
    /// Request ID as extracted by the server.
    pub(crate) req_id: String,

    /// Admission ticket, matched against the pending index entry.
    pub(crate) ticket: u64,

    /// Caller's context.
    pub(crate) ctx: CancelCtx,

    /// Admission timestamp.
    pub(crate) enqueued: Instant,

    /// Worker slot permit of a zero-capacity server, released when the item
    /// is dropped after processing.
    pub(crate) handoff: Option<OwnedSemaphorePermit>,
}

/// Pending index entry: the single-slot reply channel of a queued request.
/// Whoever removes the entry owns the right to reply.
#[derive(Debug)]
pub(crate) struct PendingSlot {
    pub(crate) ticket: u64,
    pub(crate) tx_reply: oneshot::Sender<Response>,
}

/// The worker thread state. Owns the random sources, so outcomes replay
/// deterministically given the same seeds and the same request sequence.
pub(crate) struct Worker {
    /// My server ID.
    me: String,

    base_latency: Duration,
    p99_latency: Duration,
    failure_rate: f64,

    /// Failure-draw random source.
    rng: StdRng,

    /// Processing time model.
    varier: Box<dyn LatencyVarier>,

    /// Timer for waiting out the simulated processing time.
    timer: Timer,

    /// Pending index shared with the server handle.
    pending: PendingIndex,
}

impl Worker {
    pub(crate) fn new(
        config: &ServerConfig,
        varier: Box<dyn LatencyVarier>,
        pending: PendingIndex,
    ) -> Self {
        Worker {
            me: config.id.clone(),
            base_latency: config.base_latency(),
            p99_latency: config.p99_latency(),
            failure_rate: config.failure_rate,
            rng: StdRng::seed_from_u64(config.rng_seed),
            varier,
            timer: Timer::new(),
            pending,
        }
    }

    /// Worker thread function.
    pub(crate) async fn run(
        mut self,
        mut rx_queue: mpsc::Receiver<WorkItem>,
        shutdown: Arc<Notify>,
    ) {
        pf_debug!(self.me; "worker thread spawned");

        loop {
            tokio::select! {
                biased;

                () = shutdown.notified() => break,

                item = rx_queue.recv() => match item {
                    Some(item) => self.process_item(item).await,
                    None => break, // server handle dropped
                },
            }
        }

        // refuse further admissions and release everyone still queued
        rx_queue.close();
        let mut drained = 0;
        while let Ok(item) = rx_queue.try_recv() {
            if let Some(tx_reply) = self.claim(&item) {
                let _ = tx_reply.send(Response::cancelled(
                    item.req_id,
                    &self.me,
                    CancelCause::Shutdown,
                ));
                drained += 1;
            }
        }

        pf_debug!(self.me; "worker thread exitted, {} queued dropped", drained);
    }

    /// Takes the item's entry out of the pending index. Returns `None` if a
    /// concurrent `cancel()` already consumed it, in which case that call has
    /// replied and nothing more should be done for this item.
    fn claim(&self, item: &WorkItem) -> Option<oneshot::Sender<Response>> {
        let mut pending = lock_pending(&self.pending);
        let mine = pending
            .get(&item.req_id)
            .is_some_and(|slot| slot.ticket == item.ticket);
        if mine {
            pending.remove(&item.req_id).map(|slot| slot.tx_reply)
        } else {
            None
        }
    }

    /// Delivers a reply. The caller may have stopped waiting already, which
    /// is not an error.
    fn reply(&self, tx_reply: oneshot::Sender<Response>, resp: Response) {
        pf_trace!(self.me; "reply {} success {} latency {:?}",
                           resp.request_id, resp.success, resp.latency);
        if tx_reply.send(resp).is_err() {
            pf_trace!(self.me; "caller gone before reply");
        }
    }

    /// Processes one dequeued item.
    async fn process_item(&mut self, item: WorkItem) {
        let Some(tx_reply) = self.claim(&item) else {
            pf_trace!(self.me; "skip {}: pre-empted", item.req_id);
            return;
        };

        if let Some(e) = item.ctx.err() {
            let resp = Response::cancelled(item.req_id, &self.me, e.into());
            self.reply(tx_reply, resp);
            return;
        }

        let queue_wait = item.enqueued.elapsed();
        let processing_time = self
            .varier
            .add_variability(self.base_latency, self.p99_latency);

        self.timer.kickoff(processing_time);
        tokio::select! {
            () = self.timer.timeout() => {}

            e = item.ctx.done() => {
                let resp = Response::cancelled(item.req_id, &self.me, e.into());
                self.reply(tx_reply, resp);
                return;
            }
        }

        let success = self.rng.gen::<f64>() >= self.failure_rate;
        let resp = Response::completed(
            item.req_id,
            &self.me,
            success,
            queue_wait,
            processing_time,
        );
        self.reply(tx_reply, resp);
    }
}

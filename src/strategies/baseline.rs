//! Baseline fan-out strategy: send to every server, wait for all, reduce.

use crate::cluster::Cluster;
use crate::messages::{Request, Response, ResponseError};
use crate::strategies::DispatchStrategy;
use crate::utils::{hash_strings, CancelCtx};

use async_trait::async_trait;

use futures::future::join_all;

use tokio::time::Duration;

/// Tag prefixed to the server IDs when fingerprinting an aggregate.
const AGGREGATE_TAG: &str = "aggregated_servers";

/// Accumulator reducing a fan-out's responses into one.
///
/// Success is a logical-or, timings are maxima, and the identity is a
/// fingerprint over the sorted participant IDs, so all of these are
/// independent of the order responses are absorbed in. The surfaced error
/// is the first one absorbed, and only if nobody succeeded.
#[derive(Debug, Default)]
pub struct FanOutAggregate {
    server_ids: Vec<String>,
    any_success: bool,
    first_err: Option<ResponseError>,
    max_latency: Duration,
    max_queue_wait: Duration,
    max_processing_time: Duration,
}

impl FanOutAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one participant's response in.
    pub fn absorb(&mut self, resp: &Response) {
        self.server_ids.push(resp.server_id.clone());
        self.any_success |= resp.success;
        if self.first_err.is_none() {
            self.first_err = resp.err;
        }
        self.max_latency = self.max_latency.max(resp.latency);
        self.max_queue_wait = self.max_queue_wait.max(resp.queue_wait);
        self.max_processing_time =
            self.max_processing_time.max(resp.processing_time);
    }

    /// Produces the aggregate response for `request_id`.
    pub fn finish(mut self, request_id: impl Into<String>) -> Response {
        self.server_ids.sort_unstable();
        let mut strs = Vec::with_capacity(self.server_ids.len() + 1);
        strs.push(AGGREGATE_TAG);
        strs.extend(self.server_ids.iter().map(String::as_str));

        Response {
            request_id: request_id.into(),
            server_id: hash_strings(&strs),
            success: self.any_success,
            err: if self.any_success {
                None
            } else {
                self.first_err
            },
            latency: self.max_latency,
            queue_wait: self.max_queue_wait,
            processing_time: self.max_processing_time,
        }
    }
}

/// Non-cancelling fan-out: every server processes the request, the caller
/// waits for all of them, and one success is enough.
#[derive(Debug, Default, Clone, Copy)]
pub struct Baseline;

impl Baseline {
    /// Reduces a complete set of fan-out responses.
    pub fn reduce(request_id: &str, responses: &[Response]) -> Response {
        let mut aggregate = FanOutAggregate::new();
        for resp in responses {
            aggregate.absorb(resp);
        }
        aggregate.finish(request_id)
    }
}

#[async_trait]
impl DispatchStrategy for Baseline {
    fn name(&self) -> &'static str {
        "Baseline"
    }

    async fn dispatch(
        &self,
        ctx: &CancelCtx,
        cluster: &Cluster,
        req: Request,
    ) -> Response {
        let responses = join_all(
            cluster
                .iter()
                .map(|server| server.handle(ctx, req.clone())),
        )
        .await;
        pf_trace!("b"; "request {} fanned out to {} servers",
                       req.id(), responses.len());
        Self::reduce(req.id(), &responses)
    }
}

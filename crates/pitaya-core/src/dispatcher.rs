//! Transport-agnostic request dispatcher.
//!
//! `Dispatcher` takes a decoded [`Request`], finds its handler, decodes the
//! argument, runs the handler, encodes the result and reports the outcome.
//! Each request moves through
//!
//! ```text
//! route -> resolve -> decode -> invoke -> encode -> completed
//! ```
//!
//! and may fail at any step. Every failure becomes a structured [`Response`];
//! nothing a handler does can escape the dispatch task.
//!
//! # Usage
//!
//! ```ignore
//! let dispatcher = Dispatcher::new(registry, JsonCodec, rpc_client, delivery);
//!
//! // From the transport's receive loop, without waiting:
//! dispatcher.spawn(handle, request);
//!
//! // Or inline, when the caller wants the response itself:
//! let response = dispatcher.handle(&request).await;
//! ```

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::{JoinError, JoinHandle};
use tracing::Instrument;

use crate::codec::{Codec, JsonCodec};
use crate::delivery::{PendingResponse, RequestHandle, ResponseDelivery};
use crate::error::{DispatchError, HandlerError};
use crate::metrics::{Metrics, CODE_OK, HANDLER_DURATION, REQUESTS};
use crate::protos::{Request, Response, RpcType};
use crate::registry::{HandlerRegistry, ReturnType};
use crate::route::Route;
use crate::session::{RpcClient, Session};

/// The step a request is in; reported when it fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Route,
    Resolve,
    Decode,
    Invoke,
    Encode,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Route => "route",
            Step::Resolve => "resolve",
            Step::Decode => "decode",
            Step::Invoke => "invoke",
            Step::Encode => "encode",
        };
        f.write_str(name)
    }
}

/// Dispatches requests to the handlers of a frozen [`HandlerRegistry`].
///
/// Cloning is cheap; all clones share the same registry, codec and
/// collaborators.
pub struct Dispatcher<C: Codec = JsonCodec> {
    registry: Arc<HandlerRegistry<C>>,
    codec: Arc<C>,
    rpc_client: Arc<dyn RpcClient>,
    delivery: Arc<dyn ResponseDelivery>,
    metrics: Option<Arc<Metrics>>,
}

/// Route label for requests that never resolved to a handler.
const UNRESOLVED_ROUTE: &str = "unknown";

impl<C: Codec> Clone for Dispatcher<C> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            codec: Arc::clone(&self.codec),
            rpc_client: Arc::clone(&self.rpc_client),
            delivery: Arc::clone(&self.delivery),
            metrics: self.metrics.clone(),
        }
    }
}

impl<C: Codec> Dispatcher<C> {
    pub fn new(
        registry: HandlerRegistry<C>,
        codec: C,
        rpc_client: Arc<dyn RpcClient>,
        delivery: Arc<dyn ResponseDelivery>,
    ) -> Self {
        tracing::info!(
            "[Dispatcher] Ready with {} entries, codec {}",
            registry.len(),
            codec.name()
        );
        Self {
            registry: Arc::new(registry),
            codec: Arc::new(codec),
            rpc_client,
            delivery,
            metrics: None,
        }
    }

    /// Record request counts and latencies into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &HandlerRegistry<C> {
        &self.registry
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    /// Dispatch `request` on its own task and deliver the response through
    /// the configured [`ResponseDelivery`]. Returns immediately.
    pub fn spawn(&self, handle: RequestHandle, request: Request) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.dispatch(handle, request).await })
    }

    /// Handle `request` and deliver its response exactly once.
    pub async fn dispatch(&self, handle: RequestHandle, request: Request) {
        let pending = PendingResponse::new(handle, Arc::clone(&self.delivery));
        let response = self.handle(&request).await;
        pending.respond(&response);
    }

    /// Handle `request` and return its response without delivering it.
    pub async fn handle(&self, request: &Request) -> Response {
        let request_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!(
            "dispatch",
            %request_id,
            route = %request.route,
            rpc_type = %request.rpc_type
        );

        async {
            let started = Instant::now();
            let mut step = Step::Route;
            let (response, route) = match self.run(request, &mut step).await {
                Ok(response) => {
                    tracing::debug!("[Dispatcher] {} completed", request.route);
                    (response, route_label(request))
                }
                Err(err) => {
                    report(&err, step);
                    let route = match err {
                        DispatchError::MalformedRoute(_) | DispatchError::HandlerNotFound { .. } => {
                            UNRESOLVED_ROUTE.to_string()
                        }
                        _ => route_label(request),
                    };
                    (err.to_response(), route)
                }
            };
            if let Some(metrics) = &self.metrics {
                record(metrics, &route, request, &response, started.elapsed()).await;
            }
            response
        }
        .instrument(span)
        .await
    }

    async fn run(&self, request: &Request, step: &mut Step) -> Result<Response, DispatchError> {
        let route = Route::parse(&request.route)?;
        let name = route.qualified_name();

        *step = Step::Resolve;
        let descriptor = self.registry.lookup(request.rpc_type, &name)?;
        let session = match request.rpc_type {
            RpcType::Sys => Some(self.session_for(request, &name)?),
            RpcType::User => None,
        };

        // Decoding and the handler's synchronous prefix run here; the
        // returned future runs on its own task. Both contain panics.
        *step = Step::Decode;
        let call = panic::catch_unwind(AssertUnwindSafe(|| {
            descriptor.invoke(self.codec.as_ref(), session, &request.data)
        }))
        .map_err(|payload| panicked(&name, payload))??;

        *step = Step::Invoke;
        let encoder = tokio::spawn(call)
            .await
            .map_err(|e| join_failed(&name, e))?
            .map_err(|source| DispatchError::Invocation {
                handler: name.clone(),
                source,
            })?;

        *step = Step::Encode;
        let data = match descriptor.return_type() {
            ReturnType::Void => Vec::new(),
            ReturnType::Value(_) => {
                encoder(self.codec.as_ref()).map_err(|source| DispatchError::Encode {
                    handler: name.clone(),
                    source,
                })?
            }
        };

        Ok(Response::ok(data))
    }

    fn session_for(&self, request: &Request, handler: &str) -> Result<Session, DispatchError> {
        if request.session.is_empty() {
            return Err(DispatchError::MissingSession {
                handler: handler.to_string(),
            });
        }
        Session::decode(
            &request.session,
            request.frontend_id.clone(),
            Arc::clone(&self.rpc_client),
        )
        .map_err(|source| DispatchError::Session {
            handler: handler.to_string(),
            source,
        })
    }
}

fn route_label(request: &Request) -> String {
    Route::parse(&request.route)
        .map(|route| route.qualified_name())
        .unwrap_or_else(|_| UNRESOLVED_ROUTE.to_string())
}

async fn record(
    metrics: &Metrics,
    route: &str,
    request: &Request,
    response: &Response,
    elapsed: Duration,
) {
    let code = match &response.error {
        Some(error) => error.code.as_str(),
        None => CODE_OK,
    };
    let rpc_type = request.rpc_type.to_string();
    let counted = metrics
        .inc_counter(REQUESTS, &[route, &rpc_type, code])
        .await;
    let timed = metrics
        .observe_hist(HANDLER_DURATION, elapsed.as_secs_f64(), &[route, code])
        .await;
    if let Err(e) = counted.and(timed) {
        tracing::warn!("[Dispatcher] Failed to record metrics: {}", e);
    }
}

fn panicked(handler: &str, payload: Box<dyn Any + Send>) -> DispatchError {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    };
    DispatchError::Invocation {
        handler: handler.to_string(),
        source: HandlerError::new(message).context("handler panicked"),
    }
}

fn join_failed(handler: &str, err: JoinError) -> DispatchError {
    match err.try_into_panic() {
        Ok(payload) => panicked(handler, payload),
        Err(_) => DispatchError::Invocation {
            handler: handler.to_string(),
            source: HandlerError::new("handler task was cancelled"),
        },
    }
}

fn report(err: &DispatchError, step: Step) {
    match err {
        DispatchError::HandlerNotFound { .. } => {
            tracing::debug!("[Dispatcher] {}", err);
        }
        _ => {
            tracing::error!(
                "[Dispatcher] Request failed at {}: {}",
                step,
                err.cause_chain().join(": ")
            );
        }
    }
}

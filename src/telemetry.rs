//! Telemetry and observability for the fleet dispatcher.
//!
//! Every component that crosses a network boundary or changes health state emits a
//! [`FleetEvent`]. Events flow through [`TelemetrySink`] implementations, which can log,
//! aggregate, or forward events to external systems. The trait is expressed as a
//! `tower::Service<FleetEvent>` so sinks compose the same way the rest of the stack does.

use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tower::Service;

/// Structured events emitted by the channel, breaker, queue, and dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum FleetEvent {
    /// A channel's connection state changed.
    ChannelStateChanged {
        /// `host:port`, or node id rendered as text for the main channel's node id slot.
        target: String,
        /// Previous state.
        from: &'static str,
        /// New state.
        to: &'static str,
    },
    /// A node's circuit breaker changed state.
    BreakerStateChanged {
        /// Node identifier.
        node_id: i64,
        /// Previous state.
        from: &'static str,
        /// New state.
        to: &'static str,
    },
    /// The operation queue drained a batch.
    QueueFlushed {
        /// Number of ops in the batch.
        batch_size: usize,
        /// Number of ops currently still pending after the drain.
        pending_after: usize,
    },
    /// A single RPC completed (successfully or not).
    RpcCompleted {
        /// `Add` | `Update` | `Remove`.
        op: &'static str,
        /// `host:port` or node id of the target.
        target: String,
        /// Wall time spent on the call.
        duration: Duration,
        /// Whether the call (after already-exists/not-found normalization) succeeded.
        success: bool,
    },
}

impl fmt::Display for FleetEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FleetEvent::ChannelStateChanged { target, from, to } => {
                write!(f, "channel {target} {from} -> {to}")
            }
            FleetEvent::BreakerStateChanged { node_id, from, to } => {
                write!(f, "breaker node={node_id} {from} -> {to}")
            }
            FleetEvent::QueueFlushed { batch_size, pending_after } => {
                write!(f, "queue flushed batch={batch_size} pending={pending_after}")
            }
            FleetEvent::RpcCompleted { op, target, duration, success } => {
                write!(f, "rpc op={op} target={target} duration={duration:?} success={success}")
            }
        }
    }
}

/// A telemetry sink that consumes fleet events.
///
/// Bounding `Future: Send` here, rather than at every call site, is what lets any function
/// generic over `S: TelemetrySink` call [`emit_best_effort`] without repeating the bound --
/// Rust checks generic calls against the callee's declared bounds, so the bound has to live on
/// the trait itself.
pub trait TelemetrySink:
    tower::Service<FleetEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
where
    <Self as tower::Service<FleetEvent>>::Future: Send + 'static,
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: FleetEvent)
where
    S: TelemetrySink,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<FleetEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: FleetEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events via `tracing`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<FleetEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: FleetEvent) -> Self::Future {
        tracing::info!(event = %event, "fleet_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that retains recent events in memory, for tests and diagnostics.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<FleetEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// A sink retaining up to `capacity` most recent events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity,
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A sink with no eviction limit.
    pub fn unbounded() -> Self {
        Self::with_capacity(usize::MAX)
    }

    /// Snapshot of currently retained events, oldest first.
    pub fn events(&self) -> Vec<FleetEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Clear retained events.
    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    /// Number of events currently retained.
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// True if no events are retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of events dropped due to capacity eviction.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl Service<FleetEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: FleetEvent) -> Self::Future {
        let mut guard = self.events.lock().unwrap();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

//! Convenient re-exports for common fleet-dispatcher types.
pub use crate::{
    build_account, Account, AsyncFacade, BlockingFacade, BreakerConfig, ChannelConfig,
    ChannelState, CircuitBreaker, CircuitState, CircuitStats, DispatcherConfig, DispatcherError,
    FleetDispatcher, FleetEvent, FleetStats, InboundCatalog, InboundInfo, LegacyXrayOps, LogSink,
    MemorySink, Network, NodeView, NoopLegacyOps, NullSink, OpType, OperationQueue, PendingOp,
    ProxySettings, ProxyType, QueueConfig, QueueStats, RpcChannel, TelemetrySink, TlsMode,
    UserStatus, UserView,
};

#![forbid(unsafe_code)]

//! # Fleet dispatcher
//!
//! Keeps a local proxy core and a set of remote proxy nodes in sync with a user database.
//! Exposes a small set of user mutations (`add_user`, `update_user`, `remove_user`) and fans
//! each one out, as per-inbound RPCs, to the main core and to every node whose circuit
//! breaker currently allows it.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use fleet_dispatcher::{
//!     AsyncFacade, DispatcherConfig, FleetDispatcher, InboundCatalog, LogSink, NoopLegacyOps,
//!     UserStatus, UserView,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = Arc::new(FleetDispatcher::new(DispatcherConfig::default(), LogSink));
//! dispatcher.start("127.0.0.1", 62050, InboundCatalog::default()).await?;
//!
//! let facade = AsyncFacade::new(dispatcher.clone(), Arc::new(NoopLegacyOps));
//! facade
//!     .add_user(UserView {
//!         id: 1,
//!         username: "alice".to_string(),
//!         status: UserStatus::Active,
//!         proxies: HashMap::new(),
//!         inbounds: HashMap::new(),
//!     })
//!     .await?;
//!
//! dispatcher.stop().await;
//! # Ok(())
//! # }
//! ```

mod account;
mod breaker;
mod certfetch;
mod channel;
mod config;
mod dispatcher;
mod error;
mod facade;
mod pb;
mod queue;
mod telemetry;

pub mod clock;

pub use account::{
    build_account, Account, InboundCatalog, InboundInfo, Network, NodeView, ProxySettings,
    ProxyType, TlsMode, UserStatus, UserView,
};
pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState, CircuitStats};
pub use channel::{ChannelConfig, ChannelState, RpcChannel};
pub use clock::{Clock, MonotonicClock};
pub use config::DispatcherConfig;
pub use dispatcher::{FleetDispatcher, FleetStats};
pub use error::DispatcherError;
pub use facade::{AsyncFacade, BlockingFacade, LegacyXrayOps, NoopLegacyOps};
pub use pb::{
    AddUserOperation, AlterInboundRequest, AlterInboundResponse, HandlerServiceClient,
    RemoveUserOperation, User as AccountUser,
};
pub use queue::{OpType, OperationQueue, PendingOp, QueueConfig, QueueStats};
pub use telemetry::{emit_best_effort, FleetEvent, LogSink, MemorySink, NullSink, TelemetrySink};

pub mod prelude;

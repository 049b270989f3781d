//! Central fleet manager: binds channels, breaker, and queue together and fans out user
//! mutations to the main core and every eligible node.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

use crate::account::{build_account, InboundCatalog, NodeView, ProxyType, UserView};
use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::certfetch::fetch_leaf_cert_pem;
use crate::channel::{ChannelConfig, RpcChannel};
use crate::config::DispatcherConfig;
use crate::error::DispatcherError;
use crate::pb::{AlterInboundRequest, HandlerServiceClient};
use crate::queue::{OpType, OperationQueue, PendingOp, QueueConfig};
use crate::telemetry::{emit_best_effort, FleetEvent, TelemetrySink};

/// SNI presented on every node TLS handshake, matching the external engine's expected name.
const NODE_SNI_OVERRIDE: &str = "Gozargah";

/// Snapshot statistics returned by [`FleetDispatcher::stats`].
#[derive(Debug, Clone)]
pub struct FleetStats {
    pub started: bool,
    pub connected_nodes: Vec<i64>,
    pub open_circuits: Vec<i64>,
    pub queue_enqueued: u64,
    pub queue_deduplicated: u64,
    pub queue_flushed: u64,
    pub queue_batches: u64,
    pub queue_pending: usize,
}

struct NodeEntry<S> {
    channel: Arc<RpcChannel<S>>,
}

/// Owns the main channel, the node channel map, the breaker, and the queue; expands user
/// mutations into per-inbound RPCs fanned out across the fleet.
pub struct FleetDispatcher<S = crate::telemetry::NullSink>
where
    S: TelemetrySink,
{
    config: DispatcherConfig,
    main_channel: RwLock<Option<Arc<RpcChannel<S>>>>,
    nodes: Arc<RwLock<HashMap<i64, NodeEntry<S>>>>,
    breaker: Arc<CircuitBreaker<S>>,
    queue: Arc<OperationQueue<UserView, S>>,
    catalog: Arc<RwLock<InboundCatalog>>,
    started: RwLock<bool>,
    sink: S,
}

impl<S> FleetDispatcher<S>
where
    S: TelemetrySink,
{
    pub fn new(config: DispatcherConfig, sink: S) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: config.circuit_failure_threshold,
                recovery_timeout: config.circuit_recovery_timeout(),
                half_open_max_calls: config.circuit_half_open_max_calls,
                success_threshold: config.circuit_success_threshold,
            },
            sink.clone(),
        ));
        let queue = Arc::new(OperationQueue::new(
            QueueConfig {
                flush_interval: config.queue_flush_interval(),
                max_batch_size: config.queue_max_batch_size,
                max_wait_time: config.queue_max_wait(),
            },
            sink.clone(),
        ));
        Self {
            config,
            main_channel: RwLock::new(None),
            nodes: Arc::new(RwLock::new(HashMap::new())),
            breaker,
            queue,
            catalog: Arc::new(RwLock::new(InboundCatalog::default())),
            started: RwLock::new(false),
            sink,
        }
    }

    /// Connect the main core channel, install the batch executor, and start the queue.
    pub async fn start(
        self: &Arc<Self>,
        main_address: impl Into<String>,
        main_port: u16,
        catalog: InboundCatalog,
    ) -> Result<(), DispatcherError> {
        let cfg = ChannelConfig {
            connect_timeout: self.config.connect_timeout(),
            call_timeout: self.config.call_timeout(),
            ..ChannelConfig::plaintext(main_address, main_port)
        };
        let main = Arc::new(RpcChannel::new(cfg, None, self.sink.clone()));
        main.connect().await?;

        *self.main_channel.write().await = Some(main);
        *self.catalog.write().await = catalog;

        let this = self.clone();
        self.queue.set_executor(move |batch| {
            let this = this.clone();
            Box::pin(async move {
                this.execute_batch(batch).await;
            })
        });
        self.queue.start().await;
        *self.started.write().await = true;
        tracing::info!("fleet dispatcher started");
        Ok(())
    }

    /// Stop the queue (final drain) and disconnect every channel.
    pub async fn stop(self: &Arc<Self>) {
        self.queue.stop().await;
        let mut nodes = self.nodes.write().await;
        for (_, entry) in nodes.drain() {
            entry.channel.disconnect().await;
        }
        if let Some(main) = self.main_channel.write().await.take() {
            main.disconnect().await;
        }
        *self.started.write().await = false;
        tracing::info!("fleet dispatcher stopped");
    }

    pub async fn is_started(&self) -> bool {
        *self.started.read().await
    }

    /// Fetch the node's TLS leaf cert, connect, and register it for fan-out.
    pub async fn connect_node(&self, node: &NodeView) -> Result<(), DispatcherError> {
        self.disconnect_node(node.id).await;

        let cert_pem = fetch_leaf_cert_pem(&node.address, node.rest_port)
            .await
            .map_err(|e| DispatcherError::CertFetch { node_id: node.id, cause: e.to_string() })?;

        let cfg = ChannelConfig {
            ssl_cert: Some(cert_pem),
            ssl_target_name: Some(NODE_SNI_OVERRIDE.to_string()),
            connect_timeout: self.config.connect_timeout(),
            call_timeout: self.config.call_timeout(),
            ..ChannelConfig::plaintext(node.address.clone(), node.rpc_port)
        };
        let channel = Arc::new(RpcChannel::new(cfg, Some(node.id), self.sink.clone()));
        channel.connect().await?;

        self.nodes.write().await.insert(node.id, NodeEntry { channel });
        self.breaker.reset(node.id);
        tracing::info!(node_id = node.id, name = %node.name, "node connected");
        Ok(())
    }

    pub async fn disconnect_node(&self, node_id: i64) {
        if let Some(entry) = self.nodes.write().await.remove(&node_id) {
            entry.channel.disconnect().await;
            tracing::info!(node_id, "node disconnected");
        }
    }

    pub async fn reconnect_node(&self, node: &NodeView) -> Result<(), DispatcherError> {
        self.disconnect_node(node.id).await;
        self.connect_node(node).await
    }

    pub async fn connected_node_ids(&self) -> Vec<i64> {
        self.nodes.read().await.keys().copied().collect()
    }

    /// Enqueue an add/update/remove for later batched execution.
    pub async fn add_user(&self, user: UserView) -> Result<(), DispatcherError> {
        self.enqueue(user, OpType::Add).await
    }

    pub async fn update_user(&self, user: UserView) -> Result<(), DispatcherError> {
        self.enqueue(user, OpType::Update).await
    }

    pub async fn remove_user(&self, user: UserView) -> Result<(), DispatcherError> {
        self.enqueue(user, OpType::Remove).await
    }

    async fn enqueue(&self, user: UserView, op_type: OpType) -> Result<(), DispatcherError> {
        if !self.is_started().await {
            return Err(DispatcherError::NotStarted);
        }
        self.queue.enqueue(user.id, op_type, user);
        Ok(())
    }

    /// Execute immediately, bypassing the queue.
    pub async fn add_user_direct(self: &Arc<Self>, user: UserView) -> Result<(), DispatcherError> {
        self.execute_one(PendingOp { op_type: OpType::Add, user_id: user.id, snapshot: user, enqueued_at: Instant::now() }).await
    }

    pub async fn update_user_direct(self: &Arc<Self>, user: UserView) -> Result<(), DispatcherError> {
        self.execute_one(PendingOp { op_type: OpType::Update, user_id: user.id, snapshot: user, enqueued_at: Instant::now() }).await
    }

    pub async fn remove_user_direct(self: &Arc<Self>, user: UserView) -> Result<(), DispatcherError> {
        self.execute_one(PendingOp { op_type: OpType::Remove, user_id: user.id, snapshot: user, enqueued_at: Instant::now() }).await
    }

    async fn execute_one(self: &Arc<Self>, op: PendingOp<UserView>) -> Result<(), DispatcherError> {
        if !self.is_started().await {
            return Err(DispatcherError::NotStarted);
        }
        self.execute_batch(vec![op]).await;
        Ok(())
    }

    async fn execute_batch(self: &Arc<Self>, batch: Vec<PendingOp<UserView>>) {
        let futures: Vec<_> = batch.into_iter().map(|op| {
            let this = self.clone();
            tokio::spawn(async move { this.execute_op(op).await })
        }).collect();
        futures::future::join_all(futures).await;
    }

    async fn execute_op(self: &Arc<Self>, op: PendingOp<UserView>) {
        let user = op.snapshot;
        let result = match op.op_type {
            OpType::Add => self.do_add_user(&user).await,
            OpType::Update => self.do_update_user(&user).await,
            OpType::Remove => self.do_remove_user(&user).await,
        };
        if let Err(e) = result {
            tracing::error!(user_id = user.id, error = %e, "batch op failed");
        }
    }

    async fn do_add_user(self: &Arc<Self>, user: &UserView) -> Result<(), DispatcherError> {
        let catalog = self.catalog.read().await;
        let mut calls = Vec::new();
        for (proxy_type, tags) in &user.inbounds {
            for tag in tags {
                if let Some(info) = catalog.get(tag) {
                    let account = build_account(user, *proxy_type, info, 0);
                    let req = AlterInboundRequest::add_user(tag.clone(), 0, &account);
                    calls.push(self.fan_out(req, "Add"));
                }
            }
        }
        drop(catalog);
        futures::future::join_all(calls).await;
        Ok(())
    }

    async fn do_update_user(self: &Arc<Self>, user: &UserView) -> Result<(), DispatcherError> {
        let catalog = self.catalog.read().await;
        let active = user.active_tags();
        let mut calls = Vec::new();

        for (proxy_type, tags) in &user.inbounds {
            for tag in tags {
                if let Some(info) = catalog.get(tag) {
                    let remove_req = AlterInboundRequest::remove_user(tag.clone(), user.email());
                    calls.push(self.fan_out(remove_req, "Update"));
                    let account = build_account(user, *proxy_type, info, 0);
                    let add_req = AlterInboundRequest::add_user(tag.clone(), 0, &account);
                    calls.push(self.fan_out(add_req, "Update"));
                }
            }
        }
        for tag in catalog.tags() {
            if !active.contains(&tag) {
                let req = AlterInboundRequest::remove_user(tag, user.email());
                calls.push(self.fan_out(req, "Update"));
            }
        }
        drop(catalog);
        futures::future::join_all(calls).await;
        Ok(())
    }

    async fn do_remove_user(self: &Arc<Self>, user: &UserView) -> Result<(), DispatcherError> {
        let catalog = self.catalog.read().await;
        let mut calls = Vec::new();
        for tag in catalog.tags() {
            let req = AlterInboundRequest::remove_user(tag, user.email());
            calls.push(self.fan_out(req, "Remove"));
        }
        drop(catalog);
        futures::future::join_all(calls).await;
        Ok(())
    }

    /// Issue `req` against the main channel (unconditionally) and every node whose breaker
    /// currently allows it.
    fn fan_out(
        self: &Arc<Self>,
        req: AlterInboundRequest,
        op_label: &'static str,
    ) -> futures::future::BoxFuture<'static, ()> {
        let this = self.clone();
        Box::pin(async move {
            let mut targets: Vec<futures::future::BoxFuture<'static, ()>> = Vec::new();

            if let Some(main) = this.main_channel.read().await.clone() {
                let this2 = this.clone();
                let req2 = req.clone();
                targets.push(Box::pin(async move {
                    this2.call_main(main, req2, op_label).await;
                }));
            }

            let node_ids: Vec<i64> = this.nodes.read().await.keys().copied().collect();
            for node_id in node_ids {
                if !this.breaker.is_allowed(node_id).await {
                    continue;
                }
                let this2 = this.clone();
                let req2 = req.clone();
                targets.push(Box::pin(async move {
                    this2.call_node(node_id, req2, op_label).await;
                }));
            }

            futures::future::join_all(targets).await;
        })
    }

    async fn call_main(self: &Arc<Self>, channel: Arc<RpcChannel<S>>, req: AlterInboundRequest, op_label: &'static str) {
        let target = channel.target();
        let start = Instant::now();
        let outcome = self.issue_call(&channel, req).await;
        let success = match outcome {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(target = %target, error = %e, "main core call failed");
                false
            }
        };
        emit_best_effort(
            self.sink.clone(),
            FleetEvent::RpcCompleted { op: op_label, target, duration: start.elapsed(), success },
        )
        .await;
    }

    async fn call_node(self: &Arc<Self>, node_id: i64, req: AlterInboundRequest, op_label: &'static str) {
        let channel = match self.nodes.read().await.get(&node_id).map(|e| e.channel.clone()) {
            Some(c) => c,
            None => return,
        };
        let target = channel.target();
        let start = Instant::now();
        let outcome = self.issue_call(&channel, req).await;
        let success = match &outcome {
            Ok(()) => {
                self.breaker.record_success(node_id).await;
                true
            }
            Err(_) => {
                self.breaker.record_failure(node_id).await;
                false
            }
        };
        if let Err(e) = outcome {
            tracing::error!(node_id, target = %target, error = %e, "node call failed");
        }
        emit_best_effort(
            self.sink.clone(),
            FleetEvent::RpcCompleted { op: op_label, target, duration: start.elapsed(), success },
        )
        .await;
    }

    async fn issue_call(
        self: &Arc<Self>,
        channel: &Arc<RpcChannel<S>>,
        req: AlterInboundRequest,
    ) -> Result<(), DispatcherError> {
        channel.ensure_connected().await?;
        let transport = channel.channel().await?;
        let mut client = HandlerServiceClient::new(transport);
        let is_add = req.operation_type == "AddUserOperation";

        let call_timeout = self.config.call_timeout();
        match tokio::time::timeout(call_timeout, client.alter_inbound(req, call_timeout)).await {
            Ok(Ok(_resp)) => Ok(()),
            Ok(Err(status)) => {
                let err = DispatcherError::Remote { target: channel.target(), status: status.to_string() };
                if is_add && (status.code() == tonic::Code::AlreadyExists || err.is_already_exists()) {
                    Ok(())
                } else if !is_add && (status.code() == tonic::Code::NotFound || err.is_not_found()) {
                    Ok(())
                } else {
                    Err(err)
                }
            }
            Err(_) => Err(DispatcherError::CallTimeout { target: channel.target(), elapsed: call_timeout }),
        }
    }

    /// Snapshot of dispatcher health for a `/stats`-style endpoint.
    pub async fn stats(&self) -> FleetStats {
        let qs = self.queue.stats();
        FleetStats {
            started: self.is_started().await,
            connected_nodes: self.connected_node_ids().await,
            open_circuits: self.breaker.open_circuits(),
            queue_enqueued: qs.enqueued,
            queue_deduplicated: qs.deduplicated,
            queue_flushed: qs.flushed,
            queue_batches: qs.batches,
            queue_pending: self.queue.pending_count(),
        }
    }
}

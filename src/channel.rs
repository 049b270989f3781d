//! A single persistent RPC connection to the main proxy core or one remote node.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};

use crate::error::DispatcherError;
use crate::telemetry::{emit_best_effort, FleetEvent, TelemetrySink};

/// Connection lifecycle of an [`RpcChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ChannelState {
    fn label(self) -> &'static str {
        match self {
            ChannelState::Disconnected => "Disconnected",
            ChannelState::Connecting => "Connecting",
            ChannelState::Connected => "Connected",
            ChannelState::Failed => "Failed",
        }
    }
}

/// Static configuration for one [`RpcChannel`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Endpoint address, e.g. a hostname or IP.
    pub address: String,
    /// Endpoint RPC port.
    pub port: u16,
    /// PEM-encoded root certificate pinned for this endpoint, if TLS is used.
    pub ssl_cert: Option<String>,
    /// SNI override presented during the TLS handshake.
    pub ssl_target_name: Option<String>,
    /// Deadline for establishing the transport.
    pub connect_timeout: Duration,
    /// Deadline applied to each RPC issued over this channel.
    pub call_timeout: Duration,
}

impl ChannelConfig {
    /// Plaintext config with default timeouts.
    pub fn plaintext(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            ssl_cert: None,
            ssl_target_name: None,
            connect_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(5),
        }
    }

    /// `host:port` string used in logs and error messages.
    pub fn target(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    fn uri(&self) -> String {
        let scheme = if self.ssl_cert.is_some() { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.address, self.port)
    }
}

/// Wraps one logical connection to one RPC endpoint: the main core, or a single node.
pub struct RpcChannel<S = crate::telemetry::NullSink> {
    config: ChannelConfig,
    /// Node identifier; `None` for the main core's channel.
    node_id: Option<i64>,
    inner: Arc<Mutex<Inner>>,
    sink: S,
}

struct Inner {
    state: ChannelState,
    channel: Option<Channel>,
    last_error: Option<String>,
}

impl<S> RpcChannel<S>
where
    S: TelemetrySink,
{
    pub fn new(config: ChannelConfig, node_id: Option<i64>, sink: S) -> Self {
        Self {
            config,
            node_id,
            inner: Arc::new(Mutex::new(Inner {
                state: ChannelState::Disconnected,
                channel: None,
                last_error: None,
            })),
            sink,
        }
    }

    pub fn node_id(&self) -> Option<i64> {
        self.node_id
    }

    pub fn target(&self) -> String {
        self.config.target()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub async fn state(&self) -> ChannelState {
        self.inner.lock().await.state
    }

    /// Idempotent connect: builds (or rebuilds) the transport and transitions to `Connected`.
    pub async fn connect(&self) -> Result<(), DispatcherError> {
        let mut guard = self.inner.lock().await;
        if guard.state == ChannelState::Connected {
            return Ok(());
        }
        self.transition(&mut guard, ChannelState::Connecting).await;

        let mut endpoint = Endpoint::from_shared(self.config.uri())
            .map_err(|e| DispatcherError::Connect { target: self.config.target(), cause: e.to_string() })?
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.call_timeout);

        if let Some(cert_pem) = &self.config.ssl_cert {
            let mut tls = ClientTlsConfig::new()
                .ca_certificate(tonic::transport::Certificate::from_pem(cert_pem.as_bytes()));
            if let Some(sni) = &self.config.ssl_target_name {
                tls = tls.domain_name(sni.clone());
            }
            endpoint = endpoint
                .tls_config(tls)
                .map_err(|e| DispatcherError::Connect { target: self.config.target(), cause: e.to_string() })?;
        }

        match tokio::time::timeout(self.config.connect_timeout, endpoint.connect()).await {
            Ok(Ok(channel)) => {
                guard.channel = Some(channel);
                guard.last_error = None;
                self.transition(&mut guard, ChannelState::Connected).await;
                Ok(())
            }
            Ok(Err(e)) => {
                guard.channel = None;
                guard.last_error = Some(e.to_string());
                self.transition(&mut guard, ChannelState::Failed).await;
                Err(DispatcherError::Connect { target: self.config.target(), cause: e.to_string() })
            }
            Err(_) => {
                guard.channel = None;
                guard.last_error = Some("connect timed out".to_string());
                self.transition(&mut guard, ChannelState::Failed).await;
                Err(DispatcherError::Connect {
                    target: self.config.target(),
                    cause: "connect timed out".to_string(),
                })
            }
        }
    }

    /// Tear down the transport unconditionally; never fails.
    pub async fn disconnect(&self) {
        let mut guard = self.inner.lock().await;
        guard.channel = None;
        self.transition(&mut guard, ChannelState::Disconnected).await;
    }

    /// Connect if not already connected.
    pub async fn ensure_connected(&self) -> Result<(), DispatcherError> {
        if self.state().await == ChannelState::Connected {
            return Ok(());
        }
        self.connect().await
    }

    /// A cloned handle to the underlying transport. `tonic::transport::Channel` is cheap to
    /// clone and multiplexes requests internally, so callers may hold this across many RPCs.
    pub async fn channel(&self) -> Result<Channel, DispatcherError> {
        let guard = self.inner.lock().await;
        guard.channel.clone().ok_or_else(|| DispatcherError::NotConnected { target: self.config.target() })
    }

    async fn transition(&self, guard: &mut tokio::sync::MutexGuard<'_, Inner>, to: ChannelState) {
        let from = guard.state;
        guard.state = to;
        if from != to {
            tracing::debug!(target = %self.config.target(), from = from.label(), to = to.label(), "channel state changed");
            emit_best_effort(
                self.sink.clone(),
                FleetEvent::ChannelStateChanged {
                    target: self.config.target(),
                    from: from.label(),
                    to: to.label(),
                },
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::NullSink;

    #[tokio::test]
    async fn starts_disconnected() {
        let cfg = ChannelConfig::plaintext("127.0.0.1", 1);
        let chan = RpcChannel::new(cfg, None, NullSink);
        assert_eq!(chan.state().await, ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn connect_to_unreachable_port_transitions_to_failed() {
        let cfg = ChannelConfig {
            connect_timeout: Duration::from_millis(200),
            ..ChannelConfig::plaintext("127.0.0.1", 1)
        };
        let chan = RpcChannel::new(cfg, Some(7), NullSink);
        let result = chan.connect().await;
        assert!(result.is_err());
        assert_eq!(chan.state().await, ChannelState::Failed);
    }

    #[tokio::test]
    async fn channel_before_connect_is_not_connected_error() {
        let cfg = ChannelConfig::plaintext("127.0.0.1", 1);
        let chan = RpcChannel::new(cfg, None, NullSink);
        let err = chan.channel().await.unwrap_err();
        assert!(matches!(err, DispatcherError::NotConnected { .. }));
    }
}

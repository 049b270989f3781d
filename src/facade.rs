//! Public sync/async entry points used by the HTTP/admin layer: `add_user`, `update_user`,
//! `remove_user`, each falling back to a legacy collaborator when the dispatcher isn't running.

use std::sync::Arc;

use async_trait::async_trait;

use crate::account::UserView;
use crate::dispatcher::FleetDispatcher;
use crate::error::DispatcherError;
use crate::telemetry::TelemetrySink;

/// Fallback collaborator invoked when the dispatcher has not been started, matching the
/// reference system's fallback to its legacy per-process operations module.
#[async_trait]
pub trait LegacyXrayOps: Send + Sync {
    async fn add_user(&self, user: &UserView) -> Result<(), DispatcherError>;
    async fn update_user(&self, user: &UserView) -> Result<(), DispatcherError>;
    async fn remove_user(&self, user: &UserView) -> Result<(), DispatcherError>;
}

/// A `LegacyXrayOps` that does nothing; used where no legacy collaborator is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLegacyOps;

#[async_trait]
impl LegacyXrayOps for NoopLegacyOps {
    async fn add_user(&self, _user: &UserView) -> Result<(), DispatcherError> {
        Ok(())
    }
    async fn update_user(&self, _user: &UserView) -> Result<(), DispatcherError> {
        Ok(())
    }
    async fn remove_user(&self, _user: &UserView) -> Result<(), DispatcherError> {
        Ok(())
    }
}

/// Async façade: checks whether the dispatcher is started and enqueues through it, or falls
/// back to the legacy collaborator.
pub struct AsyncFacade<S>
where
    S: TelemetrySink,
{
    dispatcher: Arc<FleetDispatcher<S>>,
    legacy: Arc<dyn LegacyXrayOps>,
}

impl<S> AsyncFacade<S>
where
    S: TelemetrySink,
{
    pub fn new(dispatcher: Arc<FleetDispatcher<S>>, legacy: Arc<dyn LegacyXrayOps>) -> Self {
        Self { dispatcher, legacy }
    }

    pub async fn add_user(&self, user: UserView) -> Result<(), DispatcherError> {
        if self.dispatcher.is_started().await {
            self.dispatcher.add_user(user).await
        } else {
            self.legacy.add_user(&user).await
        }
    }

    pub async fn update_user(&self, user: UserView) -> Result<(), DispatcherError> {
        if self.dispatcher.is_started().await {
            self.dispatcher.update_user(user).await
        } else {
            self.legacy.update_user(&user).await
        }
    }

    pub async fn remove_user(&self, user: UserView) -> Result<(), DispatcherError> {
        if self.dispatcher.is_started().await {
            self.dispatcher.remove_user(user).await
        } else {
            self.legacy.remove_user(&user).await
        }
    }

    /// Bypass the queue and execute the add immediately.
    pub async fn add_user_direct(&self, user: UserView) -> Result<(), DispatcherError> {
        if self.dispatcher.is_started().await {
            self.dispatcher.add_user_direct(user).await
        } else {
            self.legacy.add_user(&user).await
        }
    }

    /// Bypass the queue and execute the update immediately.
    pub async fn update_user_direct(&self, user: UserView) -> Result<(), DispatcherError> {
        if self.dispatcher.is_started().await {
            self.dispatcher.update_user_direct(user).await
        } else {
            self.legacy.update_user(&user).await
        }
    }

    /// Bypass the queue and execute the removal immediately.
    pub async fn remove_user_direct(&self, user: UserView) -> Result<(), DispatcherError> {
        if self.dispatcher.is_started().await {
            self.dispatcher.remove_user_direct(user).await
        } else {
            self.legacy.remove_user(&user).await
        }
    }
}

/// Blocking façade for non-async call sites, running enqueue calls to completion on a private
/// single-threaded runtime.
pub struct BlockingFacade<S>
where
    S: TelemetrySink,
{
    inner: AsyncFacade<S>,
    runtime: tokio::runtime::Runtime,
}

impl<S> BlockingFacade<S>
where
    S: TelemetrySink,
{
    pub fn new(dispatcher: Arc<FleetDispatcher<S>>, legacy: Arc<dyn LegacyXrayOps>) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        Ok(Self { inner: AsyncFacade::new(dispatcher, legacy), runtime })
    }

    pub fn add_user(&self, user: UserView) -> Result<(), DispatcherError> {
        self.runtime.block_on(self.inner.add_user(user))
    }

    pub fn update_user(&self, user: UserView) -> Result<(), DispatcherError> {
        self.runtime.block_on(self.inner.update_user(user))
    }

    pub fn remove_user(&self, user: UserView) -> Result<(), DispatcherError> {
        self.runtime.block_on(self.inner.remove_user(user))
    }

    /// Bypass the queue and execute the add immediately.
    pub fn add_user_direct(&self, user: UserView) -> Result<(), DispatcherError> {
        self.runtime.block_on(self.inner.add_user_direct(user))
    }

    /// Bypass the queue and execute the update immediately.
    pub fn update_user_direct(&self, user: UserView) -> Result<(), DispatcherError> {
        self.runtime.block_on(self.inner.update_user_direct(user))
    }

    /// Bypass the queue and execute the removal immediately.
    pub fn remove_user_direct(&self, user: UserView) -> Result<(), DispatcherError> {
        self.runtime.block_on(self.inner.remove_user_direct(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherConfig;
    use crate::telemetry::NullSink;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLegacy {
        adds: AtomicUsize,
    }

    #[async_trait]
    impl LegacyXrayOps for CountingLegacy {
        async fn add_user(&self, _user: &UserView) -> Result<(), DispatcherError> {
            self.adds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn update_user(&self, _user: &UserView) -> Result<(), DispatcherError> {
            Ok(())
        }
        async fn remove_user(&self, _user: &UserView) -> Result<(), DispatcherError> {
            Ok(())
        }
    }

    fn sample_user() -> UserView {
        UserView {
            id: 1,
            username: "a".to_string(),
            status: crate::account::UserStatus::Active,
            proxies: HashMap::new(),
            inbounds: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn falls_back_to_legacy_when_dispatcher_not_started() {
        let dispatcher = Arc::new(FleetDispatcher::new(DispatcherConfig::default(), NullSink));
        let legacy = Arc::new(CountingLegacy { adds: AtomicUsize::new(0) });
        let facade = AsyncFacade::new(dispatcher, legacy.clone());

        facade.add_user(sample_user()).await.unwrap();
        assert_eq!(legacy.adds.load(Ordering::SeqCst), 1);
    }
}

//! Shutdown coordination.
//!
//! On trigger the coordinator stops admissions, closes every registered
//! connection once, clears the registry and then gives live sessions a grace
//! period to wind down. Sessions still running after that are abandoned;
//! their own late deregistration hits an empty registry and does nothing.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{sync::watch, time::timeout};
use tracing::{debug, info, warn};

use crate::{error::HubError, registry::Registry};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Connections closed cleanly.
    pub closed: usize,
    /// Connections whose close failed (writer already gone).
    pub failed: usize,
    /// Sessions still running when the grace period ran out.
    pub abandoned: usize,
}

pub struct ShutdownCoordinator {
    registry: Arc<Registry>,
    accepting: AtomicBool,
    drained: watch::Sender<bool>,
    sessions: watch::Sender<usize>,
    grace_period: Duration,
}

impl ShutdownCoordinator {
    pub fn new(registry: Arc<Registry>, grace_period: Duration) -> Self {
        let (drained, _) = watch::channel(false);
        let (sessions, _) = watch::channel(0);
        Self {
            registry,
            accepting: AtomicBool::new(true),
            drained,
            sessions,
            grace_period,
        }
    }

    /// Consulted by the admission layer before upgrading a request.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn live_sessions(&self) -> usize {
        *self.sessions.borrow()
    }

    /// Counts a session as live until the returned guard is dropped.
    pub fn track_session(self: &Arc<Self>) -> SessionGuard {
        self.sessions.send_modify(|live| *live += 1);
        SessionGuard {
            coordinator: Arc::clone(self),
        }
    }

    /// Stops admissions, closes every member once and clears the registry.
    ///
    /// Returns `None` if shutdown was already triggered.
    pub fn drain(&self) -> Option<DrainReport> {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return None;
        }

        let mut report = DrainReport::default();
        let mut seen = HashSet::new();

        for (topic, conn) in self.registry.all_members() {
            // A connection joined twice is still closed once.
            if !seen.insert(conn.id()) {
                continue;
            }
            match conn.close() {
                Ok(()) => report.closed += 1,
                Err(source) => {
                    report.failed += 1;
                    let err = HubError::ShutdownClose {
                        conn_id: conn.id(),
                        source,
                    };
                    warn!(topic = %topic, error = %err, "close failed during drain");
                }
            }
        }

        self.registry.clear();
        self.drained.send_replace(true);
        debug!(closed = report.closed, failed = report.failed, "registry drained");

        Some(report)
    }

    /// Full shutdown sequence: drain, then wait for sessions up to the grace
    /// period. A second call returns an empty report.
    pub async fn shutdown(&self) -> DrainReport {
        let Some(mut report) = self.drain() else {
            debug!("shutdown already triggered");
            return DrainReport::default();
        };

        report.abandoned = self.wait_for_sessions().await;
        info!(
            closed = report.closed,
            failed = report.failed,
            abandoned = report.abandoned,
            "hub drained"
        );
        report
    }

    /// Resolves once [`ShutdownCoordinator::drain`] has completed.
    pub async fn drained(&self) {
        let mut rx = self.drained.subscribe();
        let _ = rx.wait_for(|drained| *drained).await;
    }

    async fn wait_for_sessions(&self) -> usize {
        let mut rx = self.sessions.subscribe();
        let finished = timeout(self.grace_period, rx.wait_for(|live| *live == 0))
            .await
            .is_ok();
        if finished {
            return 0;
        }

        let abandoned = *rx.borrow();
        warn!(abandoned, "grace period elapsed with sessions still running");
        abandoned
    }
}

/// Keeps a session counted as live. See [`ShutdownCoordinator::track_session`].
pub struct SessionGuard {
    coordinator: Arc<ShutdownCoordinator>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.coordinator
            .sessions
            .send_modify(|live| *live = live.saturating_sub(1));
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn termination_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = ?err, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = ?err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, Outbound};

    fn coordinator(registry: &Arc<Registry>, grace: Duration) -> Arc<ShutdownCoordinator> {
        Arc::new(ShutdownCoordinator::new(Arc::clone(registry), grace))
    }

    #[test]
    fn drain_closes_each_member_once_and_clears() {
        let registry = Arc::new(Registry::new());
        let coordinator = coordinator(&registry, Duration::from_millis(10));
        let (a, mut la) = Connection::new(registry.next_id(), 4);
        let (b, mut lb) = Connection::new(registry.next_id(), 4);
        registry.join("news", Arc::clone(&a));
        registry.join("news", Arc::clone(&a));
        registry.join("sports", Arc::clone(&b));

        let report = coordinator.drain().expect("first drain runs");

        assert_eq!(report.closed, 2);
        assert_eq!(report.failed, 0);
        assert!(registry.all_members().is_empty());
        assert!(!coordinator.is_accepting());
        assert_eq!(la.try_next(), Some(Outbound::Close));
        assert_eq!(la.try_next(), None);
        assert_eq!(lb.try_next(), Some(Outbound::Close));
        assert_eq!(lb.try_next(), None);
    }

    #[test]
    fn second_drain_is_noop() {
        let registry = Arc::new(Registry::new());
        let coordinator = coordinator(&registry, Duration::from_millis(10));
        assert!(coordinator.drain().is_some());
        assert!(coordinator.drain().is_none());
    }

    #[test]
    fn failed_close_does_not_stop_drain() {
        let registry = Arc::new(Registry::new());
        let coordinator = coordinator(&registry, Duration::from_millis(10));
        let (gone, gone_lanes) = Connection::new(registry.next_id(), 4);
        let (alive, mut alive_lanes) = Connection::new(registry.next_id(), 4);
        drop(gone_lanes);
        registry.join("t", Arc::clone(&gone));
        registry.join("t", Arc::clone(&alive));

        let report = coordinator.drain().expect("drain");

        assert_eq!(report, DrainReport { closed: 1, failed: 1, abandoned: 0 });
        assert!(gone.is_closed());
        assert_eq!(alive_lanes.try_next(), Some(Outbound::Close));
    }

    #[tokio::test]
    async fn shutdown_waits_for_sessions_to_finish() {
        let registry = Arc::new(Registry::new());
        let coordinator = coordinator(&registry, Duration::from_secs(5));
        let guard = coordinator.track_session();
        assert_eq!(coordinator.live_sessions(), 1);

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });

        let report = coordinator.shutdown().await;
        releaser.await.expect("releaser task");

        assert_eq!(report.abandoned, 0);
        assert_eq!(coordinator.live_sessions(), 0);
    }

    #[tokio::test]
    async fn shutdown_abandons_sessions_after_grace_period() {
        let registry = Arc::new(Registry::new());
        let coordinator = coordinator(&registry, Duration::from_millis(20));
        let _stuck = coordinator.track_session();

        let report = coordinator.shutdown().await;

        assert_eq!(report.abandoned, 1);
    }

    #[tokio::test]
    async fn drained_resolves_after_drain() {
        let registry = Arc::new(Registry::new());
        let coordinator = coordinator(&registry, Duration::from_millis(10));
        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.drained().await })
        };

        coordinator.drain();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("drained should resolve")
            .expect("waiter task");
    }
}

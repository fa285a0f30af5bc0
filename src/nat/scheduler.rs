//! Single control loop that keeps the reconciler's mappings leased.
//!
//! Renewal recreates every mapping once per lease (or once per retry
//! interval after a failed renewal). Drift checks run on their own, shorter
//! interval. Cancellation tears everything down under a deadline that does
//! not depend on the cancellation token.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::nat::error::{ForwardError, ForwardResult};
use crate::nat::gateway::GatewayClient;
use crate::nat::mapping::MappingDescriptor;
use crate::nat::reconciler::{ForwardOptions, Reconciler};

/// Scheduler timing. Successful renewals are one nominal lease apart
/// ([`ForwardOptions::lease_duration`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    /// Delay before the next renewal after a failed one
    pub retry_interval: Duration,
    /// Delay between drift checks
    pub check_interval: Duration,
    /// Upper bound on teardown at shutdown
    pub shutdown_timeout: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
            check_interval: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Published state; `None` until the first establish succeeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Last renewal succeeded
    Running,
    /// Last renewal failed, next one comes after the retry interval
    Retrying,
    ShuttingDown,
}

pub struct LeaseScheduler<G> {
    reconciler: Reconciler<G>,
    desired: Vec<MappingDescriptor>,
    options: ForwardOptions,
    config: ScheduleConfig,
    state: watch::Sender<Option<SchedulerState>>,
}

impl<G: GatewayClient> LeaseScheduler<G> {
    pub fn new(
        reconciler: Reconciler<G>,
        desired: Vec<MappingDescriptor>,
        options: ForwardOptions,
        config: ScheduleConfig,
    ) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            reconciler,
            desired,
            options,
            config,
            state,
        }
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<Option<SchedulerState>> {
        self.state.subscribe()
    }

    fn set_state(&self, next: SchedulerState) {
        let prev = self.state.send_replace(Some(next));
        if prev != Some(next) {
            tracing::debug!(from = ?prev, to = ?next, "Scheduler state changed");
        }
    }

    /// Run until `cancel` fires, then tear every mapping down.
    ///
    /// Fails early if the first establish fails; whatever it managed to
    /// create is torn down first. Gateway calls already in flight always
    /// complete, cancellation is noticed between them.
    pub async fn run(mut self, cancel: CancellationToken) -> ForwardResult<()> {
        if let Err(e) = self.reconciler.establish_all(&self.desired, &self.options).await {
            tracing::error!("Error starting forwardings: {}", e);
            if let Err(teardown) = self.shutdown().await {
                tracing::warn!("Cleanup after failed start incomplete: {}", teardown);
            }
            return Err(e);
        }

        self.set_state(SchedulerState::Running);
        tracing::info!(
            ports = self.reconciler.len(),
            lease = ?self.options.lease_duration,
            check = ?self.config.check_interval,
            "Forwarding established"
        );

        let renewal = sleep(self.options.lease_duration);
        tokio::pin!(renewal);

        let mut drift = interval_at(
            Instant::now() + self.config.check_interval,
            self.config.check_interval,
        );
        drift.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = &mut renewal => {
                    let next = match self.reconciler.establish_all(&self.desired, &self.options).await {
                        Ok(()) => {
                            self.set_state(SchedulerState::Running);
                            self.options.lease_duration
                        }
                        Err(e) => {
                            tracing::warn!(retry_in = ?self.config.retry_interval, "Renewal failed: {}", e);
                            self.set_state(SchedulerState::Retrying);
                            self.config.retry_interval
                        }
                    };
                    renewal.as_mut().reset(Instant::now() + next);
                }

                _ = drift.tick() => {
                    // make sure forwardings are not dropped due to inactivity
                    if let Err(e) = self.reconciler.ensure_all().await {
                        tracing::warn!("Drift check failed: {}", e);
                    }
                }
            }
        }

        self.shutdown().await
    }

    async fn shutdown(&mut self) -> ForwardResult<()> {
        self.set_state(SchedulerState::ShuttingDown);

        let limit = self.config.shutdown_timeout;
        match timeout(limit, self.reconciler.teardown_all()).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!("Teardown timed out after {:?}", limit);
                Err(ForwardError::ShutdownTimeout(limit))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::mapping::{MappingKey, Protocol};
    use crate::nat::memory::MemoryGateway;

    fn config() -> ScheduleConfig {
        ScheduleConfig {
            retry_interval: Duration::from_secs(1),
            check_interval: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    fn scheduler(gw: &MemoryGateway, ports: &[(u16, u16)]) -> LeaseScheduler<MemoryGateway> {
        let desired = ports
            .iter()
            .map(|&(i, e)| MappingDescriptor::new(i, e, Protocol::Tcp))
            .collect();
        LeaseScheduler::new(
            Reconciler::new(gw.clone()),
            desired,
            ForwardOptions {
                lease_duration: Duration::from_secs(60),
                ..Default::default()
            },
            config(),
        )
    }

    fn key(port: u16) -> MappingKey {
        MappingKey::new(port, Protocol::Tcp, "")
    }

    async fn wait_for(rx: &mut watch::Receiver<Option<SchedulerState>>, want: SchedulerState) {
        rx.wait_for(|s| *s == Some(want)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_recreates_each_lease() {
        let gw = MemoryGateway::default();
        let sched = scheduler(&gw, &[(80, 8080)]);
        let mut rx = sched.subscribe();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(sched.run(cancel.clone()));

        wait_for(&mut rx, SchedulerState::Running).await;
        assert_eq!(gw.add_count(), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(gw.add_count(), 2);

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(gw.table().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_renewal_retries_on_short_interval() {
        let gw = MemoryGateway::default();
        let sched = scheduler(&gw, &[(80, 8080)]);
        let mut rx = sched.subscribe();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(sched.run(cancel.clone()));

        wait_for(&mut rx, SchedulerState::Running).await;
        gw.fail_external_address(true);

        tokio::time::sleep(Duration::from_secs(60)).await;
        wait_for(&mut rx, SchedulerState::Retrying).await;
        let adds = gw.add_count();

        gw.fail_external_address(false);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        wait_for(&mut rx, SchedulerState::Running).await;
        assert_eq!(gw.add_count(), adds + 1);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drift_check_heals_missing_mapping() {
        let gw = MemoryGateway::default();
        let sched = scheduler(&gw, &[(80, 8080), (443, 8443)]);
        let mut rx = sched.subscribe();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(sched.run(cancel.clone()));

        wait_for(&mut rx, SchedulerState::Running).await;
        gw.remove(&key(8443));
        let adds = gw.add_count();

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(gw.get(&key(8443)).is_some());
        assert_eq!(gw.add_count(), adds + 1);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drift_check_failure_keeps_state() {
        let gw = MemoryGateway::default();
        let sched = scheduler(&gw, &[(80, 8080), (443, 8443)]);
        let mut rx = sched.subscribe();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(sched.run(cancel.clone()));

        wait_for(&mut rx, SchedulerState::Running).await;
        gw.remove(&key(8443));
        gw.reject_add(8443, true);

        // drift check fails to recreate, state must not move
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(gw.get(&key(8443)).is_none());
        assert_eq!(*rx.borrow(), Some(SchedulerState::Running));

        // the failed recreate dropped the record, renewal brings it back
        gw.reject_add(8443, false);
        tokio::time::sleep(Duration::from_secs(50)).await;
        assert!(gw.get(&key(8443)).is_some());
        assert_eq!(*rx.borrow(), Some(SchedulerState::Running));

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(gw.table().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_cleans_up_and_errors() {
        let gw = MemoryGateway::default();
        gw.reject_add(8443, true);
        let sched = scheduler(&gw, &[(80, 8080), (443, 8443)]);

        let err = sched.run(CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, ForwardError::Establish(_)));
        assert!(gw.table().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_reports_teardown_failure() {
        let gw = MemoryGateway::default();
        let sched = scheduler(&gw, &[(80, 8080)]);
        let mut rx = sched.subscribe();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(sched.run(cancel.clone()));

        wait_for(&mut rx, SchedulerState::Running).await;
        gw.reject_delete(8080, true);
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ForwardError::Teardown(_)));
        assert_eq!(*rx.borrow(), Some(SchedulerState::ShuttingDown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_gives_up_after_deadline() {
        let gw = MemoryGateway::default();
        let sched = scheduler(&gw, &[(80, 8080)]);
        let mut rx = sched.subscribe();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(sched.run(cancel.clone()));

        wait_for(&mut rx, SchedulerState::Running).await;
        gw.stall_deletes(Some(Duration::from_secs(30)));
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ForwardError::ShutdownTimeout(d) if d == Duration::from_secs(5)));
    }
}

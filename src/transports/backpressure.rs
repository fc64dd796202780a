//! Back pressure for listening endpoints.
//!
//! On every tick each watched listener is compared against its buffering
//! limits: above `maximum` it stops receiving, and once drained to
//! `restart` or below it starts again.

use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use super::ListeningAgentControl;
use crate::envelope::ListeningStatus;

/// Periodically enforces buffering limits on listening agents.
pub struct BackPressureAgent {
    period: Duration,
    agents: RwLock<Vec<Arc<dyn ListeningAgentControl>>>,
}

impl std::fmt::Debug for BackPressureAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackPressureAgent")
            .field("period", &self.period)
            .finish()
    }
}

impl BackPressureAgent {
    pub fn new(period: Duration) -> Arc<Self> {
        Arc::new(Self {
            period,
            agents: RwLock::new(Vec::new()),
        })
    }

    pub fn watch(&self, agent: Arc<dyn ListeningAgentControl>) {
        self.agents
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(agent);
    }

    /// Run one check over every watched listener.
    pub async fn check_now(&self) {
        let agents = self
            .agents
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        for agent in agents {
            let limits = agent.buffering_limits();
            let count = agent.queue_count();
            match agent.status() {
                ListeningStatus::Accepting | ListeningStatus::Unknown if count > limits.maximum => {
                    if let Err(e) = agent.mark_as_too_busy_and_stop_receiving().await {
                        tracing::error!("back_pressure_stop_failed: uri={}, error={}", agent.uri(), e);
                    }
                }
                ListeningStatus::TooBusy if count <= limits.restart => {
                    tracing::info!("back_pressure_released: uri={}, queue_count={}", agent.uri(), count);
                    if let Err(e) = agent.start().await {
                        tracing::error!("back_pressure_restart_failed: uri={}, error={}", agent.uri(), e);
                    }
                }
                _ => {}
            }
        }
    }

    /// Start the check loop in the background.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let agent = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(agent.period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => agent.check_now().await,
                    _ = cancel.cancelled() => {
                        tracing::debug!("back_pressure_agent_stopped");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::persistence::InMemoryEnvelopeStore;
    use crate::routing::{BufferingLimits, Endpoint};
    use crate::runtime::RecordingMessageLogger;
    use crate::transports::{
        ExecutionOutcome, HandlerPipeline, Listener, ListeningAgent, ListeningServices,
        MockListeningAgentControl, Receiver,
    };
    use crate::types::{NodeId, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Semaphore;
    use url::Url;

    fn control(status: ListeningStatus, count: usize) -> MockListeningAgentControl {
        let mut mock = MockListeningAgentControl::new();
        mock.expect_uri()
            .returning(|| Url::parse("local://one").unwrap());
        mock.expect_status().return_const(status);
        mock.expect_queue_count().return_const(count);
        mock.expect_buffering_limits()
            .return_const(BufferingLimits::new(10, 5));
        mock
    }

    #[tokio::test]
    async fn test_stops_listener_over_maximum() {
        let mut mock = control(ListeningStatus::Accepting, 11);
        mock.expect_mark_as_too_busy_and_stop_receiving()
            .times(1)
            .returning(|| Ok(()));
        mock.expect_start().never();

        let agent = BackPressureAgent::new(Duration::from_secs(1));
        agent.watch(Arc::new(mock));
        agent.check_now().await;
    }

    #[tokio::test]
    async fn test_restarts_listener_at_restart_limit() {
        let mut mock = control(ListeningStatus::TooBusy, 5);
        mock.expect_start().times(1).returning(|| Ok(()));
        mock.expect_mark_as_too_busy_and_stop_receiving().never();

        let agent = BackPressureAgent::new(Duration::from_secs(1));
        agent.watch(Arc::new(mock));
        agent.check_now().await;
    }

    #[tokio::test]
    async fn test_leaves_listener_between_limits() {
        let mut mock = control(ListeningStatus::TooBusy, 7);
        mock.expect_start().never();
        mock.expect_mark_as_too_busy_and_stop_receiving().never();

        let agent = BackPressureAgent::new(Duration::from_secs(1));
        agent.watch(Arc::new(mock));
        agent.check_now().await;
    }

    #[tokio::test]
    async fn test_ignores_paused_listener() {
        let mut mock = control(ListeningStatus::Stopped, 100);
        mock.expect_start().never();
        mock.expect_mark_as_too_busy_and_stop_receiving().never();

        let agent = BackPressureAgent::new(Duration::from_secs(1));
        agent.watch(Arc::new(mock));
        agent.check_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_checks_on_interval() {
        let mut mock = control(ListeningStatus::Accepting, 50);
        mock.expect_mark_as_too_busy_and_stop_receiving()
            .times(1..)
            .returning(|| Ok(()));

        let agent = BackPressureAgent::new(Duration::from_millis(100));
        agent.watch(Arc::new(mock));
        let cancel = CancellationToken::new();
        let handle = agent.start(cancel.clone());

        tokio::time::sleep(Duration::from_millis(250)).await;
        cancel.cancel();
        handle.await.unwrap();
    }

    /// Holds every execution until the test hands out a permit.
    struct GatedPipeline {
        gate: Semaphore,
    }

    #[async_trait]
    impl HandlerPipeline for GatedPipeline {
        async fn execute(
            &self,
            _endpoint: &Arc<Endpoint>,
            _envelope: Envelope,
            _channel: Arc<dyn Listener>,
        ) -> ExecutionOutcome {
            match self.gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return ExecutionOutcome::Failed,
            }
            ExecutionOutcome::Succeeded
        }
    }

    /// Transport listener that only tracks whether it is receiving.
    struct SwitchListener {
        address: Url,
        stopped: AtomicBool,
    }

    #[async_trait]
    impl Listener for SwitchListener {
        fn address(&self) -> &Url {
            &self.address
        }

        async fn complete(&self, _envelope: &Envelope) -> Result<()> {
            Ok(())
        }

        async fn defer(&self, _envelope: Envelope) -> Result<()> {
            Ok(())
        }

        async fn start(&self) -> Result<()> {
            self.stopped.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn wait_for_count(agent: &ListeningAgent, count: usize) {
        for _ in 0..500 {
            if agent.queue_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("queue count stuck at {}, expected {}", agent.queue_count(), count);
    }

    #[tokio::test]
    async fn test_listener_stops_above_maximum_and_resumes_at_restart() {
        let pipeline = Arc::new(GatedPipeline {
            gate: Semaphore::new(0),
        });
        let cancel = CancellationToken::new();
        let endpoint = Endpoint::parse("memory://receiver1")
            .unwrap()
            .listener()
            .sequential()
            .buffering_limits(250, 100);
        let agent = ListeningAgent::new(
            Arc::new(endpoint),
            ListeningServices {
                node_id: NodeId::generate("receiver"),
                store: Arc::new(InMemoryEnvelopeStore::new()),
                logger: Arc::new(RecordingMessageLogger::new()),
                pipeline: pipeline.clone(),
                cancel: cancel.clone(),
            },
        );
        let transport = Arc::new(SwitchListener {
            address: Url::parse("memory://receiver1").unwrap(),
            stopped: AtomicBool::new(false),
        });
        agent.attach(transport.clone());
        agent.activate().await.unwrap();

        let back_pressure = BackPressureAgent::new(Duration::from_secs(1));
        back_pressure.watch(agent.clone());

        let channel: Arc<dyn Listener> = transport.clone();
        let batch = (0..250).map(|_| Envelope::new("a", Vec::<u8>::new())).collect();
        agent.received(channel.clone(), batch).await.unwrap();
        back_pressure.check_now().await;
        assert_eq!(agent.status(), ListeningStatus::Accepting);

        agent
            .received(channel, vec![Envelope::new("a", Vec::<u8>::new())])
            .await
            .unwrap();
        back_pressure.check_now().await;
        assert_eq!(agent.status(), ListeningStatus::TooBusy);
        assert!(transport.stopped.load(Ordering::SeqCst));

        pipeline.gate.add_permits(150);
        wait_for_count(&agent, 101).await;
        back_pressure.check_now().await;
        assert_eq!(agent.status(), ListeningStatus::TooBusy);

        pipeline.gate.add_permits(1);
        wait_for_count(&agent, 100).await;
        back_pressure.check_now().await;
        assert_eq!(agent.status(), ListeningStatus::Accepting);
        assert!(!transport.stopped.load(Ordering::SeqCst));

        cancel.cancel();
    }
}

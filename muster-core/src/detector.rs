use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace, warn};

use crate::config::FailureDetectorConfig;
use crate::endpoint::Endpoint;
use crate::messages::{MembershipRequest, MembershipResponse, ProbeMessage, ProbeResponse};
use crate::transport::MessagingClient;

/// Per-edge liveness estimator plugged into the membership service.
///
/// Implementations own their probe payloads and verdict logic; the core
/// only drives the probe cycle and consumes `has_failed`. Swappable at
/// cluster construction.
#[async_trait]
pub trait LinkFailureDetector: Send + Sync {
    /// Builds the probe to send to `subject` this tick.
    fn create_probe(&self, subject: &Endpoint) -> ProbeMessage;

    /// Answers a probe arriving from a remote observer.
    async fn handle_probe(&self, probe: ProbeMessage) -> ProbeResponse;

    /// Feedback for a probe that completed within its deadline.
    fn on_probe_success(&self, subject: &Endpoint, response: &ProbeResponse);

    /// Feedback for a probe that failed or timed out.
    fn on_probe_failure(&self, subject: &Endpoint);

    /// Current verdict for the link to `subject`.
    fn has_failed(&self, subject: &Endpoint) -> bool;

    /// Invoked once whenever the monitored subject set is replaced.
    fn on_membership_change(&self, subjects: &[Endpoint]);
}

/// Default detector: a link is declared failed after a fixed number of
/// consecutive unanswered probes; any successful round trip resets the
/// count.
pub struct PingPongDetector {
    local: Endpoint,
    threshold: u32,
    missed: DashMap<Endpoint, u32>,
}

impl PingPongDetector {
    /// Creates a detector for the given local endpoint and failure
    /// threshold.
    pub fn new(local: Endpoint, threshold: u32) -> Self {
        Self {
            local,
            threshold,
            missed: DashMap::new(),
        }
    }
}

#[async_trait]
impl LinkFailureDetector for PingPongDetector {
    fn create_probe(&self, _subject: &Endpoint) -> ProbeMessage {
        ProbeMessage {
            sender: self.local.clone(),
            payload: Vec::new(),
        }
    }

    async fn handle_probe(&self, probe: ProbeMessage) -> ProbeResponse {
        ProbeResponse {
            sender: self.local.clone(),
            payload: probe.payload,
        }
    }

    fn on_probe_success(&self, subject: &Endpoint, _response: &ProbeResponse) {
        self.missed.insert(subject.clone(), 0);
    }

    fn on_probe_failure(&self, subject: &Endpoint) {
        *self.missed.entry(subject.clone()).or_insert(0) += 1;
    }

    fn has_failed(&self, subject: &Endpoint) -> bool {
        self.missed
            .get(subject)
            .is_some_and(|count| *count >= self.threshold)
    }

    fn on_membership_change(&self, subjects: &[Endpoint]) {
        self.missed.clear();
        for subject in subjects {
            self.missed.insert(subject.clone(), 0);
        }
    }
}

/// Periodic driver for the link failure detector.
///
/// Each tick applies any pending subject-set replacement, then probes every
/// subject whose link has not yet been declared failed. Failed links are
/// reported to the membership service through the link-failed channel;
/// reporting repeats every tick until a view change removes the subject,
/// and the service's per-configuration dedup absorbs the repeats.
pub struct FailureDetectorRunner {
    detector: Arc<dyn LinkFailureDetector>,
    client: Arc<dyn MessagingClient>,
    config: FailureDetectorConfig,
    rpc_timeout: Duration,
}

impl FailureDetectorRunner {
    /// Creates a runner; call [`spawn`](Self::spawn) to start ticking.
    pub fn new(
        detector: Arc<dyn LinkFailureDetector>,
        client: Arc<dyn MessagingClient>,
        config: FailureDetectorConfig,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            detector,
            client,
            config,
            rpc_timeout,
        }
    }

    /// Spawns the tick loop. Subject sets arrive on `subjects`; failed
    /// links are reported on `link_failed`; the loop exits when `shutdown`
    /// flips.
    pub fn spawn(
        self,
        mut subjects: watch::Receiver<Vec<Endpoint>>,
        link_failed: mpsc::Sender<Endpoint>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.config.probe_interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            let mut current: Vec<Endpoint> = subjects.borrow_and_update().clone();
            self.detector.on_membership_change(&current);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if subjects.has_changed().unwrap_or(false) {
                            current = subjects.borrow_and_update().clone();
                            self.detector.on_membership_change(&current);
                            debug!(subjects = current.len(), "monitoring set replaced");
                        }
                        self.tick(&current, &link_failed).await;
                    }
                }
            }
        })
    }

    async fn tick(&self, subjects: &[Endpoint], link_failed: &mpsc::Sender<Endpoint>) {
        if subjects.is_empty() {
            return;
        }
        let mut probes = Vec::new();
        for subject in subjects {
            if self.detector.has_failed(subject) {
                trace!(%subject, "link marked failed, skipping probe");
                if link_failed.send(subject.clone()).await.is_err() {
                    return;
                }
                continue;
            }
            let detector = Arc::clone(&self.detector);
            let client = Arc::clone(&self.client);
            let subject = subject.clone();
            let deadline = self.rpc_timeout;
            probes.push(tokio::spawn(async move {
                let probe = detector.create_probe(&subject);
                match client
                    .request(&subject, MembershipRequest::Probe(probe), deadline)
                    .await
                {
                    Ok(MembershipResponse::Probe(response)) => {
                        detector.on_probe_success(&subject, &response);
                    }
                    Ok(_) | Err(_) => detector.on_probe_failure(&subject),
                }
            }));
        }
        // The tick does not complete until every outstanding probe has
        // either answered or hit its deadline.
        for probe in probes {
            if let Err(err) = probe.await {
                warn!("probe task panicked: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::error::MembershipError;
    use crate::transport::{InProcessNetwork, RequestHandler};

    fn endpoint(port: u16) -> Endpoint {
        Endpoint::new("127.0.0.1", port)
    }

    struct ProbeResponder {
        detector: Arc<PingPongDetector>,
    }

    #[async_trait]
    impl RequestHandler for ProbeResponder {
        async fn handle(
            &self,
            request: MembershipRequest,
        ) -> Result<MembershipResponse, MembershipError> {
            match request {
                MembershipRequest::Probe(probe) => Ok(MembershipResponse::Probe(
                    self.detector.handle_probe(probe).await,
                )),
                _ => Ok(MembershipResponse::Ack),
            }
        }
    }

    #[test]
    fn pingpong_flags_after_threshold_misses() {
        let detector = PingPongDetector::new(endpoint(7000), 3);
        let subject = endpoint(7001);
        detector.on_membership_change(std::slice::from_ref(&subject));
        for _ in 0..2 {
            detector.on_probe_failure(&subject);
            assert!(!detector.has_failed(&subject));
        }
        detector.on_probe_failure(&subject);
        assert!(detector.has_failed(&subject));
    }

    #[test]
    fn pingpong_success_resets_the_count() {
        let detector = PingPongDetector::new(endpoint(7000), 3);
        let subject = endpoint(7001);
        detector.on_probe_failure(&subject);
        detector.on_probe_failure(&subject);
        let response = ProbeResponse {
            sender: subject.clone(),
            payload: Vec::new(),
        };
        detector.on_probe_success(&subject, &response);
        detector.on_probe_failure(&subject);
        assert!(!detector.has_failed(&subject));
    }

    #[test]
    fn membership_change_discards_stale_counts() {
        let detector = PingPongDetector::new(endpoint(7000), 1);
        let old = endpoint(7001);
        detector.on_probe_failure(&old);
        assert!(detector.has_failed(&old));
        detector.on_membership_change(&[endpoint(7002)]);
        assert!(!detector.has_failed(&old));
    }

    #[tokio::test]
    async fn runner_reports_unreachable_subject() {
        let network = InProcessNetwork::new();
        let local = endpoint(7000);
        let reachable = endpoint(7001);
        let unreachable = endpoint(7002);
        let remote_detector = Arc::new(PingPongDetector::new(reachable.clone(), 3));
        network.register(
            reachable.clone(),
            Arc::new(ProbeResponder {
                detector: remote_detector,
            }),
        );

        let config = FailureDetectorConfig {
            probe_interval: Duration::from_millis(10),
            probe_failure_threshold: 2,
        };
        let runner = FailureDetectorRunner::new(
            Arc::new(PingPongDetector::new(local, config.probe_failure_threshold)),
            Arc::new(network.client()),
            config,
            Duration::from_millis(50),
        );

        let (subjects_tx, subjects_rx) = watch::channel(Vec::new());
        let (failed_tx, mut failed_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = runner.spawn(subjects_rx, failed_tx, shutdown_rx);
        subjects_tx
            .send(vec![reachable.clone(), unreachable.clone()])
            .unwrap();

        let reported = tokio::time::timeout(Duration::from_secs(5), failed_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reported, unreachable);

        shutdown_tx.send(true).unwrap();
        let _ = task.await;
    }
}

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::broadcast::UnicastToAllBroadcaster;
use crate::config::MembershipConfig;
use crate::configuration::ConfigurationId;
use crate::detector::{FailureDetectorRunner, LinkFailureDetector, PingPongDetector};
use crate::endpoint::{Endpoint, Metadata, NodeId};
use crate::error::{JoinError, MembershipError};
use crate::messages::{JoinMessage, JoinResponse, JoinStatusCode, MembershipRequest, MembershipResponse};
use crate::service::{ClusterEvent, MembershipService, Subscriber};
use crate::transport::{InProcessNetwork, MessagingClient, RequestHandler, UdpTransport};
use crate::view::MembershipView;

enum TransportMode {
    Udp,
    InProcess(Arc<InProcessNetwork>),
}

enum TransportBinding {
    Udp(Arc<UdpTransport>),
    InProcess {
        network: Arc<InProcessNetwork>,
        listen: Endpoint,
    },
}

impl TransportBinding {
    fn install(&self, service: Arc<MembershipService>) {
        match self {
            Self::Udp(transport) => transport.set_handler(service as Arc<dyn RequestHandler>),
            Self::InProcess { network, listen } => {
                network.register(listen.clone(), service as Arc<dyn RequestHandler>);
            }
        }
    }

    fn teardown(&self) {
        if let Self::InProcess { network, listen } = self {
            network.deregister(listen);
        }
    }
}

/// Builder for a cluster member.
///
/// `start` bootstraps a fresh single-member cluster (seed mode); `join`
/// runs the two-phase bootstrap protocol against an existing member.
pub struct ClusterBuilder {
    listen: Endpoint,
    metadata: Metadata,
    log_proposals: bool,
    config: MembershipConfig,
    detector: Option<Arc<dyn LinkFailureDetector>>,
    transport: TransportMode,
}

impl ClusterBuilder {
    fn new(listen: Endpoint) -> Self {
        Self {
            listen,
            metadata: Metadata::new(),
            log_proposals: false,
            config: MembershipConfig::default(),
            detector: None,
            transport: TransportMode::Udp,
        }
    }

    /// Attaches immutable key/value tags to this node.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Retains delivered proposal batches for test inspection.
    #[must_use]
    pub fn with_log_proposals(mut self, log_proposals: bool) -> Self {
        self.log_proposals = log_proposals;
        self
    }

    /// Overrides the default ping-pong link failure detector.
    #[must_use]
    pub fn with_link_failure_detector(mut self, detector: Arc<dyn LinkFailureDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Overrides the protocol tuning parameters.
    #[must_use]
    pub fn with_config(mut self, config: MembershipConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs over an in-process message fabric instead of UDP. Used by
    /// multi-node tests and single-process demos.
    #[must_use]
    pub fn with_in_process_network(mut self, network: Arc<InProcessNetwork>) -> Self {
        self.transport = TransportMode::InProcess(network);
        self
    }

    /// Bootstraps a new cluster with this node as its only member.
    pub async fn start(self) -> Result<Cluster, MembershipError> {
        self.config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        let (binding, client, local) = self.bind_transport(&shutdown_rx, &mut tasks).await?;

        let node_id = NodeId::generate();
        let mut view = MembershipView::new(self.config.k);
        view.add(local.clone(), node_id)?;
        info!(%local, %node_id, "bootstrapping a new cluster");

        self.assemble(local, view, client, binding, shutdown_tx, shutdown_rx, tasks)
    }

    /// Joins an existing cluster through `seed`.
    pub async fn join(self, seed: Endpoint) -> Result<Cluster, JoinError> {
        self.config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        let (binding, client, local) = self.bind_transport(&shutdown_rx, &mut tasks).await?;

        let attempts = self.config.join.attempts;
        let mut node_id = NodeId::generate();
        for attempt in 0..attempts {
            if attempt > 0 {
                time::sleep(self.config.rpc_timeout).await;
            }
            let phase1 = JoinMessage {
                sender: local.clone(),
                node_id,
                ring_number: None,
                configuration_id: None,
                metadata: None,
            };
            let response = match client
                .request(
                    &seed,
                    MembershipRequest::JoinPhase1(phase1),
                    self.config.join.phase2_timeout,
                )
                .await
            {
                Ok(MembershipResponse::Join(response)) => response,
                Ok(other) => {
                    warn!(%seed, "unexpected phase 1 response: {other:?}");
                    continue;
                }
                Err(err) => {
                    warn!(%seed, attempt, "join phase 1 failed: {err}");
                    continue;
                }
            };

            match response.status {
                JoinStatusCode::SafeToJoin => {}
                JoinStatusCode::ConfigChanged | JoinStatusCode::UuidAlreadyInRing => {
                    debug!(%local, ?response.status, "retrying with a fresh identifier");
                    node_id = NodeId::generate();
                    continue;
                }
                JoinStatusCode::HostnameAlreadyInRing => {
                    // A previous phase 2 may have timed out mid-admission;
                    // the observers will expire the stale record.
                    warn!(%local, "hostname already in configuration {}", response.configuration_id);
                    continue;
                }
                JoinStatusCode::MembershipRejected => {
                    shutdown_tx.send(true).ok();
                    binding.teardown();
                    return Err(JoinError::Rejected(seed));
                }
            }
            if attempt > 0 {
                info!(%local, configuration = %response.configuration_id, "retrying join under a new configuration");
            }

            match self.join_phase2(&client, &local, node_id, &response).await {
                Phase2Outcome::Admitted(admission) => {
                    if admission.hosts.is_empty()
                        || admission.hosts.len() != admission.identifiers.len()
                    {
                        warn!(%local, "admission response carried a malformed configuration");
                        continue;
                    }
                    let members: Vec<(Endpoint, NodeId)> = admission
                        .hosts
                        .iter()
                        .cloned()
                        .zip(admission.identifiers.iter().copied())
                        .collect();
                    let view =
                        MembershipView::from_members(self.config.k, members).map_err(|err| {
                            MembershipError::InvariantViolation(format!(
                                "admitted configuration could not be replayed into a view: {err}"
                            ))
                        })?;
                    info!(
                        %local,
                        configuration = %admission.configuration_id,
                        members = admission.hosts.len(),
                        "joined cluster"
                    );
                    return self
                        .assemble(local, view, client, binding, shutdown_tx, shutdown_rx, tasks)
                        .map_err(JoinError::from);
                }
                Phase2Outcome::Rejected(by) => {
                    shutdown_tx.send(true).ok();
                    binding.teardown();
                    return Err(JoinError::Rejected(by));
                }
                Phase2Outcome::Retry => {}
            }
        }

        shutdown_tx.send(true).ok();
        binding.teardown();
        Err(JoinError::AttemptsExhausted(attempts))
    }

    /// Fans phase-2 join messages out to the K future observers and waits
    /// for the first admission carrying a configuration different from the
    /// phase-1 one (the commit that includes this joiner).
    async fn join_phase2(
        &self,
        client: &Arc<dyn MessagingClient>,
        local: &Endpoint,
        node_id: NodeId,
        phase1: &JoinResponse,
    ) -> Phase2Outcome {
        let (tx, mut rx) = mpsc::channel(phase1.hosts.len().max(1));
        for (ring, observer) in phase1.hosts.iter().enumerate() {
            let message = JoinMessage {
                sender: local.clone(),
                node_id,
                ring_number: Some(ring as u32),
                configuration_id: Some(phase1.configuration_id),
                metadata: if self.metadata.is_empty() {
                    None
                } else {
                    Some(self.metadata.clone())
                },
            };
            let client = Arc::clone(client);
            let observer = observer.clone();
            let deadline = self.config.join.phase2_timeout;
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = client
                    .request(&observer, MembershipRequest::JoinPhase2(message), deadline)
                    .await;
                let _ = tx.send((observer, result)).await;
            });
        }
        drop(tx);

        let mut outstanding = phase1.hosts.len();
        while outstanding > 0 {
            let Some((observer, result)) = rx.recv().await else {
                break;
            };
            outstanding -= 1;
            match result {
                Ok(MembershipResponse::Join(response)) => match response.status {
                    JoinStatusCode::SafeToJoin
                        if response.configuration_id != phase1.configuration_id =>
                    {
                        return Phase2Outcome::Admitted(response);
                    }
                    JoinStatusCode::MembershipRejected => {
                        return Phase2Outcome::Rejected(observer);
                    }
                    status => {
                        debug!(%observer, ?status, "phase 2 response without admission");
                    }
                },
                Ok(other) => debug!(%observer, "unexpected phase 2 response: {other:?}"),
                Err(err) => debug!(%observer, "phase 2 request failed: {err}"),
            }
        }
        Phase2Outcome::Retry
    }

    async fn bind_transport(
        &self,
        shutdown: &watch::Receiver<bool>,
        tasks: &mut Vec<JoinHandle<()>>,
    ) -> Result<(TransportBinding, Arc<dyn MessagingClient>, Endpoint), MembershipError> {
        match &self.transport {
            TransportMode::Udp => {
                let transport = UdpTransport::bind(&self.listen).await?;
                let local = transport.local_endpoint()?;
                tasks.push(transport.spawn_receiver(shutdown.clone()));
                let client: Arc<dyn MessagingClient> = Arc::clone(&transport) as Arc<dyn MessagingClient>;
                Ok((TransportBinding::Udp(transport), client, local))
            }
            TransportMode::InProcess(network) => {
                let client: Arc<dyn MessagingClient> = Arc::new(network.client());
                Ok((
                    TransportBinding::InProcess {
                        network: Arc::clone(network),
                        listen: self.listen.clone(),
                    },
                    client,
                    self.listen.clone(),
                ))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        self,
        local: Endpoint,
        view: MembershipView,
        client: Arc<dyn MessagingClient>,
        binding: TransportBinding,
        shutdown_tx: watch::Sender<bool>,
        shutdown_rx: watch::Receiver<bool>,
        mut tasks: Vec<JoinHandle<()>>,
    ) -> Result<Cluster, MembershipError> {
        let detector = self.detector.unwrap_or_else(|| {
            Arc::new(PingPongDetector::new(
                local.clone(),
                self.config.failure_detector.probe_failure_threshold,
            ))
        });
        let broadcaster = Arc::new(UnicastToAllBroadcaster::new(
            Arc::clone(&client),
            self.config.rpc_timeout,
        ));
        let service = MembershipService::new(
            local,
            self.metadata,
            self.config.clone(),
            view,
            Arc::clone(&detector),
            broadcaster,
            self.log_proposals,
        )?;
        binding.install(Arc::clone(&service));

        let (failed_tx, mut failed_rx) = mpsc::channel(64);
        let runner = FailureDetectorRunner::new(
            detector,
            client,
            self.config.failure_detector.clone(),
            self.config.rpc_timeout,
        );
        tasks.push(runner.spawn(service.subjects_receiver(), failed_tx, shutdown_rx));

        let failure_sink = Arc::clone(&service);
        tasks.push(tokio::spawn(async move {
            while let Some(subject) = failed_rx.recv().await {
                failure_sink.on_link_failed(subject).await;
            }
        }));

        Ok(Cluster {
            service,
            binding,
            shutdown_tx,
            tasks,
        })
    }
}

enum Phase2Outcome {
    Admitted(JoinResponse),
    Rejected(Endpoint),
    Retry,
}

/// A running cluster member: the public API of this crate.
pub struct Cluster {
    service: Arc<MembershipService>,
    binding: TransportBinding,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Cluster {
    /// Starts building a member that will answer on `listen`.
    #[must_use]
    pub fn builder(listen: Endpoint) -> ClusterBuilder {
        ClusterBuilder::new(listen)
    }

    /// Endpoint this member answers on (resolves port-0 binds).
    #[must_use]
    pub fn local_endpoint(&self) -> Endpoint {
        self.service.local_endpoint().clone()
    }

    /// Ordered snapshot of the current membership.
    #[must_use]
    pub fn member_list(&self) -> Vec<Endpoint> {
        self.service.member_list()
    }

    /// Identity of the current configuration.
    #[must_use]
    pub fn configuration_id(&self) -> ConfigurationId {
        self.service.configuration_id()
    }

    /// Registers a callback for view-change events.
    pub fn register_subscription(&self, event: ClusterEvent, subscriber: Subscriber) {
        self.service.register_subscription(event, subscriber);
    }

    /// Delivered proposal batches, when proposal logging was enabled.
    #[must_use]
    pub fn proposal_log(&self) -> Vec<Vec<Endpoint>> {
        self.service.proposal_log()
    }

    /// Application tags recorded for a member, when known locally.
    #[must_use]
    pub fn metadata_of(&self, endpoint: &Endpoint) -> Option<Metadata> {
        self.service.metadata_of(endpoint)
    }

    /// Graceful teardown: stops the failure detector tick and the transport
    /// loops, then waits for the background tasks to drain.
    pub async fn shutdown(mut self) {
        debug!(local = %self.service.local_endpoint(), "shutting down");
        let _ = self.shutdown_tx.send(true);
        self.binding.teardown();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{oneshot, watch};
use tokio::time;
use tracing::{debug, error, info, trace, warn};

use crate::broadcast::Broadcaster;
use crate::config::MembershipConfig;
use crate::configuration::{Configuration, ConfigurationId};
use crate::detector::LinkFailureDetector;
use crate::endpoint::{Endpoint, Metadata, NodeId};
use crate::error::MembershipError;
use crate::messages::{
    JoinMessage, JoinResponse, JoinStatusCode, LinkStatus, LinkUpdateMessage, MembershipRequest,
    MembershipResponse,
};
use crate::transport::RequestHandler;
use crate::view::MembershipView;
use crate::watermark::WatermarkBuffer;

/// Cluster events applications can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterEvent {
    /// A stable batch was delivered, before it was applied to the view.
    ViewChangeProposal,
    /// A new view was installed; the payload carries every delta.
    ViewChange,
    /// Members admitted by the latest view change.
    NodeAdded,
    /// Members removed by the latest view change.
    NodeRemoved,
}

/// One membership delta inside a view-change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatusChange {
    /// Affected member.
    pub endpoint: Endpoint,
    /// `Up` for admissions, `Down` for removals.
    pub status: LinkStatus,
}

/// Callback registered for a [`ClusterEvent`].
pub type Subscriber = Arc<dyn Fn(&[NodeStatusChange]) + Send + Sync>;

struct PendingJoin {
    node_id: NodeId,
    metadata: Option<Metadata>,
    responders: Vec<oneshot::Sender<JoinResponse>>,
}

struct ServiceState {
    view: MembershipView,
    configuration: Configuration,
    // Dedup of (observer, subject, ring) within the current configuration.
    seen_reports: HashSet<(Endpoint, Endpoint, u32)>,
    // Identities of joiners mid-admission; on phase-2 observers the entry
    // also carries parked responders.
    pending_joins: HashMap<Endpoint, PendingJoin>,
    // The local node's (ring, subject) monitoring duties in this view.
    subject_rings: Vec<(u32, Endpoint)>,
    metadata_map: HashMap<Endpoint, Metadata>,
}

// Effects computed under the state lock and applied after it is released:
// callbacks, join settlements, and broadcaster membership never run inside
// the critical section.
struct CommitOutcome {
    proposal: Vec<NodeStatusChange>,
    added: Vec<NodeStatusChange>,
    removed: Vec<NodeStatusChange>,
    members: Vec<Endpoint>,
    settlements: Vec<(oneshot::Sender<JoinResponse>, JoinResponse)>,
    configuration_id: ConfigurationId,
}

/// The component hub of one cluster member.
///
/// Owns the membership view, the watermark buffer, the pending-join table
/// and the subscriber registry; receives link updates and join requests
/// from the transport and turns stable watermark batches into atomic view
/// changes.
pub struct MembershipService {
    local: Endpoint,
    config: MembershipConfig,
    detector: Arc<dyn LinkFailureDetector>,
    broadcaster: Arc<dyn Broadcaster>,
    watermark: WatermarkBuffer,
    state: Mutex<ServiceState>,
    subscribers: RwLock<HashMap<ClusterEvent, Vec<Subscriber>>>,
    subjects_tx: watch::Sender<Vec<Endpoint>>,
    log_proposals: bool,
    proposal_log: Mutex<Vec<Vec<Endpoint>>>,
}

impl MembershipService {
    /// Creates a service around an initial view.
    ///
    /// The view must already contain the local node; bootstrap callers seed
    /// it with a single member, joiners with the full membership learned in
    /// phase 2.
    pub fn new(
        local: Endpoint,
        metadata: Metadata,
        config: MembershipConfig,
        mut view: MembershipView,
        detector: Arc<dyn LinkFailureDetector>,
        broadcaster: Arc<dyn Broadcaster>,
        log_proposals: bool,
    ) -> Result<Arc<Self>, MembershipError> {
        config.validate()?;
        if !view.is_host_present(&local) {
            return Err(MembershipError::NodeNotInRing(local));
        }
        let watermark = WatermarkBuffer::new(config.k, config.h, config.l)?;

        let mut configuration = Configuration::new();
        let initial_ids: Vec<NodeId> = view.member_identifiers().iter().map(|(_, id)| *id).collect();
        configuration.record(initial_ids);

        let mut metadata_map = HashMap::new();
        if !metadata.is_empty() {
            metadata_map.insert(local.clone(), metadata);
        }

        let subject_rings = view.subjects_of(&local)?;
        let members = view.members();
        let (subjects_tx, _) = watch::channel(Vec::new());

        let service = Arc::new(Self {
            local,
            config,
            detector,
            broadcaster: Arc::clone(&broadcaster),
            watermark,
            state: Mutex::new(ServiceState {
                view,
                configuration,
                seen_reports: HashSet::new(),
                pending_joins: HashMap::new(),
                subject_rings,
                metadata_map,
            }),
            subscribers: RwLock::new(HashMap::new()),
            subjects_tx,
            log_proposals,
            proposal_log: Mutex::new(Vec::new()),
        });
        service.publish_subjects(&service.state.lock());
        broadcaster.set_membership(members);
        Ok(service)
    }

    /// The endpoint this service answers for.
    #[must_use]
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    /// Ordered snapshot of the current membership.
    #[must_use]
    pub fn member_list(&self) -> Vec<Endpoint> {
        self.state.lock().view.members()
    }

    /// Identity of the current configuration.
    #[must_use]
    pub fn configuration_id(&self) -> ConfigurationId {
        self.state.lock().view.configuration_id()
    }

    /// Digest history for remote configuration comparison.
    #[must_use]
    pub fn configuration_history(&self) -> Vec<ConfigurationId> {
        self.state.lock().configuration.history().to_vec()
    }

    /// Application tags recorded for a member, when known locally.
    #[must_use]
    pub fn metadata_of(&self, endpoint: &Endpoint) -> Option<Metadata> {
        self.state.lock().metadata_map.get(endpoint).cloned()
    }

    /// Delivered proposal batches; populated only when proposal logging was
    /// requested at construction.
    #[must_use]
    pub fn proposal_log(&self) -> Vec<Vec<Endpoint>> {
        self.proposal_log.lock().clone()
    }

    /// Subject-set feed for the failure detector runner.
    #[must_use]
    pub fn subjects_receiver(&self) -> watch::Receiver<Vec<Endpoint>> {
        self.subjects_tx.subscribe()
    }

    /// Registers a callback for a cluster event. Callbacks fire
    /// synchronously after a commit, outside the service's critical
    /// section, in registration order.
    pub fn register_subscription(&self, event: ClusterEvent, subscriber: Subscriber) {
        self.subscribers
            .write()
            .entry(event)
            .or_default()
            .push(subscriber);
    }

    /// Ingests one link-status report.
    ///
    /// Reports tagged with a stale or future configuration are silently
    /// dropped, duplicates per (observer, subject, ring) are absorbed, and
    /// a non-empty watermark batch commits a view change before returning.
    pub async fn handle_link_update(
        &self,
        msg: LinkUpdateMessage,
    ) -> Result<(), MembershipError> {
        let outcome = {
            let mut state = self.state.lock();
            let current = state.view.configuration_id();
            if msg.configuration_id != current {
                debug!(
                    subject = %msg.link_dst,
                    reported = %msg.configuration_id,
                    current = %current,
                    "dropping link update for another configuration"
                );
                return Ok(());
            }
            let key = (msg.link_src.clone(), msg.link_dst.clone(), msg.ring_number);
            if !state.seen_reports.insert(key) {
                trace!(subject = %msg.link_dst, ring = msg.ring_number, "duplicate report");
                return Ok(());
            }
            if msg.status == LinkStatus::Up
                && let Some(node_id) = msg.node_id
            {
                state
                    .pending_joins
                    .entry(msg.link_dst.clone())
                    .or_insert_with(|| PendingJoin {
                        node_id,
                        metadata: msg.metadata.clone(),
                        responders: Vec::new(),
                    });
            }

            let batch = self.watermark.receive(&msg)?;
            if batch.is_empty() {
                return Ok(());
            }
            Some(self.commit_view_change(&mut state, batch))
        };

        if let Some(outcome) = outcome {
            self.apply_commit_effects(outcome);
        }
        Ok(())
    }

    /// Join phase 1: validates the joiner's identity against the current
    /// configuration and, when safe, names its K future observers. Never
    /// mutates state.
    #[must_use]
    pub fn handle_join_phase1(&self, msg: &JoinMessage) -> JoinResponse {
        let mut state = self.state.lock();
        let configuration_id = state.view.configuration_id();

        let status = if state.view.is_identifier_present(&msg.node_id) {
            JoinStatusCode::UuidAlreadyInRing
        } else if state.view.is_host_present(&msg.sender) {
            JoinStatusCode::HostnameAlreadyInRing
        } else {
            JoinStatusCode::SafeToJoin
        };
        debug!(joiner = %msg.sender, ?status, "join phase 1");

        let (hosts, identifiers) = match status {
            JoinStatusCode::SafeToJoin => {
                match state.view.expected_observers_of(&msg.sender) {
                    Ok(observers) => (observers, Vec::new()),
                    Err(err) => {
                        error!(joiner = %msg.sender, "observer computation failed: {err}");
                        return self.membership_rejected(configuration_id);
                    }
                }
            }
            // Conflicting joins get the full configuration so the joiner
            // can reconcile instead of spinning on retries.
            _ => split_members(state.view.member_identifiers()),
        };

        JoinResponse {
            sender: self.local.clone(),
            status,
            configuration_id,
            hosts,
            identifiers,
        }
    }

    /// Join phase 2: admits a joiner under the configuration it saw in
    /// phase 1.
    ///
    /// On a configuration mismatch the up-to-date membership is returned
    /// immediately. Otherwise the joiner's Up report is broadcast on this
    /// observer's ring and the response parks until the joiner lands in a
    /// committed view; expiry of the parked wait surfaces as a timeout,
    /// which the transport translates into silence.
    pub async fn handle_join_phase2(
        &self,
        msg: JoinMessage,
    ) -> Result<JoinResponse, MembershipError> {
        let ring_number = msg.ring_number.unwrap_or(0);
        let (admission, update) = {
            let mut state = self.state.lock();
            let current = state.view.configuration_id();
            if msg.configuration_id != Some(current) {
                info!(
                    joiner = %msg.sender,
                    phase1 = ?msg.configuration_id,
                    current = %current,
                    "join phase 2 under a changed configuration"
                );
                let (hosts, identifiers) = split_members(state.view.member_identifiers());
                return Ok(JoinResponse {
                    sender: self.local.clone(),
                    status: JoinStatusCode::ConfigChanged,
                    configuration_id: current,
                    hosts,
                    identifiers,
                });
            }

            let (tx, rx) = oneshot::channel();
            let pending = state
                .pending_joins
                .entry(msg.sender.clone())
                .or_insert_with(|| PendingJoin {
                    node_id: msg.node_id,
                    metadata: msg.metadata.clone(),
                    responders: Vec::new(),
                });
            pending.responders.push(tx);

            let update = LinkUpdateMessage {
                sender: self.local.clone(),
                link_src: self.local.clone(),
                link_dst: msg.sender.clone(),
                status: LinkStatus::Up,
                ring_number,
                configuration_id: current,
                node_id: Some(msg.node_id),
                metadata: msg.metadata.clone(),
            };
            (rx, update)
        };

        self.broadcaster
            .broadcast(MembershipRequest::LinkUpdate(update))
            .await;

        match time::timeout(self.config.join.phase2_timeout, admission).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(MembershipError::ShuttingDown),
            Err(_) => {
                debug!(joiner = %msg.sender, ring = ring_number, "join admission expired");
                Err(MembershipError::Timeout("join phase 2"))
            }
        }
    }

    /// Reaction to the failure detector declaring a subject's link failed:
    /// one Down report per ring on which this node observes the subject,
    /// fanned out through the broadcaster.
    pub async fn on_link_failed(&self, subject: Endpoint) {
        let updates = {
            let mut state = self.state.lock();
            if !state.view.is_host_present(&subject) {
                return;
            }
            let configuration_id = state.view.configuration_id();
            let local = self.local.clone();
            state
                .subject_rings
                .iter()
                .filter(|(_, endpoint)| *endpoint == subject)
                .map(|(ring, _)| LinkUpdateMessage {
                    sender: local.clone(),
                    link_src: local.clone(),
                    link_dst: subject.clone(),
                    status: LinkStatus::Down,
                    ring_number: *ring,
                    configuration_id,
                    node_id: None,
                    metadata: None,
                })
                .collect::<Vec<_>>()
        };
        if updates.is_empty() {
            return;
        }
        warn!(%subject, reports = updates.len(), "reporting failed link");
        for update in updates {
            self.broadcaster
                .broadcast(MembershipRequest::LinkUpdate(update))
                .await;
        }
    }

    fn commit_view_change(
        &self,
        state: &mut ServiceState,
        batch: Vec<Endpoint>,
    ) -> CommitOutcome {
        let proposal: Vec<NodeStatusChange> = batch
            .iter()
            .map(|endpoint| NodeStatusChange {
                endpoint: endpoint.clone(),
                status: if state.view.is_host_present(endpoint) {
                    LinkStatus::Down
                } else {
                    LinkStatus::Up
                },
            })
            .collect();
        if self.log_proposals {
            self.proposal_log.lock().push(batch.clone());
        }

        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut operations: Vec<NodeId> = Vec::new();
        let mut rejected: Vec<Endpoint> = Vec::new();

        for subject in batch {
            if state.view.is_host_present(&subject) {
                if let Some(node_id) = state.view.remove(&subject) {
                    state.metadata_map.remove(&subject);
                    operations.push(node_id);
                    removed.push(NodeStatusChange {
                        endpoint: subject,
                        status: LinkStatus::Down,
                    });
                }
            } else if let Some(pending) = state.pending_joins.get(&subject) {
                let node_id = pending.node_id;
                let metadata = pending.metadata.clone();
                match state.view.add(subject.clone(), node_id) {
                    Ok(()) => {
                        if let Some(metadata) = metadata {
                            state.metadata_map.insert(subject.clone(), metadata);
                        }
                        operations.push(node_id);
                        added.push(NodeStatusChange {
                            endpoint: subject,
                            status: LinkStatus::Up,
                        });
                    }
                    Err(err) => {
                        warn!(joiner = %subject, "batch admission rejected: {err}");
                        rejected.push(subject);
                    }
                }
            } else {
                // A subject reported Up by enough observers without any
                // phase-2 identity reaching us. Nothing can be applied.
                warn!(%subject, "stable batch entry with no identity, skipping");
            }
        }

        let configuration_id = state.view.configuration_id();
        if !operations.is_empty() {
            state.configuration.record(operations);
        }
        self.watermark.clear();
        state.seen_reports.clear();
        self.refresh_subjects(state);

        let (hosts, identifiers) = split_members(state.view.member_identifiers());
        let mut settlements = Vec::new();
        for (joiner, pending) in state.pending_joins.drain() {
            let status = if state.view.is_host_present(&joiner) {
                JoinStatusCode::SafeToJoin
            } else if rejected.contains(&joiner) {
                JoinStatusCode::MembershipRejected
            } else {
                JoinStatusCode::ConfigChanged
            };
            for responder in pending.responders {
                settlements.push((
                    responder,
                    JoinResponse {
                        sender: self.local.clone(),
                        status,
                        configuration_id,
                        hosts: hosts.clone(),
                        identifiers: identifiers.clone(),
                    },
                ));
            }
        }

        info!(
            %configuration_id,
            members = hosts.len(),
            added = added.len(),
            removed = removed.len(),
            "view change committed"
        );

        CommitOutcome {
            proposal,
            added,
            removed,
            members: hosts,
            settlements,
            configuration_id,
        }
    }

    fn apply_commit_effects(&self, outcome: CommitOutcome) {
        self.broadcaster.set_membership(outcome.members);

        self.fire(ClusterEvent::ViewChangeProposal, &outcome.proposal);
        let mut all = outcome.added.clone();
        all.extend(outcome.removed.iter().cloned());
        self.fire(ClusterEvent::ViewChange, &all);
        self.fire(ClusterEvent::NodeAdded, &outcome.added);
        self.fire(ClusterEvent::NodeRemoved, &outcome.removed);

        for (responder, response) in outcome.settlements {
            // A receiver dropped past its deadline is the expired-join
            // case; nothing to do.
            let _ = responder.send(response);
        }
        trace!(configuration = %outcome.configuration_id, "commit effects applied");
    }

    fn fire(&self, event: ClusterEvent, changes: &[NodeStatusChange]) {
        if changes.is_empty() {
            return;
        }
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .read()
            .get(&event)
            .map(|list| list.to_vec())
            .unwrap_or_default();
        for subscriber in subscribers {
            subscriber(changes);
        }
    }

    fn refresh_subjects(&self, state: &mut ServiceState) {
        state.subject_rings = state.view.subjects_of(&self.local).unwrap_or_default();
        self.publish_subjects(state);
    }

    fn publish_subjects(&self, state: &ServiceState) {
        let mut distinct: Vec<Endpoint> = state
            .subject_rings
            .iter()
            .map(|(_, endpoint)| endpoint.clone())
            .filter(|endpoint| *endpoint != self.local)
            .collect();
        distinct.sort_unstable();
        distinct.dedup();
        self.subjects_tx.send_replace(distinct);
    }

    fn membership_rejected(&self, configuration_id: ConfigurationId) -> JoinResponse {
        JoinResponse {
            sender: self.local.clone(),
            status: JoinStatusCode::MembershipRejected,
            configuration_id,
            hosts: Vec::new(),
            identifiers: Vec::new(),
        }
    }
}

#[async_trait]
impl RequestHandler for MembershipService {
    async fn handle(
        &self,
        request: MembershipRequest,
    ) -> Result<MembershipResponse, MembershipError> {
        match request {
            MembershipRequest::JoinPhase1(msg) => {
                Ok(MembershipResponse::Join(self.handle_join_phase1(&msg)))
            }
            MembershipRequest::JoinPhase2(msg) => self
                .handle_join_phase2(msg)
                .await
                .map(MembershipResponse::Join),
            MembershipRequest::LinkUpdate(msg) => {
                if let Err(err) = self.handle_link_update(msg).await {
                    error!("link update failed: {err}");
                    return Err(err);
                }
                Ok(MembershipResponse::Ack)
            }
            MembershipRequest::Probe(msg) => Ok(MembershipResponse::Probe(
                self.detector.handle_probe(msg).await,
            )),
        }
    }
}

fn split_members(members: Vec<(Endpoint, NodeId)>) -> (Vec<Endpoint>, Vec<NodeId>) {
    members.into_iter().unzip()
}

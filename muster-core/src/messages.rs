use serde::{Deserialize, Serialize};

use crate::configuration::ConfigurationId;
use crate::endpoint::{Endpoint, Metadata, NodeId};

/// Verdict a member returns for a join request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinStatusCode {
    /// The joiner may proceed (phase 1), or has been admitted (phase 2).
    SafeToJoin,
    /// The configuration changed since the joiner's phase 1; the response
    /// carries the up-to-date membership so the joiner can retry.
    ConfigChanged,
    /// The identifier was already admitted in some configuration.
    UuidAlreadyInRing,
    /// The endpoint is already a member of the current configuration.
    HostnameAlreadyInRing,
    /// A member refused the join outright.
    MembershipRejected,
}

/// Join request, used by both bootstrap phases.
///
/// Phase 1 omits `ring_number` and `configuration_id`; phase 2 carries the
/// ring the receiving observer monitors the joiner on and the configuration
/// the joiner observed in phase 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinMessage {
    /// Endpoint of the joining node.
    pub sender: Endpoint,
    /// Identifier the joiner minted for itself.
    pub node_id: NodeId,
    /// Ring on which the receiving observer will monitor the joiner.
    pub ring_number: Option<u32>,
    /// Configuration the joiner learned in phase 1.
    pub configuration_id: Option<ConfigurationId>,
    /// Application tags to associate with the joiner.
    pub metadata: Option<Metadata>,
}

/// Response to either join phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    /// Endpoint of the responding member.
    pub sender: Endpoint,
    /// Verdict for this request.
    pub status: JoinStatusCode,
    /// Configuration the responder is currently in.
    pub configuration_id: ConfigurationId,
    /// Member endpoints. In phase 1 these are the joiner's future
    /// observers; elsewhere the full membership.
    pub hosts: Vec<Endpoint>,
    /// Member identifiers, aligned with the full membership.
    pub identifiers: Vec<NodeId>,
}

/// Reported liveness of a monitored link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkStatus {
    /// The subject is reachable (join admission path).
    Up,
    /// The subject's observer declared the link failed.
    Down,
}

/// Per-edge report an observer broadcasts about one of its subjects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkUpdateMessage {
    /// Member that produced the report.
    pub sender: Endpoint,
    /// Observer end of the link (always the sender in this protocol).
    pub link_src: Endpoint,
    /// Subject end of the link.
    pub link_dst: Endpoint,
    /// Reported status.
    pub status: LinkStatus,
    /// Ring on which the observer monitors the subject.
    pub ring_number: u32,
    /// Configuration the report applies to; receivers drop mismatches.
    pub configuration_id: ConfigurationId,
    /// Identifier of a joining subject (status `Up` only).
    pub node_id: Option<NodeId>,
    /// Application tags of a joining subject (status `Up` only).
    pub metadata: Option<Metadata>,
}

/// Probe request; the payload is owned by the failure detector plug-in and
/// opaque to the membership core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeMessage {
    /// Observer issuing the probe.
    pub sender: Endpoint,
    /// Detector-defined payload.
    pub payload: Vec<u8>,
}

/// Probe reply; payload semantics belong to the failure detector plug-in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResponse {
    /// Subject answering the probe.
    pub sender: Endpoint,
    /// Detector-defined payload.
    pub payload: Vec<u8>,
}

/// Request envelope for every RPC the membership service understands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MembershipRequest {
    /// Bootstrap phase 1, addressed to a seed.
    JoinPhase1(JoinMessage),
    /// Bootstrap phase 2, addressed to a future observer.
    JoinPhase2(JoinMessage),
    /// Broadcast link-status report.
    LinkUpdate(LinkUpdateMessage),
    /// Failure detector probe.
    Probe(ProbeMessage),
}

/// Response envelope paired with [`MembershipRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MembershipResponse {
    /// Response to either join phase.
    Join(JoinResponse),
    /// Response to a probe.
    Probe(ProbeResponse),
    /// Bare acknowledgement (link updates).
    Ack,
}

//! Scalable distributed membership with multi-observer failure detection.
//!
//! Every member is watched by K observers drawn from K independent hash
//! rings over the member set. Observers broadcast per-edge link reports;
//! each member aggregates them in a watermark buffer that withholds
//! delivery until correlated changes form one stable batch, then installs
//! the new view atomically and notifies subscribers. New nodes bind to the
//! current configuration through a two-phase join against their future
//! observers.

/// Dissemination contract for link reports and the unicast-to-all baseline.
pub mod broadcast;
/// Builder API, the joiner side of the bootstrap protocol, and teardown.
pub mod cluster;
/// Protocol tuning parameters and their validation.
pub mod config;
/// Configuration identity digests and history comparison.
pub mod configuration;
/// Link failure detector contract, the ping-pong default, and the periodic
/// runner.
pub mod detector;
/// Endpoints, node identifiers, and application metadata.
pub mod endpoint;
/// Error types surfaced by the protocol and by joins.
pub mod error;
/// Wire-level message schema.
pub mod messages;
/// The membership service: report aggregation, join admission, view
/// commits, and subscriptions.
pub mod service;
/// Messaging traits plus the UDP and in-process transports.
pub mod transport;
/// The membership view and its K observer rings.
pub mod view;
/// Watermark-buffered aggregation of link reports into stable batches.
pub mod watermark;

pub use broadcast::{Broadcaster, UnicastToAllBroadcaster};
pub use cluster::{Cluster, ClusterBuilder};
pub use config::{FailureDetectorConfig, JoinConfig, MembershipConfig};
pub use configuration::{Configuration, ConfigurationComparison, ConfigurationId};
pub use detector::{FailureDetectorRunner, LinkFailureDetector, PingPongDetector};
pub use endpoint::{Endpoint, Metadata, NodeId};
pub use error::{JoinError, MembershipError};
pub use messages::{
    JoinMessage, JoinResponse, JoinStatusCode, LinkStatus, LinkUpdateMessage, MembershipRequest,
    MembershipResponse, ProbeMessage, ProbeResponse,
};
pub use service::{ClusterEvent, MembershipService, NodeStatusChange, Subscriber};
pub use transport::{
    InProcessClient, InProcessNetwork, MessagingClient, RequestHandler, UdpTransport,
};
pub use view::MembershipView;
pub use watermark::WatermarkBuffer;

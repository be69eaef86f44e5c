use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::trace;

use crate::endpoint::Endpoint;
use crate::messages::MembershipRequest;
use crate::transport::MessagingClient;

/// Dissemination substrate for link-status reports and join traffic.
///
/// The membership core only requires the contract: deliver the request to
/// every current member, best effort. Delivery failures are the failure
/// detector's problem, not the broadcaster's.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Fans the request out to all current members, fire-and-forget.
    async fn broadcast(&self, request: MembershipRequest);

    /// Installs the recipient set; invoked on every view change.
    fn set_membership(&self, members: Vec<Endpoint>);
}

/// Baseline broadcaster that unicasts to every member, the local node
/// included (a member's own reports reach its watermark buffer through the
/// same path as everyone else's).
pub struct UnicastToAllBroadcaster {
    client: Arc<dyn MessagingClient>,
    deadline: Duration,
    members: RwLock<Vec<Endpoint>>,
}

impl UnicastToAllBroadcaster {
    /// Creates a broadcaster sending through `client` with the given
    /// per-recipient deadline.
    pub fn new(client: Arc<dyn MessagingClient>, deadline: Duration) -> Self {
        Self {
            client,
            deadline,
            members: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Broadcaster for UnicastToAllBroadcaster {
    async fn broadcast(&self, request: MembershipRequest) {
        let recipients = self.members.read().clone();
        for recipient in recipients {
            let client = Arc::clone(&self.client);
            let request = request.clone();
            let deadline = self.deadline;
            tokio::spawn(async move {
                if let Err(err) = client.request(&recipient, request, deadline).await {
                    trace!(%recipient, "broadcast delivery failed: {err}");
                }
            });
        }
    }

    fn set_membership(&self, members: Vec<Endpoint>) {
        *self.members.write() = members;
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace, warn};

use crate::endpoint::Endpoint;
use crate::error::MembershipError;
use crate::messages::{MembershipRequest, MembershipResponse};

/// Client half of the RPC collaborator the membership core depends on.
///
/// Every call carries an explicit deadline; expiry surfaces as
/// [`MembershipError::Timeout`], which the failure detector and the joiner
/// treat as link failure and retry triggers respectively.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Sends a request to `peer` and awaits its response within `deadline`.
    async fn request(
        &self,
        peer: &Endpoint,
        request: MembershipRequest,
        deadline: Duration,
    ) -> Result<MembershipResponse, MembershipError>;
}

/// Server-side hook a membership service installs on its transport.
///
/// Returning an error means the request is dropped without a response; the
/// remote's deadline does the rest. This is how expired join admissions are
/// silently abandoned.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handles one inbound request.
    async fn handle(
        &self,
        request: MembershipRequest,
    ) -> Result<MembershipResponse, MembershipError>;
}

const DEFAULT_MAX_PACKET_SIZE: usize = 1_400;

/// On-the-wire frame pairing requests with responses over a datagram
/// socket.
#[derive(Serialize, Deserialize)]
enum Frame {
    Request {
        correlation: u64,
        request: MembershipRequest,
    },
    Response {
        correlation: u64,
        response: MembershipResponse,
    },
}

/// Bincode-over-UDP transport with correlation-id request/response
/// matching.
///
/// Outbound requests park a oneshot responder keyed by correlation id; the
/// receive loop completes it when the matching response frame arrives.
/// Inbound requests are dispatched to the installed [`RequestHandler`] on a
/// spawned task so slow handlers (join phase 2 parks until a view commit)
/// never stall the socket.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    max_packet_size: usize,
    pending: DashMap<u64, oneshot::Sender<MembershipResponse>>,
    next_correlation: AtomicU64,
    handler: RwLock<Option<Arc<dyn RequestHandler>>>,
}

impl UdpTransport {
    /// Binds a UDP socket for membership traffic.
    pub async fn bind(listen: &Endpoint) -> Result<Arc<Self>, MembershipError> {
        let socket = UdpSocket::bind((listen.host.as_str(), listen.port)).await?;
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            pending: DashMap::new(),
            next_correlation: AtomicU64::new(0),
            handler: RwLock::new(None),
        }))
    }

    /// Endpoint the socket actually bound to (resolves port 0 binds).
    pub fn local_endpoint(&self) -> Result<Endpoint, MembershipError> {
        Ok(Endpoint::from_socket_addr(self.socket.local_addr()?))
    }

    /// Installs the inbound request handler. Requests arriving before a
    /// handler is installed are dropped.
    pub fn set_handler(&self, handler: Arc<dyn RequestHandler>) {
        *self.handler.write() = Some(handler);
    }

    /// Spawns the receive loop; it runs until `shutdown` flips.
    pub fn spawn_receiver(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; transport.max_packet_size];
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    received = transport.socket.recv_from(&mut buf) => {
                        match received {
                            Ok((len, from)) => transport.dispatch(&buf[..len], from).await,
                            Err(err) => warn!("udp recv error: {err}"),
                        }
                    }
                }
            }
        })
    }

    async fn dispatch(self: &Arc<Self>, payload: &[u8], from: std::net::SocketAddr) {
        let frame: Frame = match bincode::deserialize(payload) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%from, "dropping undecodable frame: {err}");
                return;
            }
        };
        match frame {
            Frame::Request {
                correlation,
                request,
            } => {
                let Some(handler) = self.handler.read().clone() else {
                    debug!(%from, "request arrived before a handler was installed");
                    return;
                };
                let transport = Arc::clone(self);
                tokio::spawn(async move {
                    match handler.handle(request).await {
                        Ok(response) => {
                            let frame = Frame::Response {
                                correlation,
                                response,
                            };
                            if let Err(err) = transport.send_frame(&frame, from).await {
                                debug!(%from, "failed to send response: {err}");
                            }
                        }
                        // Dropped without a response; the remote's deadline
                        // handles it.
                        Err(err) => trace!(%from, "request dropped: {err}"),
                    }
                });
            }
            Frame::Response {
                correlation,
                response,
            } => {
                if let Some((_, sender)) = self.pending.remove(&correlation) {
                    let _ = sender.send(response);
                } else {
                    trace!(correlation, "response arrived after its deadline");
                }
            }
        }
    }

    async fn send_frame(
        &self,
        frame: &Frame,
        to: std::net::SocketAddr,
    ) -> Result<(), MembershipError> {
        let payload = bincode::serialize(frame)
            .map_err(|err| MembershipError::Serialization(err.to_string()))?;
        if payload.len() > self.max_packet_size {
            return Err(MembershipError::MessageTooLarge(payload.len()));
        }
        self.socket.send_to(&payload, to).await?;
        Ok(())
    }

    async fn resolve(peer: &Endpoint) -> Result<std::net::SocketAddr, MembershipError> {
        let mut addrs = tokio::net::lookup_host((peer.host.as_str(), peer.port)).await?;
        addrs.next().ok_or_else(|| {
            MembershipError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address for {peer}"),
            ))
        })
    }
}

#[async_trait]
impl MessagingClient for UdpTransport {
    async fn request(
        &self,
        peer: &Endpoint,
        request: MembershipRequest,
        deadline: Duration,
    ) -> Result<MembershipResponse, MembershipError> {
        let correlation = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation, tx);

        let result = async {
            let addr = Self::resolve(peer).await?;
            self.send_frame(
                &Frame::Request {
                    correlation,
                    request,
                },
                addr,
            )
            .await?;
            match time::timeout(deadline, rx).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(_)) => Err(MembershipError::ShuttingDown),
                Err(_) => Err(MembershipError::Timeout("rpc")),
            }
        }
        .await;

        if result.is_err() {
            self.pending.remove(&correlation);
        }
        result
    }
}

/// In-process message fabric for tests and single-process demos: handlers
/// registered per endpoint, requests delivered without sockets.
#[derive(Default)]
pub struct InProcessNetwork {
    handlers: DashMap<Endpoint, Arc<dyn RequestHandler>>,
}

impl InProcessNetwork {
    /// Creates an empty fabric.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers the handler serving `endpoint`.
    pub fn register(&self, endpoint: Endpoint, handler: Arc<dyn RequestHandler>) {
        self.handlers.insert(endpoint, handler);
    }

    /// Removes an endpoint from the fabric, simulating a crashed node.
    pub fn deregister(&self, endpoint: &Endpoint) {
        self.handlers.remove(endpoint);
    }

    /// Creates a client that sends through this fabric.
    #[must_use]
    pub fn client(self: &Arc<Self>) -> InProcessClient {
        InProcessClient {
            network: Arc::clone(self),
        }
    }
}

/// [`MessagingClient`] over an [`InProcessNetwork`].
pub struct InProcessClient {
    network: Arc<InProcessNetwork>,
}

#[async_trait]
impl MessagingClient for InProcessClient {
    async fn request(
        &self,
        peer: &Endpoint,
        request: MembershipRequest,
        deadline: Duration,
    ) -> Result<MembershipResponse, MembershipError> {
        let handler = self
            .network
            .handlers
            .get(peer)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                MembershipError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("no handler registered for {peer}"),
                ))
            })?;
        match time::timeout(deadline, handler.handle(request)).await {
            Ok(result) => result,
            Err(_) => Err(MembershipError::Timeout("rpc")),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::messages::{ProbeMessage, ProbeResponse};

    struct EchoHandler {
        endpoint: Endpoint,
    }

    #[async_trait]
    impl RequestHandler for EchoHandler {
        async fn handle(
            &self,
            request: MembershipRequest,
        ) -> Result<MembershipResponse, MembershipError> {
            match request {
                MembershipRequest::Probe(probe) => Ok(MembershipResponse::Probe(ProbeResponse {
                    sender: self.endpoint.clone(),
                    payload: probe.payload,
                })),
                _ => Ok(MembershipResponse::Ack),
            }
        }
    }

    fn probe(from: &Endpoint) -> MembershipRequest {
        MembershipRequest::Probe(ProbeMessage {
            sender: from.clone(),
            payload: vec![42],
        })
    }

    #[tokio::test]
    async fn in_process_round_trip() {
        let network = InProcessNetwork::new();
        let server = Endpoint::new("127.0.0.1", 7000);
        network.register(
            server.clone(),
            Arc::new(EchoHandler {
                endpoint: server.clone(),
            }),
        );

        let client = network.client();
        let response = client
            .request(&server, probe(&server), Duration::from_secs(1))
            .await
            .unwrap();
        match response {
            MembershipResponse::Probe(probe) => assert_eq!(probe.payload, vec![42]),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn in_process_unreachable_peer_errors() {
        let network = InProcessNetwork::new();
        let client = network.client();
        let missing = Endpoint::new("127.0.0.1", 7001);
        let err = client
            .request(&missing, probe(&missing), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MembershipError::Io(_)));
    }

    #[tokio::test]
    async fn udp_round_trip() {
        let bind = Endpoint::new("127.0.0.1", 0);
        let server = UdpTransport::bind(&bind).await.unwrap();
        let server_endpoint = server.local_endpoint().unwrap();
        server.set_handler(Arc::new(EchoHandler {
            endpoint: server_endpoint.clone(),
        }));

        let client = UdpTransport::bind(&bind).await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server_task = server.spawn_receiver(shutdown_rx.clone());
        let client_task = client.spawn_receiver(shutdown_rx);

        let response = client
            .request(
                &server_endpoint,
                probe(&client.local_endpoint().unwrap()),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert!(matches!(response, MembershipResponse::Probe(_)));

        shutdown_tx.send(true).unwrap();
        let _ = server_task.await;
        let _ = client_task.await;
    }

    #[tokio::test]
    async fn udp_request_times_out_without_listener() {
        let client = UdpTransport::bind(&Endpoint::new("127.0.0.1", 0))
            .await
            .unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let _task = client.spawn_receiver(shutdown_rx);

        let silent = Endpoint::new("127.0.0.1", 1);
        let err = client
            .request(&silent, probe(&silent), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MembershipError::Timeout(_) | MembershipError::Io(_)
        ));
    }
}

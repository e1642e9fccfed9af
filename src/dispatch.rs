//! Protocol dispatch: the server side routing decoded requests into the
//! engine, and the client proxy translating engine calls into requests.
//!
//! The server stamps the observed remote address into every inbound
//! Accept*/Renew* request so a peer can never claim somebody else's
//! contact, and echoes that address back so the caller learns its
//! externally visible IP. A `GetNeighbourNodes` request with the keep-alive
//! flag turns its session into a long-lived subscription fed by the spatial
//! store's change listeners.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::node::{Node, NodeConnector, RemoteNode};
use crate::peer::{NetworkEndpoint, NodeDbEntry, NodeInfo, RelationType, ServiceProfile};
use crate::session::{RequestHandler, Session};
use crate::store::{ChangeListener, NeighbourFilter, SessionId, SpatialStore};
use crate::wire::{
    ClientRequest, ClientResponse, LocalServiceRequest, LocalServiceResponse, Message,
    NeighbourhoodChange, RelationAck, RemoteNodeRequest, RemoteNodeResponse, RequestBody,
    ResponseBody, WireNodeInfo,
};
use crate::GpsLocation;

// ---------------------------------------------------------------------------
// server side
// ---------------------------------------------------------------------------

/// Routes inbound requests to the engine's three facets.
pub struct Dispatcher {
    node: Arc<Node>,
}

impl Dispatcher {
    pub fn new(node: Arc<Node>) -> Arc<Self> {
        Arc::new(Self { node })
    }

    async fn dispatch(
        &self,
        session: &Arc<Session>,
        version: Vec<u32>,
        body: RequestBody,
    ) -> Result<ResponseBody> {
        if version.first() != Some(&1) {
            return Err(Error::Unsupported(
                "missing or unknown request version".into(),
            ));
        }
        match body {
            RequestBody::LocalService(request) => self
                .dispatch_local_service(session, request)
                .await
                .map(ResponseBody::LocalService),
            RequestBody::RemoteNode(request) => self
                .dispatch_remote_node(session, request)
                .await
                .map(ResponseBody::RemoteNode),
            RequestBody::Client(request) => self
                .dispatch_client(request)
                .await
                .map(ResponseBody::Client),
        }
    }

    async fn dispatch_local_service(
        &self,
        session: &Arc<Session>,
        request: LocalServiceRequest,
    ) -> Result<LocalServiceResponse> {
        match request {
            LocalServiceRequest::RegisterService {
                service_type,
                profile,
            } => {
                let profile = ServiceProfile::try_from(&profile)?;
                self.node.register_service(service_type, profile).await?;
                debug!(?service_type, "served RegisterService");
                Ok(LocalServiceResponse::RegisterService)
            }
            LocalServiceRequest::DeregisterService { service_type } => {
                self.node.deregister_service(service_type).await?;
                debug!(?service_type, "served DeregisterService");
                Ok(LocalServiceResponse::DeregisterService)
            }
            LocalServiceRequest::GetNeighbourNodes {
                keep_alive_and_send_updates,
            } => {
                let neighbours = self.node.get_neighbour_nodes_by_distance().await;
                debug!(
                    keep_alive = keep_alive_and_send_updates,
                    count = neighbours.len(),
                    "served GetNeighbourNodes"
                );
                if keep_alive_and_send_updates {
                    let listener = NeighbourhoodNotifier::new(session, self.node.store());
                    self.node.add_listener(listener);
                }
                Ok(LocalServiceResponse::GetNeighbourNodes {
                    nodes: neighbours.iter().map(WireNodeInfo::from).collect(),
                })
            }
            LocalServiceRequest::NeighbourhoodChanged { .. } => Err(Error::BadRequest(
                "NeighbourhoodChanged is a notification pushed to keep-alive \
                 subscribers, not a request this server accepts"
                    .into(),
            )),
        }
    }

    async fn dispatch_remote_node(
        &self,
        session: &Arc<Session>,
        request: RemoteNodeRequest,
    ) -> Result<RemoteNodeResponse> {
        match request {
            RemoteNodeRequest::AcceptColleague { requestor } => {
                let requestor = self.observed_requestor(session, &requestor)?;
                let result = self.node.accept_colleague(requestor).await;
                debug!(accepted = result.is_some(), "served AcceptColleague");
                Ok(RemoteNodeResponse::AcceptColleague(
                    self.relation_ack(session, result),
                ))
            }
            RemoteNodeRequest::RenewColleague { requestor } => {
                let requestor = self.observed_requestor(session, &requestor)?;
                let result = self.node.renew_colleague(requestor).await;
                debug!(accepted = result.is_some(), "served RenewColleague");
                Ok(RemoteNodeResponse::RenewColleague(
                    self.relation_ack(session, result),
                ))
            }
            RemoteNodeRequest::AcceptNeighbour { requestor } => {
                let requestor = self.observed_requestor(session, &requestor)?;
                let result = self.node.accept_neighbour(requestor).await;
                debug!(accepted = result.is_some(), "served AcceptNeighbour");
                Ok(RemoteNodeResponse::AcceptNeighbour(
                    self.relation_ack(session, result),
                ))
            }
            RemoteNodeRequest::RenewNeighbour { requestor } => {
                let requestor = self.observed_requestor(session, &requestor)?;
                let result = self.node.renew_neighbour(requestor).await;
                debug!(accepted = result.is_some(), "served RenewNeighbour");
                Ok(RemoteNodeResponse::RenewNeighbour(
                    self.relation_ack(session, result),
                ))
            }
            RemoteNodeRequest::GetNodeCount => {
                let count = self.node.get_node_count().await;
                debug!(count, "served GetNodeCount");
                Ok(RemoteNodeResponse::GetNodeCount {
                    node_count: count as u64,
                })
            }
            RemoteNodeRequest::GetRandomNodes {
                max_node_count,
                include_neighbours,
            } => {
                let nodes = self
                    .node
                    .get_random_nodes(
                        max_node_count as usize,
                        NeighbourFilter::from_include_flag(include_neighbours),
                    )
                    .await;
                debug!(count = nodes.len(), "served GetRandomNodes");
                Ok(RemoteNodeResponse::GetRandomNodes {
                    nodes: nodes.iter().map(WireNodeInfo::from).collect(),
                })
            }
            RemoteNodeRequest::GetClosestNodes {
                location,
                max_radius_km,
                max_node_count,
                include_neighbours,
            } => {
                let location = GpsLocation::try_from(location)?;
                let nodes = self
                    .node
                    .get_closest_nodes(
                        location,
                        max_radius_km,
                        max_node_count as usize,
                        NeighbourFilter::from_include_flag(include_neighbours),
                    )
                    .await;
                debug!(count = nodes.len(), "served GetClosestNodes");
                Ok(RemoteNodeResponse::GetClosestNodes {
                    nodes: nodes.iter().map(WireNodeInfo::from).collect(),
                })
            }
        }
    }

    async fn dispatch_client(&self, request: ClientRequest) -> Result<ClientResponse> {
        match request {
            ClientRequest::GetServices => {
                let services = self.node.get_services().await;
                debug!(count = services.len(), "served GetServices");
                Ok(ClientResponse::GetServices {
                    services: services
                        .iter()
                        .map(|(service_type, profile)| (*service_type, profile.into()))
                        .collect(),
                })
            }
            ClientRequest::GetNeighbourNodes => {
                let neighbours = self.node.get_neighbour_nodes_by_distance().await;
                debug!(count = neighbours.len(), "served GetNeighbourNodes");
                Ok(ClientResponse::GetNeighbourNodes {
                    nodes: neighbours.iter().map(WireNodeInfo::from).collect(),
                })
            }
            ClientRequest::GetClosestNodes {
                location,
                max_radius_km,
                max_node_count,
                include_neighbours,
            } => {
                let location = GpsLocation::try_from(location)?;
                let nodes = self
                    .node
                    .get_closest_nodes(
                        location,
                        max_radius_km,
                        max_node_count as usize,
                        NeighbourFilter::from_include_flag(include_neighbours),
                    )
                    .await;
                debug!(count = nodes.len(), "served GetClosestNodes");
                Ok(ClientResponse::GetClosestNodes {
                    nodes: nodes.iter().map(WireNodeInfo::from).collect(),
                })
            }
        }
    }

    /// Replace the requestor's claimed address with the one observed on the
    /// session, so relations always point at a reachable contact.
    fn observed_requestor(
        &self,
        session: &Arc<Session>,
        requestor: &WireNodeInfo,
    ) -> Result<NodeInfo> {
        let info = NodeInfo::try_from(requestor)?;
        info.with_observed_address(session.remote_address())
    }

    fn relation_ack(&self, session: &Arc<Session>, result: Option<NodeInfo>) -> RelationAck {
        RelationAck {
            accepted: result.is_some(),
            acceptor: result.as_ref().map(WireNodeInfo::from),
            remote_ip: Some(session.remote_address().to_owned()),
        }
    }
}

#[async_trait]
impl RequestHandler for Dispatcher {
    async fn handle(
        &self,
        session: &Arc<Session>,
        request_id: u32,
        version: Vec<u32>,
        body: RequestBody,
    ) -> Message {
        match self.dispatch(session, version, body).await {
            Ok(response) => Message::ok_response(request_id, response),
            Err(error) => {
                warn!(session = %session.id(), %error, "failed to serve request");
                Message::error_response(request_id, error.status(), error.to_string())
            }
        }
    }
}

/// Accept connections forever, wrapping each in a session served by the
/// node's dispatcher.
pub async fn serve(
    listener: TcpListener,
    node: Arc<Node>,
    request_timeout: std::time::Duration,
) -> Result<()> {
    let dispatcher = Dispatcher::new(node);
    loop {
        let (stream, remote) = listener.accept().await?;
        debug!(%remote, "connection accepted");
        match Session::from_stream(stream, request_timeout) {
            Ok((session, reader)) => {
                session.start_message_loop(reader, Arc::clone(&dispatcher) as Arc<dyn RequestHandler>);
            }
            Err(error) => warn!(%remote, %error, "failed to set up session"),
        }
    }
}

// ---------------------------------------------------------------------------
// keep-alive change notifications
// ---------------------------------------------------------------------------

/// Change listener pushing neighbourhood mutations down its session.
///
/// Holds only weak handles: the session dying deregisters the listener on
/// its next notification instead of keeping the connection alive forever.
pub struct NeighbourhoodNotifier {
    session: Weak<Session>,
    store: Weak<SpatialStore>,
    session_id: SessionId,
}

impl NeighbourhoodNotifier {
    pub fn new(session: &Arc<Session>, store: &Arc<SpatialStore>) -> Arc<Self> {
        Arc::new(Self {
            session: Arc::downgrade(session),
            store: Arc::downgrade(store),
            session_id: session.id().clone(),
        })
    }

    fn deregister(&self) {
        if let Some(store) = self.store.upgrade() {
            debug!(session = %self.session_id, "deregistering neighbourhood listener");
            store.listeners().remove(&self.session_id);
        }
    }

    async fn push(&self, change: NeighbourhoodChange) {
        let Some(session) = self.session.upgrade() else {
            self.deregister();
            return;
        };
        let message = Message::request(RequestBody::LocalService(
            LocalServiceRequest::NeighbourhoodChanged {
                changes: vec![change],
            },
        ));
        // Write the notification now; collect the subscriber's ack off the
        // mutation path.
        let pending = match session.post_request(message).await {
            Ok(pending) => pending,
            Err(error) => {
                warn!(session = %self.session_id, %error, "failed to push change notification");
                self.deregister();
                return;
            }
        };
        let store = self.store.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            if let Err(error) = session.await_response(pending).await {
                warn!(session = %session_id, %error, "keep-alive subscriber did not ack");
                if let Some(store) = store.upgrade() {
                    store.listeners().remove(&session_id);
                }
            }
        });
    }
}

#[async_trait]
impl ChangeListener for NeighbourhoodNotifier {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn added(&self, entry: &NodeDbEntry) {
        if entry.relation() == RelationType::Neighbour {
            self.push(NeighbourhoodChange::Added(WireNodeInfo::from(entry.info())))
                .await;
        }
    }

    async fn updated(&self, entry: &NodeDbEntry) {
        if entry.relation() == RelationType::Neighbour {
            self.push(NeighbourhoodChange::Updated(WireNodeInfo::from(
                entry.info(),
            )))
            .await;
        }
    }

    async fn removed(&self, entry: &NodeDbEntry) {
        if entry.relation() == RelationType::Neighbour {
            self.push(NeighbourhoodChange::Removed {
                node_id: entry.id().as_str().to_owned(),
            })
            .await;
        }
    }
}

// ---------------------------------------------------------------------------
// client side
// ---------------------------------------------------------------------------

/// Invoked with the externally visible address a remote acceptor reported.
pub type DetectedIpCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Handler installed on engine-initiated connections: acks pushed
/// notifications, refuses anything else.
struct ClientNotificationHandler;

#[async_trait]
impl RequestHandler for ClientNotificationHandler {
    async fn handle(
        &self,
        session: &Arc<Session>,
        request_id: u32,
        _version: Vec<u32>,
        body: RequestBody,
    ) -> Message {
        match body {
            RequestBody::LocalService(LocalServiceRequest::NeighbourhoodChanged { changes }) => {
                debug!(session = %session.id(), count = changes.len(), "acking neighbourhood change");
                Message::ok_response(
                    request_id,
                    ResponseBody::LocalService(LocalServiceResponse::NeighbourhoodChanged),
                )
            }
            _ => {
                let error = Error::BadRequest("unexpected request on a client connection".into());
                Message::error_response(request_id, error.status(), error.to_string())
            }
        }
    }
}

/// [`RemoteNode`] proxy speaking the wire protocol over one session.
pub struct RemoteNodeProxy {
    session: Arc<Session>,
    detected_ip_callback: Option<DetectedIpCallback>,
}

impl RemoteNodeProxy {
    pub fn new(session: Arc<Session>, detected_ip_callback: Option<DetectedIpCallback>) -> Self {
        Self {
            session,
            detected_ip_callback,
        }
    }

    /// Issue one remote-node request and peel the sub-response off the
    /// envelope, failing with `BadResponse` on anything unexpected.
    async fn call(&self, request: RemoteNodeRequest) -> Result<RemoteNodeResponse> {
        let message = Message::request(RequestBody::RemoteNode(request));
        let response = self.session.send_request(message).await?;
        match response {
            Message::Response {
                status: crate::wire::Status::Ok,
                body: Some(ResponseBody::RemoteNode(body)),
                ..
            } => Ok(body),
            Message::Response {
                status, details, ..
            } => Err(Error::BadResponse(format!(
                "request failed with status {:?}: {}",
                status, details
            ))),
            Message::Request { .. } => Err(Error::Internal(
                "send_request resolved to a request message".into(),
            )),
        }
    }

    fn relation_result(&self, ack: RelationAck) -> Result<Option<NodeInfo>> {
        if let (Some(callback), Some(address)) = (&self.detected_ip_callback, &ack.remote_ip) {
            callback(address.clone());
        }
        if !ack.accepted {
            return Ok(None);
        }
        let acceptor = ack
            .acceptor
            .as_ref()
            .ok_or_else(|| Error::BadResponse("accepted without acceptor info".into()))?;
        Ok(Some(NodeInfo::try_from(acceptor)?))
    }

    fn node_list(&self, nodes: Vec<WireNodeInfo>) -> Result<Vec<NodeInfo>> {
        nodes.iter().map(NodeInfo::try_from).collect()
    }
}

#[async_trait]
impl RemoteNode for RemoteNodeProxy {
    async fn get_node_count(&self) -> Result<usize> {
        match self.call(RemoteNodeRequest::GetNodeCount).await? {
            RemoteNodeResponse::GetNodeCount { node_count } => Ok(node_count as usize),
            other => Err(Error::BadResponse(format!(
                "expected GetNodeCount response, got {:?}",
                other
            ))),
        }
    }

    async fn get_random_nodes(
        &self,
        max_node_count: usize,
        filter: NeighbourFilter,
    ) -> Result<Vec<NodeInfo>> {
        let request = RemoteNodeRequest::GetRandomNodes {
            max_node_count: max_node_count as u32,
            include_neighbours: filter == NeighbourFilter::Included,
        };
        match self.call(request).await? {
            RemoteNodeResponse::GetRandomNodes { nodes } => self.node_list(nodes),
            other => Err(Error::BadResponse(format!(
                "expected GetRandomNodes response, got {:?}",
                other
            ))),
        }
    }

    async fn get_closest_nodes(
        &self,
        location: GpsLocation,
        max_radius_km: f64,
        max_node_count: usize,
        filter: NeighbourFilter,
    ) -> Result<Vec<NodeInfo>> {
        let request = RemoteNodeRequest::GetClosestNodes {
            location: location.into(),
            max_radius_km,
            max_node_count: max_node_count as u32,
            include_neighbours: filter == NeighbourFilter::Included,
        };
        match self.call(request).await? {
            RemoteNodeResponse::GetClosestNodes { nodes } => self.node_list(nodes),
            other => Err(Error::BadResponse(format!(
                "expected GetClosestNodes response, got {:?}",
                other
            ))),
        }
    }

    async fn accept_colleague(&self, requestor: NodeInfo) -> Result<Option<NodeInfo>> {
        let request = RemoteNodeRequest::AcceptColleague {
            requestor: WireNodeInfo::from(&requestor),
        };
        match self.call(request).await? {
            RemoteNodeResponse::AcceptColleague(ack) => self.relation_result(ack),
            other => Err(Error::BadResponse(format!(
                "expected AcceptColleague response, got {:?}",
                other
            ))),
        }
    }

    async fn renew_colleague(&self, requestor: NodeInfo) -> Result<Option<NodeInfo>> {
        let request = RemoteNodeRequest::RenewColleague {
            requestor: WireNodeInfo::from(&requestor),
        };
        match self.call(request).await? {
            RemoteNodeResponse::RenewColleague(ack) => self.relation_result(ack),
            other => Err(Error::BadResponse(format!(
                "expected RenewColleague response, got {:?}",
                other
            ))),
        }
    }

    async fn accept_neighbour(&self, requestor: NodeInfo) -> Result<Option<NodeInfo>> {
        let request = RemoteNodeRequest::AcceptNeighbour {
            requestor: WireNodeInfo::from(&requestor),
        };
        match self.call(request).await? {
            RemoteNodeResponse::AcceptNeighbour(ack) => self.relation_result(ack),
            other => Err(Error::BadResponse(format!(
                "expected AcceptNeighbour response, got {:?}",
                other
            ))),
        }
    }

    async fn renew_neighbour(&self, requestor: NodeInfo) -> Result<Option<NodeInfo>> {
        let request = RemoteNodeRequest::RenewNeighbour {
            requestor: WireNodeInfo::from(&requestor),
        };
        match self.call(request).await? {
            RemoteNodeResponse::RenewNeighbour(ack) => self.relation_result(ack),
            other => Err(Error::BadResponse(format!(
                "expected RenewNeighbour response, got {:?}",
                other
            ))),
        }
    }
}

/// Opens TCP sessions to remote nodes and wraps them in proxies.
pub struct TcpConnector {
    request_timeout: std::time::Duration,
    detected_ip_callback: std::sync::RwLock<Option<DetectedIpCallback>>,
}

impl TcpConnector {
    pub fn new(request_timeout: std::time::Duration) -> Arc<Self> {
        Arc::new(Self {
            request_timeout,
            detected_ip_callback: std::sync::RwLock::new(None),
        })
    }

    /// Install the callback fed with addresses remote acceptors observe us
    /// under. Set after engine construction to avoid an ownership cycle.
    pub fn set_detected_ip_callback(&self, callback: DetectedIpCallback) {
        let mut slot = self
            .detected_ip_callback
            .write()
            .expect("detected-ip callback lock poisoned");
        info!("callback for detecting the external IP address is set");
        *slot = Some(callback);
    }

    fn callback(&self) -> Option<DetectedIpCallback> {
        self.detected_ip_callback
            .read()
            .expect("detected-ip callback lock poisoned")
            .clone()
    }
}

#[async_trait]
impl NodeConnector for TcpConnector {
    async fn connect(&self, endpoint: &NetworkEndpoint) -> Result<Arc<dyn RemoteNode>> {
        debug!(%endpoint, "connecting");
        let (session, reader) = Session::connect(endpoint, self.request_timeout).await?;
        session.start_message_loop(reader, Arc::new(ClientNotificationHandler));
        Ok(Arc::new(RemoteNodeProxy::new(session, self.callback())))
    }
}

//! Per-connection session layer.
//!
//! A session wraps one TCP connection in a duplex framed message channel
//! and owns the table of in-flight requests. A single receive loop per
//! session demultiplexes inbound frames: responses complete their pending
//! slot by message id, requests (including server-pushed notifications) go
//! to the session's request handler, whose response reuses the inbound id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::peer::NetworkEndpoint;
use crate::store::SessionId;
use crate::wire::{self, Message, RequestBody, FRAME_HEADER_SIZE};

/// Read one framed message from the stream.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let body_len = wire::decode_frame_header(&header)?;
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;
    wire::decode_body(&body)
}

/// Write one framed message to the stream.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let frame = wire::encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Serves requests arriving on a session. The server installs the protocol
/// dispatcher here; clients install an ack-only handler for notifications.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(
        &self,
        session: &Arc<Session>,
        request_id: u32,
        version: Vec<u32>,
        body: RequestBody,
    ) -> Message;
}

/// A request that has been written to the wire and awaits its response.
pub struct PendingResponse {
    id: u32,
    receiver: oneshot::Receiver<Message>,
}

/// One live connection: framed channel plus pending-request table.
pub struct Session {
    id: SessionId,
    remote_address: String,
    request_timeout: Duration,
    writer: Mutex<OwnedWriteHalf>,
    next_message_id: AtomicU32,
    pending: Mutex<HashMap<u32, oneshot::Sender<Message>>>,
    closed: AtomicBool,
}

impl Session {
    /// Wrap an accepted or connected stream. Returns the session together
    /// with the read half to be handed to [`Session::start_message_loop`].
    pub fn from_stream(
        stream: TcpStream,
        request_timeout: Duration,
    ) -> Result<(Arc<Self>, OwnedReadHalf)> {
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let session = Arc::new(Self {
            id: format!("{}:{}", peer.ip(), peer.port()),
            remote_address: peer.ip().to_string(),
            request_timeout,
            writer: Mutex::new(writer),
            next_message_id: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        Ok((session, reader))
    }

    /// Resolve and connect to a remote endpoint.
    pub async fn connect(
        endpoint: &NetworkEndpoint,
        request_timeout: Duration,
    ) -> Result<(Arc<Self>, OwnedReadHalf)> {
        let connect = TcpStream::connect((endpoint.address(), endpoint.port()));
        let stream = tokio::time::timeout(request_timeout, connect)
            .await
            .map_err(|_| Error::Connection(format!("connect to {} timed out", endpoint)))?
            .map_err(|e| Error::Connection(format!("failed to connect to {}: {}", endpoint, e)))?;
        Self::from_stream(stream, request_timeout)
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Address of the remote side as observed on this connection.
    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Spawn the receive loop. Requests are served through the handler in
    /// arrival order; responses complete their pending slot. The loop ends
    /// on EOF, I/O error, protocol violation or explicit close.
    pub fn start_message_loop(
        self: &Arc<Self>,
        mut reader: OwnedReadHalf,
        handler: Arc<dyn RequestHandler>,
    ) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let message = match read_message(&mut reader).await {
                    Ok(message) => message,
                    Err(error) => {
                        if !session.is_closed() {
                            debug!(session = %session.id, %error, "message loop ended");
                        }
                        break;
                    }
                };
                match message {
                    Message::Request { id, version, body } => {
                        let response = handler.handle(&session, id, version, body).await;
                        if let Err(error) = session.send_message(&response).await {
                            debug!(session = %session.id, %error, "failed to send response");
                            break;
                        }
                    }
                    response @ Message::Response { .. } => {
                        if let Err(error) = session.response_arrived(response).await {
                            warn!(session = %session.id, %error, "closing session");
                            break;
                        }
                    }
                }
            }
            session.close().await;
        })
    }

    /// Write a message that carries its id already (responses, acks).
    pub async fn send_message(&self, message: &Message) -> Result<()> {
        if self.is_closed() {
            return Err(Error::BadState(format!(
                "session {} is already closed",
                self.id
            )));
        }
        let mut writer = self.writer.lock().await;
        write_message(&mut *writer, message).await
    }

    /// Assign the next message id to a request and write it, returning the
    /// pending slot to await. Fails with `BadState` on a closed session.
    pub async fn post_request(&self, message: Message) -> Result<PendingResponse> {
        let body = match message {
            Message::Request { body, .. } => body,
            Message::Response { .. } => {
                return Err(Error::Internal(
                    "attempt to post a non-request message".into(),
                ))
            }
        };
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id, sender);
        }
        let stamped = Message::Request {
            id,
            version: wire::PROTOCOL_VERSION.to_vec(),
            body,
        };
        if let Err(error) = self.send_message(&stamped).await {
            self.pending.lock().await.remove(&id);
            return Err(error);
        }
        Ok(PendingResponse { id, receiver })
    }

    /// Send a request and await its response within the session timeout.
    ///
    /// Exactly one of three things happens to the pending slot: the response
    /// fulfils it, the deadline removes it, or session closure breaks it.
    pub async fn send_request(&self, message: Message) -> Result<Message> {
        let pending = self.post_request(message).await?;
        self.await_response(pending).await
    }

    /// Await an already-posted request within the session timeout.
    pub async fn await_response(&self, pending: PendingResponse) -> Result<Message> {
        match tokio::time::timeout(self.request_timeout, pending.receiver).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::BrokenChannel),
            Err(_) => {
                // A response arriving after this point finds no slot and is
                // treated as a protocol violation by the receive loop.
                self.pending.lock().await.remove(&pending.id);
                Err(Error::Timeout)
            }
        }
    }

    async fn response_arrived(&self, response: Message) -> Result<()> {
        let id = response.id();
        let sender = {
            let mut pending = self.pending.lock().await;
            pending.remove(&id)
        };
        match sender {
            Some(sender) => {
                // The awaiter may have given up; dropping the response then
                // is harmless.
                let _ = sender.send(response);
                Ok(())
            }
            None => Err(Error::ProtocolViolation(format!(
                "no pending request for response id {}",
                id
            ))),
        }
    }

    /// Stop the session: fail every pending request and shut the socket
    /// down. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the senders fails every awaiting receiver.
        self.pending.lock().await.clear();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        debug!(session = %self.id, "session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{ClientRequest, ClientResponse, ResponseBody, Status};
    use tokio::net::TcpListener;

    /// Handler answering every request with an empty GetServices response.
    struct EchoServices;

    #[async_trait]
    impl RequestHandler for EchoServices {
        async fn handle(
            &self,
            _session: &Arc<Session>,
            request_id: u32,
            _version: Vec<u32>,
            _body: RequestBody,
        ) -> Message {
            Message::ok_response(
                request_id,
                ResponseBody::Client(ClientResponse::GetServices { services: vec![] }),
            )
        }
    }

    /// Handler that never answers, for timeout tests.
    struct SilentHandler;

    #[async_trait]
    impl RequestHandler for SilentHandler {
        async fn handle(
            &self,
            _session: &Arc<Session>,
            request_id: u32,
            _version: Vec<u32>,
            _body: RequestBody,
        ) -> Message {
            // Sleep past any test deadline before answering.
            tokio::time::sleep(Duration::from_secs(120)).await;
            Message::error_response(request_id, Status::InternalError, "too late")
        }
    }

    async fn serve_one(
        listener: TcpListener,
        handler: Arc<dyn RequestHandler>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (session, reader) = Session::from_stream(stream, Duration::from_secs(60)).unwrap();
            session.start_message_loop(reader, handler).await.ok();
        })
    }

    fn endpoint_of(listener: &TcpListener) -> NetworkEndpoint {
        let addr = listener.local_addr().unwrap();
        NetworkEndpoint::new(addr.ip().to_string(), addr.port()).unwrap()
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = endpoint_of(&listener);
        serve_one(listener, Arc::new(EchoServices)).await;

        let (session, reader) = Session::connect(&endpoint, Duration::from_secs(5))
            .await
            .unwrap();
        session.start_message_loop(reader, Arc::new(EchoServices));

        let response = session
            .send_request(Message::request(RequestBody::Client(
                ClientRequest::GetServices,
            )))
            .await
            .unwrap();
        match response {
            Message::Response { status, body, .. } => {
                assert_eq!(status, Status::Ok);
                assert!(matches!(
                    body,
                    Some(ResponseBody::Client(ClientResponse::GetServices { .. }))
                ));
            }
            _ => panic!("expected a response"),
        }
    }

    #[tokio::test]
    async fn test_responses_are_matched_by_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = endpoint_of(&listener);
        serve_one(listener, Arc::new(EchoServices)).await;

        let (session, reader) = Session::connect(&endpoint, Duration::from_secs(5))
            .await
            .unwrap();
        session.start_message_loop(reader, Arc::new(EchoServices));

        // Issue several requests; every one must complete.
        for _ in 0..5 {
            let response = session
                .send_request(Message::request(RequestBody::Client(
                    ClientRequest::GetServices,
                )))
                .await
                .unwrap();
            assert!(matches!(response, Message::Response { .. }));
        }
    }

    #[tokio::test]
    async fn test_request_times_out_without_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = endpoint_of(&listener);
        serve_one(listener, Arc::new(SilentHandler)).await;

        let (session, reader) = Session::connect(&endpoint, Duration::from_millis(200))
            .await
            .unwrap();
        session.start_message_loop(reader, Arc::new(EchoServices));

        let result = session
            .send_request(Message::request(RequestBody::Client(
                ClientRequest::GetServices,
            )))
            .await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_pending_requests_break_on_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = endpoint_of(&listener);
        serve_one(listener, Arc::new(SilentHandler)).await;

        let (session, reader) = Session::connect(&endpoint, Duration::from_secs(60))
            .await
            .unwrap();
        session.start_message_loop(reader, Arc::new(EchoServices));

        let racer = Arc::clone(&session);
        let request = tokio::spawn(async move {
            racer
                .send_request(Message::request(RequestBody::Client(
                    ClientRequest::GetServices,
                )))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.close().await;

        let result = request.await.unwrap();
        assert!(matches!(result, Err(Error::BrokenChannel)));
        assert!(session.is_closed());

        // A closed session refuses further traffic.
        let result = session
            .post_request(Message::request(RequestBody::Client(
                ClientRequest::GetServices,
            )))
            .await;
        assert!(matches!(result, Err(Error::BadState(_))));
    }
}

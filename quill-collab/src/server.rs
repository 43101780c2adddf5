//! Connection Gateway: WebSocket server in front of the session registry.
//!
//! ```text
//! TCP ──► upgrade ──► Auth frame ──► AuthGate ──► SessionRegistry.acquire
//!                        │               │                  │
//!                  ProtocolError    AuthRejected       Authenticated
//!                  Close(1002)      Close(1008)        SyncStep2 (full state)
//!                                                      PeerJoined × existing
//!                                                           │
//!                                       peer loop: Update / SyncStep1 / Ping
//!                                                   ◄── session fan-out
//! ```
//!
//! One task per connection. Nothing touches the registry, the store or any
//! session until the credential has been verified.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use quill_core::{ReplicaTransform, XmlTreeTransform};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::auth::{select_credential, token_from_query, AuthGate, IdentityVerifier};
use crate::broadcast::Feed;
use crate::config::ServerConfig;
use crate::error::CollabError;
use crate::events::{CollabEvent, EventKind, EventSink, Events, LogSink, Outcome, ServerStats};
use crate::protocol::{validate_doc_id, MessageType, ProtocolError, SyncMessage, Welcome};
use crate::registry::SessionRegistry;
use crate::session::{JoinAck, PeerConnection, SessionError, SessionHandle};
use crate::storage::DocumentStore;

/// How long a client has to send its `Auth` frame after the upgrade.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReceiver = SplitStream<WebSocketStream<TcpStream>>;

/// The sync server.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    gate: AuthGate,
    registry: SessionRegistry,
    events: Events,
}

impl SyncServer {
    /// Server with the default transform, logging events.
    pub fn new(config: ServerConfig, verifier: Arc<dyn IdentityVerifier>, store: Arc<dyn DocumentStore>) -> Self {
        Self::with_parts(
            config,
            verifier,
            store,
            Arc::new(XmlTreeTransform::new()),
            Arc::new(LogSink),
        )
    }

    pub fn with_parts(
        config: ServerConfig,
        verifier: Arc<dyn IdentityVerifier>,
        store: Arc<dyn DocumentStore>,
        transform: Arc<dyn ReplicaTransform>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let events = Events::new(sink);
        let registry = SessionRegistry::new(store, transform, events.clone(), config.clone());
        Self {
            config,
            gate: AuthGate::new(verifier),
            registry,
            events,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn stats(&self) -> ServerStats {
        let mut stats = self.events.snapshot();
        stats.active_sessions = self.registry.session_count();
        stats
    }

    /// Bind `config.bind_addr` and serve until the task is dropped.
    pub async fn run(&self) -> Result<(), CollabError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept loop on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), CollabError> {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Flush and close every session.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), CollabError> {
        let mut query: Option<String> = None;
        let capture_query = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            query = req.uri().query().map(str::to_string);
            Ok(resp)
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, capture_query).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let hello = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_auth_frame(&mut ws_receiver)).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout),
        };
        let hello = match hello {
            Ok(hello) => hello,
            Err(e) => {
                log::warn!("Handshake from {addr} refused: {e}");
                close(&mut ws_sender, CloseCode::Protocol, &e.to_string()).await;
                return Ok(());
            }
        };
        let doc_id = hello.doc_id;

        let credential = select_credential(&hello.payload, token_from_query(query.as_deref()).as_deref());
        let ctx = match self.gate.authenticate(credential).await {
            Ok(ctx) => ctx,
            Err(e) => {
                log::warn!("Authentication for {doc_id} from {addr} failed: {e}");
                self.events.emit(
                    CollabEvent::new(EventKind::AuthFailure, Outcome::Failure(e.to_string())).document(doc_id.as_str()),
                );
                reject(&mut ws_sender, &doc_id, &e.to_string()).await;
                return Ok(());
            }
        };

        let peer_id = Uuid::new_v4();
        log::info!("Peer {peer_id} ({}) connected from {addr} to {doc_id}", ctx.user_id());
        self.events.emit(
            CollabEvent::new(EventKind::Connect, Outcome::Success)
                .document(doc_id.as_str())
                .peer(peer_id)
                .user(ctx.user_id()),
        );

        let result = self
            .serve_peer(&mut ws_sender, &mut ws_receiver, &doc_id, PeerConnection::new(peer_id, ctx.clone()))
            .await;

        let outcome = match &result {
            Ok(()) => Outcome::Success,
            Err(e) => Outcome::Failure(e.to_string()),
        };
        self.events.emit(
            CollabEvent::new(EventKind::Disconnect, outcome)
                .document(doc_id.as_str())
                .peer(peer_id)
                .user(ctx.user_id()),
        );
        log::info!("Peer {peer_id} disconnected from {doc_id}");
        result
    }

    /// Join the session, run the peer loop, and always release afterwards.
    async fn serve_peer(
        &self,
        ws_sender: &mut WsSender,
        ws_receiver: &mut WsReceiver,
        doc_id: &str,
        peer: PeerConnection,
    ) -> Result<(), CollabError> {
        let peer_id = peer.peer_id;
        let info = peer.info();

        let (session, ack) = match self.registry.acquire(doc_id, peer).await {
            Ok(joined) => joined,
            Err(SessionError::Forbidden(_)) => {
                reject(ws_sender, doc_id, "access denied").await;
                return Ok(());
            }
            Err(SessionError::ShuttingDown) => {
                close(ws_sender, CloseCode::Away, "server shutting down").await;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let welcome = Welcome {
            peer: info,
            degraded: ack.degraded,
        };
        let result = self.peer_loop(ws_sender, ws_receiver, &session, peer_id, welcome, ack).await;
        self.registry.release(doc_id, peer_id).await;
        result
    }

    async fn peer_loop(
        &self,
        ws_sender: &mut WsSender,
        ws_receiver: &mut WsReceiver,
        session: &SessionHandle,
        peer_id: Uuid,
        welcome: Welcome,
        ack: JoinAck,
    ) -> Result<(), CollabError> {
        let doc_id = session.document_id();
        let JoinAck {
            mut feed, state, peers, ..
        } = ack;

        send(ws_sender, &SyncMessage::authenticated(doc_id, &welcome)?).await?;
        send(ws_sender, &SyncMessage::sync_step2(doc_id, state)).await?;
        for existing in &peers {
            send(ws_sender, &SyncMessage::peer_joined(doc_id, existing)?).await?;
        }

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let data = match msg {
                        Some(Ok(Message::Binary(data))) => data,
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            log::debug!("Read from {peer_id} failed: {e}");
                            return Ok(());
                        }
                    };
                    self.events.record_message(data.len());

                    let msg = match SyncMessage::decode(&data) {
                        Ok(msg) => msg,
                        Err(e) => {
                            log::warn!("Undecodable frame from {peer_id}: {e}");
                            continue;
                        }
                    };

                    match msg.msg_type {
                        MessageType::Update => match session.apply_update(peer_id, msg.payload).await {
                            Ok(()) => {}
                            // The fragment is dropped; the peer can resync with SyncStep1.
                            Err(SessionError::Replica(_)) => {}
                            Err(e) => return Err(e.into()),
                        },
                        MessageType::SyncStep1 => match session.diff(msg.payload).await {
                            Ok(diff) => send(ws_sender, &SyncMessage::sync_step2(doc_id, diff)).await?,
                            Err(SessionError::Replica(e)) => {
                                log::warn!("Bad state vector from {peer_id}: {e}");
                            }
                            Err(e) => return Err(e.into()),
                        },
                        MessageType::Ping => send(ws_sender, &SyncMessage::pong(peer_id)).await?,
                        MessageType::Pong => {}
                        other => log::debug!("Ignoring {other:?} from {peer_id}"),
                    }
                }

                item = feed.next() => match item {
                    Feed::Message(bytes) => {
                        ws_sender.send(Message::Binary(bytes.to_vec().into())).await?;
                    }
                    Feed::Lagged(missed) => {
                        log::warn!("Peer {peer_id} lagged by {missed} messages, resending full state");
                        let state = session.encode_state().await?;
                        send(ws_sender, &SyncMessage::sync_step2(doc_id, state)).await?;
                    }
                    Feed::Closed => return Ok(()),
                },
            }
        }
    }
}

/// Wait for the `Auth` frame that must open every connection.
async fn read_auth_frame(ws_receiver: &mut WsReceiver) -> Result<SyncMessage, ProtocolError> {
    loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Binary(data))) => {
                let msg = SyncMessage::decode(&data)?;
                if msg.msg_type != MessageType::Auth {
                    return Err(ProtocolError::UnexpectedFirstFrame(msg.msg_type));
                }
                validate_doc_id(&msg.doc_id)?;
                return Ok(msg);
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return Err(ProtocolError::ConnectionClosed),
            Some(Ok(_)) => return Err(ProtocolError::NonBinaryFrame),
        }
    }
}

async fn send(ws_sender: &mut WsSender, msg: &SyncMessage) -> Result<(), CollabError> {
    ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
    Ok(())
}

/// Send `AuthRejected` followed by a policy-violation close.
async fn reject(ws_sender: &mut WsSender, doc_id: &str, reason: &str) {
    let _ = send(ws_sender, &SyncMessage::auth_rejected(doc_id, reason)).await;
    close(ws_sender, CloseCode::Policy, reason).await;
}

async fn close(ws_sender: &mut WsSender, code: CloseCode, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = ws_sender.send(Message::Close(Some(frame))).await;
    let _ = ws_sender.close().await;
}

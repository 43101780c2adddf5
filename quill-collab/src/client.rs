//! WebSocket client for the sync server.
//!
//! Keeps a local [`Replica`] in step with the server: the initial state and
//! every remote update are merged as they arrive, and local edits are applied
//! locally first, then sent as `Update` frames. Used by the integration tests
//! and as a reference for real clients.

use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::{SinkExt, StreamExt};
use quill_core::yrs::{TransactionMut, XmlFragmentRef};
use quill_core::{Replica, ReplicaError, ReplicaTransform, Representation, TransformError, XmlTreeTransform};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage, Welcome};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    Connect(#[from] tungstenite::Error),
    #[error("Rejected by server: {0}")]
    Rejected(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error("Connection closed")]
    Closed,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Full state or a requested diff was merged
    Synced,
    /// An update from another peer was merged
    RemoteUpdate { peer_id: Uuid },
    /// A peer joined the document
    PeerJoined(PeerInfo),
    /// A peer left the document
    PeerLeft(Uuid),
    Pong,
    /// Connection lost
    Disconnected,
}

/// A connected client editing one document.
pub struct CollabClient {
    doc_id: String,
    welcome: Welcome,
    replica: Arc<Mutex<Replica>>,
    outgoing_tx: mpsc::Sender<Message>,
    event_rx: mpsc::Receiver<ClientEvent>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

fn lock(replica: &Mutex<Replica>) -> MutexGuard<'_, Replica> {
    replica.lock().unwrap_or_else(|e| e.into_inner())
}

impl CollabClient {
    /// Connect to `url`, authenticate with `credential` and join `doc_id`.
    ///
    /// Returns once the server has accepted the handshake; the initial state
    /// follows as a [`ClientEvent::Synced`].
    pub async fn connect(url: &str, doc_id: &str, credential: &str) -> Result<Self, ClientError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let auth = SyncMessage::auth(doc_id, credential).encode()?;
        ws_writer.send(Message::Binary(auth.into())).await?;

        let reply = loop {
            match ws_reader.next().await {
                Some(Ok(Message::Binary(data))) => break SyncMessage::decode(&data)?,
                Some(Ok(Message::Close(_))) | None => return Err(ClientError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        };
        let welcome = match reply.msg_type {
            MessageType::Authenticated => reply.welcome()?,
            MessageType::AuthRejected => return Err(ClientError::Rejected(reply.text())),
            found => {
                return Err(ProtocolError::InvalidMessageType {
                    expected: MessageType::Authenticated,
                    found,
                }
                .into())
            }
        };
        log::debug!("Joined {doc_id} as peer {}", welcome.peer.peer_id);

        // Writer task: forward outgoing channel to WebSocket
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Message>(256);
        let writer = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: merge incoming state, surface events
        let replica = Arc::new(Mutex::new(Replica::new()));
        let (event_tx, event_rx) = mpsc::channel(256);
        let reader_replica = replica.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let data = match msg {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let msg = match SyncMessage::decode(&data) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("Undecodable frame from server: {e}");
                        continue;
                    }
                };
                if let Some(event) = apply_incoming(&reader_replica, msg) {
                    if event_tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(Self {
            doc_id: doc_id.to_string(),
            welcome,
            replica,
            outgoing_tx,
            event_rx,
            writer,
            reader,
        })
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn welcome(&self) -> &Welcome {
        &self.welcome
    }

    pub fn peer_id(&self) -> Uuid {
        self.welcome.peer.peer_id
    }

    /// Edit the local replica and send the resulting update.
    pub async fn edit<F>(&self, f: F) -> Result<(), ClientError>
    where
        F: FnOnce(&mut TransactionMut, &XmlFragmentRef),
    {
        let fragment = lock(&self.replica).edit(f);
        self.send(SyncMessage::update(self.peer_id(), self.doc_id.as_str(), fragment))
            .await
    }

    /// Send a raw update fragment without applying it locally.
    pub async fn send_update(&self, fragment: Vec<u8>) -> Result<(), ClientError> {
        self.send(SyncMessage::update(self.peer_id(), self.doc_id.as_str(), fragment))
            .await
    }

    /// Ask the server for whatever this replica is missing.
    pub async fn request_sync(&self) -> Result<(), ClientError> {
        let state_vector = lock(&self.replica).state_vector();
        self.send(SyncMessage::sync_step1(self.peer_id(), self.doc_id.as_str(), state_vector))
            .await
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.send(SyncMessage::ping(self.peer_id())).await
    }

    async fn send(&self, msg: SyncMessage) -> Result<(), ClientError> {
        let encoded = msg.encode()?;
        self.outgoing_tx
            .send(Message::Binary(encoded.into()))
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Next event, or `None` once the connection is gone and drained.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.event_rx.recv().await
    }

    pub fn state_vector(&self) -> Vec<u8> {
        lock(&self.replica).state_vector()
    }

    pub fn encode_state(&self) -> Vec<u8> {
        lock(&self.replica).encode_state()
    }

    /// Local replica rendered as a persisted document.
    pub fn representation(&self) -> Result<Representation, ClientError> {
        Ok(XmlTreeTransform::new().from_replica(&lock(&self.replica))?)
    }

    /// Close the connection and wait for the background tasks.
    pub async fn close(self) {
        let _ = self.outgoing_tx.send(Message::Close(None)).await;
        drop(self.outgoing_tx);
        let _ = self.writer.await;
        let _ = self.reader.await;
    }
}

fn apply_incoming(replica: &Mutex<Replica>, msg: SyncMessage) -> Option<ClientEvent> {
    match msg.msg_type {
        MessageType::SyncStep2 => match lock(replica).merge(&msg.payload) {
            Ok(()) => Some(ClientEvent::Synced),
            Err(e) => {
                log::warn!("Could not merge server state: {e}");
                None
            }
        },
        MessageType::Update => match lock(replica).merge(&msg.payload) {
            Ok(()) => Some(ClientEvent::RemoteUpdate { peer_id: msg.peer_id }),
            Err(e) => {
                log::warn!("Could not merge update from {}: {e}", msg.peer_id);
                None
            }
        },
        MessageType::PeerJoined => msg.peer_info().ok().map(ClientEvent::PeerJoined),
        MessageType::PeerLeft => Some(ClientEvent::PeerLeft(msg.peer_id)),
        MessageType::Pong => Some(ClientEvent::Pong),
        _ => None,
    }
}

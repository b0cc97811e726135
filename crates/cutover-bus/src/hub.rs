//! Connection hub - accepts clients and runs their read loops
//!
//! One `ConnHub` owns every live connection. Each accepted client gets a
//! UUID, a registry entry and a strictly sequential read loop that decodes a
//! frame, dispatches it and writes the response before reading the next
//! frame. Writes on a connection are serialized by a per-connection lock so
//! broadcast and unicast frames never interleave.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cutover_core::domain::newtypes::{ClientId, UserId};
use cutover_proto::codec::{read_frame, write_frame, ProtoError};
use cutover_proto::message::{AgentStarted, Envelope, MessageType};

use crate::dispatcher::Dispatcher;

/// Hub lifecycle events, for logging and the orchestrator's gate refresh
#[derive(Debug, Clone)]
pub enum HubEvent {
    /// A client connected and entered the registry
    ClientConnected {
        /// The new connection's id
        client_id: ClientId,
    },
    /// A client left the registry
    ClientDisconnected {
        /// The departed connection's id
        client_id: ClientId,
        /// The user bound to it, if a binding had happened
        user_id: Option<UserId>,
        /// Why the connection ended
        reason: String,
    },
}

/// One live connection
struct Connection {
    client_id: ClientId,
    user_id: std::sync::Mutex<Option<UserId>>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    connected_at: DateTime<Utc>,
    last_seen: std::sync::Mutex<DateTime<Utc>>,
    /// Cancelled to force this connection's read loop to end
    closing: CancellationToken,
}

impl Connection {
    fn touch(&self) {
        *self.last_seen.lock().unwrap() = Utc::now();
    }

    fn bound_user(&self) -> Option<UserId> {
        self.user_id.lock().unwrap().clone()
    }
}

/// Accepts local-socket clients, tracks connections, dispatches and broadcasts
pub struct ConnHub {
    dispatcher: Dispatcher,
    registry: DashMap<ClientId, Arc<Connection>>,
    user_index: DashMap<UserId, ClientId>,
    events_tx: broadcast::Sender<HubEvent>,
    shutdown: CancellationToken,
}

impl ConnHub {
    /// Create a hub over a fully registered dispatcher
    pub fn new(dispatcher: Dispatcher, shutdown: CancellationToken) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            dispatcher,
            registry: DashMap::new(),
            user_index: DashMap::new(),
            events_tx,
            shutdown,
        })
    }

    /// Bind the listening socket, replacing any stale socket file
    ///
    /// The socket is restricted to owner and group so only authenticated
    /// local users reach the service.
    pub fn bind(socket_path: &Path) -> std::io::Result<UnixListener> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(socket_path)?;

        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o660))?;

        info!(path = %socket_path.display(), "Message bus listening");
        Ok(listener)
    }

    /// Subscribe to hub events
    pub fn events(&self) -> broadcast::Receiver<HubEvent> {
        self.events_tx.subscribe()
    }

    /// Accept connections until the shutdown token fires
    ///
    /// On shutdown every remaining connection is closed with reason
    /// `"Server shutdown"`.
    pub async fn serve(self: &Arc<Self>, listener: UnixListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => self.accept(stream),
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                    }
                },
            }
        }

        info!("Hub stopping; closing all connections");
        self.close_all("Server shutdown").await;
    }

    fn accept(self: &Arc<Self>, stream: UnixStream) {
        let client_id = ClientId::new();
        let (read_half, write_half) = stream.into_split();

        let connection = Arc::new(Connection {
            client_id,
            user_id: std::sync::Mutex::new(None),
            writer: tokio::sync::Mutex::new(write_half),
            connected_at: Utc::now(),
            last_seen: std::sync::Mutex::new(Utc::now()),
            closing: CancellationToken::new(),
        });

        self.registry.insert(client_id, connection.clone());
        let _ = self.events_tx.send(HubEvent::ClientConnected { client_id });
        debug!(client_id = %client_id, "Client connected");

        let hub = Arc::clone(self);
        tokio::spawn(async move {
            hub.read_loop(connection, read_half).await;
        });
    }

    /// Strictly sequential read loop for one connection
    async fn read_loop(self: Arc<Self>, connection: Arc<Connection>, mut reader: OwnedReadHalf) {
        let client_id = connection.client_id;
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = connection.closing.cancelled() => return,
                frame = read_frame(&mut reader) => frame,
            };

            match frame {
                Ok(Some(envelope)) => {
                    connection.touch();
                    let outcome = self.dispatcher.dispatch(client_id, &envelope).await;

                    if outcome.success && envelope.message_type == MessageType::AgentStarted {
                        self.try_bind_user(&connection, &envelope).await;
                    }

                    if self.send_to(client_id, &outcome.response).await.is_err() {
                        // send_to already removed the connection.
                        return;
                    }
                }
                Ok(None) => {
                    self.disconnect(client_id, "client closed").await;
                    return;
                }
                Err(e) => {
                    let reason = match &e {
                        ProtoError::FrameTooLarge { .. }
                        | ProtoError::EmptyFrame
                        | ProtoError::UnknownType(_)
                        | ProtoError::Malformed(_) => format!("protocol violation: {e}"),
                        _ => format!("read failed: {e}"),
                    };
                    self.disconnect(client_id, &reason).await;
                    return;
                }
            }
        }
    }

    /// Bind the connection to the user named in a successful `AGENT_STARTED`
    ///
    /// Last-writer-wins: a second connection for an already-bound user takes
    /// over and the previous connection is closed.
    async fn try_bind_user(&self, connection: &Arc<Connection>, envelope: &Envelope) {
        let started: AgentStarted = match envelope.decode_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "AGENT_STARTED payload did not decode during binding");
                return;
            }
        };
        let user_id = match UserId::new(started.user_id) {
            Ok(u) => u,
            Err(e) => {
                warn!(error = %e, "AGENT_STARTED carried an invalid user id");
                return;
            }
        };

        *connection.user_id.lock().unwrap() = Some(user_id.clone());
        let previous = self.user_index.insert(user_id.clone(), connection.client_id);

        info!(client_id = %connection.client_id, user_id = %user_id, "User bound to connection");

        if let Some(previous) = previous {
            if previous != connection.client_id {
                debug!(
                    superseded = %previous,
                    user_id = %user_id,
                    "Second binding for user; closing previous connection"
                );
                self.disconnect(previous, "superseded by a newer agent connection")
                    .await;
            }
        }
    }

    /// Send one envelope to one connection
    ///
    /// A send failure disconnects the client with the failure as reason.
    pub async fn send_to(&self, client_id: ClientId, envelope: &Envelope) -> Result<(), ProtoError> {
        let Some(connection) = self.registry.get(&client_id).map(|e| e.value().clone()) else {
            return Err(ProtoError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "client is not connected",
            )));
        };

        let mut writer = connection.writer.lock().await;
        match write_frame(&mut *writer, envelope).await {
            Ok(()) => Ok(()),
            Err(e) => {
                drop(writer);
                self.disconnect(client_id, &format!("send failed: {e}")).await;
                Err(e)
            }
        }
    }

    /// Send one envelope to the connection bound to `user_id`, if any
    pub async fn send_to_user(
        &self,
        user_id: &UserId,
        envelope: &Envelope,
    ) -> Result<(), ProtoError> {
        let Some(client_id) = self.user_index.get(user_id).map(|e| *e.value()) else {
            return Err(ProtoError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no connection bound for user",
            )));
        };
        self.send_to(client_id, envelope).await
    }

    /// Send to every open connection; per-connection failures are logged
    /// but do not abort the broadcast
    pub async fn broadcast(&self, envelope: &Envelope) {
        let targets: Vec<ClientId> = self.registry.iter().map(|e| *e.key()).collect();
        for client_id in targets {
            if let Err(e) = self.send_to(client_id, envelope).await {
                warn!(client_id = %client_id, error = %e, "Broadcast send failed");
            }
        }
    }

    /// Remove a connection, cancel its read loop and emit the event
    pub async fn disconnect(&self, client_id: ClientId, reason: &str) {
        let Some((_, connection)) = self.registry.remove(&client_id) else {
            return;
        };
        connection.closing.cancel();

        let user_id = connection.bound_user();
        if let Some(ref user) = user_id {
            self.user_index.remove_if(user, |_, bound| *bound == client_id);
        }

        info!(client_id = %client_id, reason, "Client disconnected");
        let _ = self.events_tx.send(HubEvent::ClientDisconnected {
            client_id,
            user_id,
            reason: reason.to_string(),
        });
    }

    async fn close_all(&self, reason: &str) {
        let clients: Vec<ClientId> = self.registry.iter().map(|e| *e.key()).collect();
        for client_id in clients {
            self.disconnect(client_id, reason).await;
        }
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Whether a user currently has a bound connection
    pub fn is_user_connected(&self, user_id: &UserId) -> bool {
        self.user_index.contains_key(user_id)
    }

    /// Users with a live bound connection
    pub fn connected_users(&self) -> Vec<UserId> {
        self.user_index.iter().map(|e| e.key().clone()).collect()
    }

    /// When the given client connected, if it is still connected
    pub fn connected_at(&self, client_id: ClientId) -> Option<DateTime<Utc>> {
        self.registry.get(&client_id).map(|e| e.connected_at)
    }
}

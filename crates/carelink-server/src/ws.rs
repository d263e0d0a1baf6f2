//! `WebSocket` surface for requester and provider apps.
//!
//! Clients connect to `GET /ws`, authenticate with a bearer credential and
//! register the identity behind it. From then on the connection receives
//! everything the relay delivers to that party, and may send location
//! reports, chat lines and session transitions.
//!
//! Each connection owns an unbounded outbox. The relay writes to it through
//! the [`PresenceRegistry`]; this handler drains it into the socket. A
//! disconnect only deregisters the connection; in-flight operations run to
//! completion.
//!
//! [`PresenceRegistry`]: carelink_core::PresenceRegistry

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use carelink_core::{ConnectionHandle, DispatchError};
use carelink_types::{
    Authenticated, ClientMessage, ErrorNotice, Notice, Party, PartyRole, Registered,
    ServerMessage,
};
use tracing::{debug, warn};
use validator::Validate;

use crate::auth::Claims;
use crate::error::error_notice;
use crate::state::AppState;

/// Upgrade an HTTP request to a `WebSocket` connection.
///
/// # Route
///
/// `GET /ws`
pub async fn ws_connect(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_ws(socket, state))
}

/// Per-connection protocol state.
pub struct Connection {
    state: Arc<AppState>,
    handle: ConnectionHandle,
    claims: Option<Claims>,
    party: Option<Party>,
}

impl Connection {
    /// Create protocol state for a connection writing to `handle`.
    pub const fn new(state: Arc<AppState>, handle: ConnectionHandle) -> Self {
        Self {
            state,
            handle,
            claims: None,
            party: None,
        }
    }

    /// The registered party, once a `register*` frame succeeded.
    pub const fn party(&self) -> Option<Party> {
        self.party
    }

    /// Handle one text frame and return the direct reply, if any.
    ///
    /// Broadcast effects (relayed locations, chat, status notices) reach
    /// this connection through the outbox, not the return value.
    pub async fn handle_text(&mut self, text: &str) -> Option<ServerMessage> {
        let frame = match serde_json::from_str::<ClientMessage>(text) {
            Ok(frame) => frame,
            Err(e) => {
                return Some(ServerMessage::Error(ErrorNotice {
                    code: String::from("bad_frame"),
                    message: e.to_string(),
                    current_status: None,
                }));
            }
        };
        self.handle_frame(frame).await
    }

    /// Handle one decoded frame and return the direct reply, if any.
    pub async fn handle_frame(&mut self, frame: ClientMessage) -> Option<ServerMessage> {
        match frame {
            ClientMessage::Authenticate(c) => Some(self.authenticate(&c.credential)),
            ClientMessage::RegisterProvider(c) => {
                Some(self.register(&c.credential, PartyRole::Provider))
            }
            ClientMessage::RegisterRequester(c) => {
                Some(self.register(&c.credential, PartyRole::Requester))
            }
            other => {
                let Some(party) = self.party else {
                    return Some(ServerMessage::Error(ErrorNotice {
                        code: String::from("unregistered"),
                        message: String::from("register before sending session frames"),
                        current_status: None,
                    }));
                };
                self.dispatch(party, other)
                    .await
                    .err()
                    .map(|e| ServerMessage::Error(error_notice(&e)))
            }
        }
    }

    fn authenticate(&mut self, credential: &str) -> ServerMessage {
        match self.state.tokens.verify(credential) {
            Ok(claims) => {
                let identity = claims.sub;
                self.claims = Some(claims);
                ServerMessage::Authenticated(Authenticated { identity })
            }
            Err(e) => {
                debug!(connection = %self.handle.id(), error = %e, "Socket authentication failed");
                ServerMessage::AuthError(Notice {
                    message: e.to_string(),
                })
            }
        }
    }

    fn register(&mut self, credential: &str, role: PartyRole) -> ServerMessage {
        if let ServerMessage::AuthError(notice) = self.authenticate(credential) {
            return ServerMessage::AuthError(notice);
        }
        let Some(claims) = &self.claims else {
            return ServerMessage::AuthError(Notice {
                message: String::from("not authenticated"),
            });
        };
        if claims.role != role {
            return ServerMessage::AuthError(Notice {
                message: format!("credential is for a {}", claims.role.as_str()),
            });
        }

        let party = claims.party();
        if let Some(previous) = self.state.presence.register(party, self.handle.clone()) {
            debug!(%party, superseded = %previous, "Connection superseded");
        }
        self.party = Some(party);
        debug!(%party, connection = %self.handle.id(), "Party registered");
        ServerMessage::Registered(Registered { party })
    }

    async fn dispatch(&self, party: Party, frame: ClientMessage) -> Result<(), DispatchError> {
        let dispatch = &self.state.dispatch;
        match frame {
            ClientMessage::LocationUpdate(report) => {
                let Party::Provider(provider) = party else {
                    return Err(DispatchError::Forbidden(String::from(
                        "only providers report location",
                    )));
                };
                dispatch.update_location(provider, &report).await?;
            }
            ClientMessage::ChatMessage(post) => {
                post.validate()?;
                dispatch
                    .post_chat(post.session_id, party, Some(post.sender_role), &post.text)
                    .await?;
            }
            ClientMessage::SessionInProgress(r) => {
                dispatch.start_progress(r.session_id, party).await?;
            }
            ClientMessage::SessionArrived(r) => {
                dispatch.mark_arrived(r.session_id, party).await?;
            }
            ClientMessage::SessionCompleted(r) => {
                dispatch.complete(r.session_id, party).await?;
            }
            ClientMessage::SessionCancelled(r) => {
                dispatch.cancel(r.session_id, party).await?;
            }
            ClientMessage::Authenticate(_)
            | ClientMessage::RegisterProvider(_)
            | ClientMessage::RegisterRequester(_) => {}
        }
        Ok(())
    }
}

/// Drive one connection until either side closes it.
async fn handle_ws(mut socket: WebSocket, state: Arc<AppState>) {
    let (handle, mut outbox) = ConnectionHandle::channel();
    let connection_id = handle.id();
    debug!(connection = %connection_id, "WebSocket client connected");
    let mut conn = Connection::new(Arc::clone(&state), handle);

    loop {
        tokio::select! {
            // Something the relay routed to this connection.
            Some(message) = outbox.recv() => {
                if !send(&mut socket, &message).await {
                    debug!(connection = %connection_id, "WebSocket client disconnected (send failed)");
                    break;
                }
            }
            // A frame from the client.
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = conn.handle_text(text.as_str()).await {
                            if !send(&mut socket, &reply).await {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            debug!(connection = %connection_id, "WebSocket client disconnected (pong failed)");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(connection = %connection_id, "WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(connection = %connection_id, "WebSocket error: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let released = state.presence.deregister(connection_id);
    debug!(connection = %connection_id, parties = released.len(), "Connection closed");
}

/// Serialize and send one frame. Returns `false` once the socket is gone.
async fn send(socket: &mut WebSocket, message: &ServerMessage) -> bool {
    let json = match serde_json::to_string(message) {
        Ok(j) => j,
        Err(e) => {
            warn!("Failed to serialize server frame: {e}");
            return true;
        }
    };
    socket.send(Message::Text(json.into())).await.is_ok()
}

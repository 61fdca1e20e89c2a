//! Minimal `/ws/{user_id}` chat endpoint.
//!
//! Answers auth and heartbeats, tracks who is online and fans every other
//! JSON object out to the remaining users. Its roster size is the user
//! count the discovery responder advertises.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::presence::UserDirectory;
use crate::session::messages::{
    classify, AuthResponse, Inbound, HEARTBEAT_PONG, MSG_TYPE_AUTH, MSG_TYPE_STATUS_UPDATE,
};

const STOP_GRACE: Duration = Duration::from_secs(2);

type Outbox = mpsc::UnboundedSender<Message>;

/// Connected users, each with one outbox per open socket.
#[derive(Default)]
struct Roster {
    users: HashMap<u64, HashMap<Uuid, Outbox>>,
}

impl Roster {
    /// Returns true when this is the user's first open connection.
    fn join(&mut self, user_id: u64, conn: Uuid, outbox: Outbox) -> bool {
        let conns = self.users.entry(user_id).or_default();
        let first = conns.is_empty();
        conns.insert(conn, outbox);
        first
    }

    /// Returns true when the user has no connections left.
    fn leave(&mut self, user_id: u64, conn: Uuid) -> bool {
        let Some(conns) = self.users.get_mut(&user_id) else {
            return false;
        };
        conns.remove(&conn);
        if conns.is_empty() {
            self.users.remove(&user_id);
            true
        } else {
            false
        }
    }

    fn broadcast_except(&self, sender: u64, message: &Message) {
        for (user_id, conns) in &self.users {
            if *user_id == sender {
                continue;
            }
            for outbox in conns.values() {
                let _ = outbox.send(message.clone());
            }
        }
    }
}

pub struct Hub {
    local_addr: SocketAddr,
    roster: Arc<RwLock<Roster>>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Hub {
    /// Binds the listener and starts accepting connections.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind chat endpoint on {}", addr))?;
        let local_addr = listener.local_addr()?;
        info!("Chat endpoint listening on ws://{}/ws/{{user_id}}", local_addr);

        let roster = Arc::new(RwLock::new(Roster::default()));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(accept_loop(listener, roster.clone(), cancel.clone()));

        Ok(Self {
            local_addr,
            roster,
            cancel,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn online_user_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.roster.read().users.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Closes every connection and stops accepting new ones.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if timeout(STOP_GRACE, handle).await.is_err() {
                warn!("Chat endpoint did not stop within {:?}", STOP_GRACE);
            }
        }
    }
}

impl UserDirectory for Hub {
    fn online_users(&self) -> u32 {
        self.roster.read().users.len() as u32
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(listener: TcpListener, roster: Arc<RwLock<Roster>>, cancel: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("Accept failed: {}", err);
                    continue;
                }
            },
        };

        let roster = roster.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(err) = serve_connection(stream, roster, cancel).await {
                debug!("Connection from {} ended: {:#}", peer, err);
            }
        });
    }
    debug!("Chat endpoint accept loop stopped");
}

/// `/ws/42` → `Some(42)`.
fn parse_user_path(path: &str) -> Option<u64> {
    path.strip_prefix("/ws/")?
        .trim_end_matches('/')
        .parse()
        .ok()
}

fn status_update(user_id: u64, is_online: bool) -> Message {
    let body = json!({
        "type": MSG_TYPE_STATUS_UPDATE,
        "user_id": user_id,
        "is_online": is_online,
    });
    Message::Text(body.to_string().into())
}

async fn serve_connection(
    stream: TcpStream,
    roster: Arc<RwLock<Roster>>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut path_user = None;
    let ws = accept_hdr_async(stream, |req: &Request, resp: Response| {
        match parse_user_path(req.uri().path()) {
            Some(user_id) => {
                path_user = Some(user_id);
                Ok(resp)
            }
            None => {
                let mut err = ErrorResponse::new(Some("expected /ws/{user_id}".to_string()));
                *err.status_mut() = StatusCode::NOT_FOUND;
                Err(err)
            }
        }
    })
    .await
    .context("websocket handshake failed")?;
    let user_id = path_user.context("handshake accepted without a user id")?;

    let conn = Uuid::new_v4();
    let (mut write, mut read) = ws.split();
    let (outbox, mut inbox) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(message) = inbox.recv().await {
            let closing = matches!(message, Message::Close(_));
            if write.send(message).await.is_err() || closing {
                break;
            }
        }
        let _ = write.close().await;
    });

    let mut joined = false;
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = outbox.send(Message::Close(None));
                break;
            }
            frame = read.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                debug!("Read from user {} failed: {}", user_id, err);
                break;
            }
        };

        match classify(text.as_str()) {
            Some(Inbound::Ping) => {
                let _ = outbox.send(Message::Text(HEARTBEAT_PONG.into()));
            }
            Some(Inbound::Pong) | Some(Inbound::AuthResponse(_)) => {}
            Some(Inbound::Message(value)) if value["type"] == MSG_TYPE_AUTH => {
                if joined {
                    continue;
                }
                match check_auth(user_id, &value) {
                    Ok(()) => {
                        // An acknowledged client is always in the roster.
                        joined = true;
                        let first = roster.write().join(user_id, conn, outbox.clone());
                        let reply = serde_json::to_string(&AuthResponse::success("authenticated"))?;
                        let _ = outbox.send(Message::Text(reply.into()));
                        if first {
                            info!("User {} online", user_id);
                            roster.read().broadcast_except(user_id, &status_update(user_id, true));
                        }
                    }
                    Err(reason) => {
                        info!("Rejected user {}: {}", user_id, reason);
                        let reply = serde_json::to_string(&AuthResponse::error(reason))?;
                        let _ = outbox.send(Message::Text(reply.into()));
                        let _ = outbox.send(Message::Close(None));
                        break;
                    }
                }
            }
            Some(Inbound::Message(mut value)) | Some(Inbound::StatusUpdate(mut value)) => {
                if !joined {
                    debug!("Dropping message from unauthenticated user {}", user_id);
                    continue;
                }
                value["sender_id"] = json!(user_id);
                let relay = Message::Text(value.to_string().into());
                roster.read().broadcast_except(user_id, &relay);
            }
            None => debug!("Ignoring non-JSON frame from user {}", user_id),
        }
    }

    if joined && roster.write().leave(user_id, conn) {
        info!("User {} offline", user_id);
        roster.read().broadcast_except(user_id, &status_update(user_id, false));
    }

    drop(outbox);
    let _ = timeout(STOP_GRACE, writer).await;
    Ok(())
}

fn check_auth(path_user: u64, frame: &Value) -> std::result::Result<(), &'static str> {
    let token = frame.get("token").and_then(Value::as_str).unwrap_or_default();
    if token.is_empty() {
        return Err("missing token");
    }
    match frame.get("user_id").and_then(Value::as_u64) {
        Some(id) if id != path_user => Err("user id does not match path"),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_paths() {
        assert_eq!(parse_user_path("/ws/42"), Some(42));
        assert_eq!(parse_user_path("/ws/42/"), Some(42));
        assert_eq!(parse_user_path("/ws/"), None);
        assert_eq!(parse_user_path("/ws/abc"), None);
        assert_eq!(parse_user_path("/chat/42"), None);
    }

    #[test]
    fn auth_frames() {
        assert!(check_auth(1, &json!({"type": "auth", "token": "t", "user_id": 1})).is_ok());
        assert!(check_auth(1, &json!({"type": "auth", "token": "t"})).is_ok());
        assert_eq!(
            check_auth(1, &json!({"type": "auth", "token": "", "user_id": 1})),
            Err("missing token")
        );
        assert!(check_auth(1, &json!({"type": "auth", "token": "t", "user_id": 2})).is_err());
    }

    #[test]
    fn roster_counts_users_not_sockets() {
        let mut roster = Roster::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(roster.join(1, a, tx.clone()));
        assert!(!roster.join(1, b, tx.clone()));
        assert!(roster.join(2, Uuid::new_v4(), tx));
        assert_eq!(roster.users.len(), 2);

        assert!(!roster.leave(1, a));
        assert!(roster.leave(1, b));
        assert!(!roster.leave(1, b));
        assert_eq!(roster.users.len(), 1);
    }

    #[test]
    fn broadcast_skips_the_sender() {
        let mut roster = Roster::default();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        roster.join(1, Uuid::new_v4(), tx1);
        roster.join(2, Uuid::new_v4(), tx2);

        roster.broadcast_except(1, &status_update(1, true));
        assert!(rx1.try_recv().is_err());
        let Message::Text(text) = rx2.try_recv().unwrap() else {
            panic!("expected text frame");
        };
        let value: Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(value["type"], "user_status_update");
        assert_eq!(value["is_online"], true);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let hub = Hub::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_ne!(hub.local_addr().port(), 0);
        assert_eq!(hub.online_users(), 0);
        hub.stop().await;
        hub.stop().await;
    }
}

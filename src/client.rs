//! Per-connection session state machine.
//!
//! Each session runs exactly two tasks once `listen` is called: the read
//! pump (owned by the caller) and the write pump (spawned). The read pump
//! enforces the frame-size limit and a pong-extended read deadline, copies
//! text frames into pooled buffers, and hands them to the message queue
//! without blocking. The write pump drains the bounded outbound queue,
//! pings on a timer, and tears the session down when the peer goes idle.
//! Teardown is idempotent: `close` cancels a token both pumps select on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashSet;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::BusCommand;
use crate::error::HubError;
use crate::hub::Shared;
use crate::protocol::{epoch_ms, Payload};

pub(crate) type WsStream = WebSocketStream<TcpStream>;

/// Outbound queue bound. A full queue is terminal for the session: the
/// producer closes it rather than blocking.
pub(crate) const SEND_QUEUE_CAPACITY: usize = 256;

/// Application callback run by the message queue for every inbound frame.
/// A non-empty reply is echoed back to the originating socket; an error
/// disconnects it.
pub type ReceiveMsgHandler =
    Arc<dyn Fn(&[u8]) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

/// Identity and subscriptions, guarded together: `trigger` must observe a
/// consistent (uid, channels) pair while the control plane rewrites them.
struct SessionState {
    uid: String,
    channels: AHashSet<String>,
}

pub struct Client {
    sid: String,
    app_key: String,
    state: RwLock<SessionState>,
    last_activity: AtomicU64,
    send_tx: mpsc::Sender<Arc<Payload>>,
    send_rx: Mutex<Option<mpsc::Receiver<Arc<Payload>>>>,
    transport: Mutex<Option<WsStream>>,
    handler: RwLock<Option<ReceiveMsgHandler>>,
    closed: CancellationToken,
    shared: Arc<Shared>,
}

impl Client {
    pub(crate) fn new(transport: Option<WsStream>, app_key: &str, shared: Arc<Shared>) -> Arc<Self> {
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        Arc::new(Self {
            sid: crate::protocol::gen_socket_id(),
            app_key: app_key.to_owned(),
            state: RwLock::new(SessionState {
                uid: String::new(),
                channels: AHashSet::new(),
            }),
            last_activity: AtomicU64::new(epoch_ms()),
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            transport: Mutex::new(transport),
            handler: RwLock::new(None),
            closed: CancellationToken::new(),
            shared,
        })
    }

    // -- identity -----------------------------------------------------------

    pub fn socket_id(&self) -> &str {
        &self.sid
    }

    pub fn app_key(&self) -> &str {
        &self.app_key
    }

    pub fn uid(&self) -> String {
        self.state.read().uid.clone()
    }

    /// Assign the logical user identity, normally right after the upgrade
    /// collaborator authenticates the connection.
    pub fn set_uid(&self, uid: &str) {
        self.state.write().uid = uid.to_owned();
    }

    /// Refresh the activity clock. Receive handlers call this to keep the
    /// session alive past the idle timeout.
    pub fn mark_activity(&self) {
        self.last_activity.store(epoch_ms(), Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        Duration::from_millis(epoch_ms().saturating_sub(self.last_activity.load(Ordering::Relaxed)))
    }

    // -- channel membership -------------------------------------------------

    pub fn channels(&self) -> Vec<String> {
        self.state.read().channels.iter().cloned().collect()
    }

    pub(crate) fn has_channel(&self, channel: &str) -> bool {
        self.state.read().channels.contains(channel)
    }

    /// Subscribe a channel locally and register presence on the bus.
    pub fn sub(&self, channel: &str) {
        let uid = {
            let mut state = self.state.write();
            state.channels.insert(channel.to_owned());
            state.uid.clone()
        };
        let _ = self.shared.bus_tx.send(BusCommand::Subscribe {
            app_key: self.app_key.clone(),
            channel: channel.to_owned(),
            sid: self.sid.clone(),
            uid: (!uid.is_empty()).then_some(uid),
        });
    }

    /// Unsubscribe a channel locally and drop the per-channel presence
    /// member. The online set is left to the scan.
    pub fn unsub(&self, channel: &str) {
        self.state.write().channels.remove(channel);
        let _ = self.shared.bus_tx.send(BusCommand::Unsubscribe {
            app_key: self.app_key.clone(),
            channel: channel.to_owned(),
            sid: self.sid.clone(),
        });
    }

    /// Replace the channel set. No bus traffic; the next scan tick refreshes
    /// presence for the new set and the old entries age out.
    pub fn set_channels(&self, channels: &[String]) {
        let mut state = self.state.write();
        state.channels = channels.iter().cloned().collect();
    }

    /// Add a channel locally without touching the bus.
    pub fn add_channel(&self, channel: &str) {
        self.state.write().channels.insert(channel.to_owned());
    }

    // -- outbound -----------------------------------------------------------

    /// Enqueue raw bytes for delivery as a text frame. A full queue closes
    /// the session.
    pub fn send(&self, data: impl Into<Bytes>) {
        self.enqueue(Arc::new(Payload::raw(data.into())), "send");
    }

    /// Deliver a payload if the session is currently subscribed to `channel`
    /// and the payload belongs to this tenant.
    pub fn trigger(&self, channel: &str, payload: Arc<Payload>) -> Result<(), HubError> {
        if !self.has_channel(channel) {
            return Err(HubError::NoChannel);
        }
        if payload.app_key != self.app_key {
            return Err(HubError::AppKeyMismatch);
        }
        self.enqueue(payload, "trigger");
        Ok(())
    }

    fn enqueue(&self, payload: Arc<Payload>, path: &str) {
        if self.send_tx.try_send(payload).is_err() {
            warn!(sid = %self.sid, path, "outbound queue full, disconnecting");
            self.close();
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// Idempotent teardown: unblocks both pumps.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn receive_handler(&self) -> Option<ReceiveMsgHandler> {
        self.handler.read().clone()
    }

    /// Run the session: installs the receive handler, spawns the write pump,
    /// and blocks the caller on the read pump until the connection ends.
    pub async fn listen(self: Arc<Self>, handler: ReceiveMsgHandler) -> Result<(), HubError> {
        *self.handler.write() = Some(handler);

        let transport = self.transport.lock().take();
        let Some(transport) = transport else {
            return Err(HubError::AlreadyListening);
        };
        let send_rx = self.send_rx.lock().take();
        let Some(send_rx) = send_rx else {
            return Err(HubError::AlreadyListening);
        };

        let (sink, stream) = transport.split();
        tokio::spawn(write_pump(self.clone(), sink, send_rx));
        read_pump(&self, stream).await;

        self.shared.pool.leave(&self.sid).await;
        self.close();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Read pump
// ---------------------------------------------------------------------------

async fn read_pump(client: &Arc<Client>, mut stream: SplitStream<WsStream>) {
    let pong_wait = client.shared.options.pong_wait;
    let mut deadline = Instant::now() + pong_wait;

    loop {
        let frame = tokio::select! {
            _ = client.closed.cancelled() => break,
            res = timeout_at(deadline, stream.next()) => res,
        };

        let msg = match frame {
            Err(_) => {
                debug!(sid = %client.sid, "read deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                // Covers frames over the configured read limit as well.
                debug!(sid = %client.sid, %err, "websocket read failed");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => {
                let mut buf = client.shared.queue.acquire();
                buf.assign(client.clone());
                buf.fill(text.as_str().as_bytes());
                client.shared.stats.add_in_msg(buf.len());
                if client.shared.queue.try_serve(buf).is_err() {
                    warn!(sid = %client.sid, "receive queue busy, disconnecting");
                    break;
                }
            }
            Message::Pong(_) => {
                deadline = Instant::now() + pong_wait;
            }
            // The reply pong is queued by the protocol layer.
            Message::Ping(_) => {}
            Message::Close(_) => break,
            other => {
                debug!(sid = %client.sid, "ignoring non-text frame: {other:?}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Write pump
// ---------------------------------------------------------------------------

async fn write_pump(
    client: Arc<Client>,
    mut sink: SplitSink<WsStream, Message>,
    mut send_rx: mpsc::Receiver<Arc<Payload>>,
) {
    let opts = &client.shared.options;
    let mut ping = interval_at(Instant::now() + opts.ping_period, opts.ping_period);
    let mut activity = interval_at(
        Instant::now() + opts.activity_timeout,
        opts.activity_timeout,
    );

    loop {
        tokio::select! {
            _ = client.closed.cancelled() => break,
            payload = send_rx.recv() => {
                let Some(payload) = payload else { break };
                client.shared.stats.add_out_msg(payload.len);
                let msg = match payload.to_message() {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!(sid = %client.sid, %err, "outbound payload is not text");
                        break;
                    }
                };
                if write_with_deadline(&mut sink, msg, opts.write_wait).await.is_err() {
                    debug!(sid = %client.sid, "write failed, disconnecting");
                    break;
                }
            }
            _ = ping.tick() => {
                if write_with_deadline(&mut sink, Message::Ping(Bytes::new()), opts.write_wait)
                    .await
                    .is_err()
                {
                    debug!(sid = %client.sid, "ping failed, disconnecting");
                    break;
                }
            }
            _ = activity.tick() => {
                if client.idle_for() > opts.activity_timeout {
                    debug!(sid = %client.sid, "activity timeout, disconnecting");
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    client.close();
}

async fn write_with_deadline(
    sink: &mut SplitSink<WsStream, Message>,
    msg: Message,
    write_wait: Duration,
) -> Result<(), ()> {
    match timeout(write_wait, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubOptions;
    use tokio_tungstenite::tungstenite::Utf8Bytes;

    fn detached_client(app_key: &str) -> Arc<Client> {
        let shared = Shared::new(HubOptions {
            worker_count: 2,
            ..HubOptions::default()
        });
        Client::new(None, app_key, shared)
    }

    fn prepared(channel: &str, app_key: &str, body: &str) -> Arc<Payload> {
        Arc::new(Payload::prepared(channel, app_key, Utf8Bytes::from(body)))
    }

    #[tokio::test]
    async fn trigger_requires_membership() {
        let client = detached_client("k1");
        let err = client
            .trigger("room", prepared("room", "k1", "x"))
            .unwrap_err();
        assert!(matches!(err, HubError::NoChannel));

        client.sub("room");
        client.trigger("room", prepared("room", "k1", "x")).unwrap();
    }

    #[tokio::test]
    async fn trigger_enforces_tenant_isolation() {
        let client = detached_client("k1");
        client.sub("room");
        let err = client
            .trigger("room", prepared("room", "k2", "x"))
            .unwrap_err();
        assert!(matches!(err, HubError::AppKeyMismatch));
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn full_send_queue_closes_the_session() {
        let client = detached_client("k1");
        client.sub("room");
        // The write pump is not running, so nothing drains the queue.
        for _ in 0..SEND_QUEUE_CAPACITY {
            client.trigger("room", prepared("room", "k1", "x")).unwrap();
        }
        assert!(!client.is_closed());
        client.trigger("room", prepared("room", "k1", "x")).unwrap();
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn set_channels_replaces_the_set() {
        let client = detached_client("k1");
        client.sub("a");
        client.sub("b");
        client.sub("c");
        client.set_channels(&["b".to_string(), "d".to_string()]);

        let mut channels = client.channels();
        channels.sort();
        assert_eq!(channels, vec!["b".to_string(), "d".to_string()]);
        assert!(!client.has_channel("a"));
        assert!(client.has_channel("d"));
    }

    #[tokio::test]
    async fn add_channel_is_local_only() {
        let client = detached_client("k1");
        client.add_channel("quiet");
        assert!(client.has_channel("quiet"));
    }

    #[tokio::test]
    async fn unsub_removes_membership() {
        let client = detached_client("k1");
        client.sub("room");
        client.unsub("room");
        assert!(!client.has_channel("room"));
        assert!(matches!(
            client.trigger("room", prepared("room", "k1", "x")),
            Err(HubError::NoChannel)
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let client = detached_client("k1");
        client.close();
        client.close();
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn socket_ids_are_distinct() {
        let a = detached_client("k1");
        let b = detached_client("k1");
        assert_ne!(a.socket_id(), b.socket_id());
    }
}

//! The hub: owns the single pattern subscription on the shared bus, decodes
//! control envelopes, and forwards everything to the pool. Also performs the
//! WebSocket accept for new connections.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{self, BusCommand};
use crate::client::Client;
use crate::config::HubOptions;
use crate::error::HubError;
use crate::pool::Pool;
use crate::protocol::{
    parse_bus_channel, AddChannelEnvelope, Payload, ReloadChannelsEnvelope, SidEnvelope,
    UidEnvelope, CTRL_ADD_CHANNEL, CTRL_RELOAD_CHANNELS, CTRL_TO_SID, CTRL_TO_UID,
};
use crate::queue::MessageQueue;
use crate::stats::{StatsSnapshot, Statistic};

/// State shared between the hub, its sessions, and the queue workers.
/// Sessions hold a non-owning `Arc` to this; the pool owns the sessions.
pub(crate) struct Shared {
    pub(crate) options: HubOptions,
    pub(crate) stats: Statistic,
    pub(crate) pool: Pool,
    pub(crate) queue: MessageQueue,
    pub(crate) bus_tx: mpsc::UnboundedSender<BusCommand>,
    /// Fixed at listen time.
    pub(crate) prefix: OnceLock<String>,
}

impl Shared {
    fn with_bus(options: HubOptions) -> (Arc<Self>, mpsc::UnboundedReceiver<BusCommand>) {
        let stats = Statistic::spawn();
        let (bus_tx, bus_rx) = mpsc::unbounded_channel();
        let pool = Pool::spawn(stats.clone(), bus_tx.clone(), options.scan_interval);
        let queue = MessageQueue::spawn(pool.clone(), options.worker_count, options.max_message_size);
        (
            Arc::new(Self {
                options,
                stats,
                pool,
                queue,
                bus_tx,
                prefix: OnceLock::new(),
            }),
            bus_rx,
        )
    }

    #[cfg(test)]
    pub(crate) fn new(options: HubOptions) -> Arc<Self> {
        Self::with_bus(options).0
    }
}

pub struct Hub {
    shared: Arc<Shared>,
    redis: redis::Client,
    bus_rx: Mutex<Option<mpsc::UnboundedReceiver<BusCommand>>>,
    close: CancellationToken,
}

impl Hub {
    /// Build a hub on top of a (lazily connected) bus client. Must be called
    /// inside a tokio runtime: the pool serializer, statistics collector,
    /// and queue workers start here.
    pub fn new(redis: redis::Client, options: HubOptions) -> Self {
        let (shared, bus_rx) = Shared::with_bus(options);
        Self {
            shared,
            redis,
            bus_rx: Mutex::new(Some(bus_rx)),
            close: CancellationToken::new(),
        }
    }

    /// Accept a WebSocket connection and register the resulting session.
    /// The caller keeps the returned handle and drives it with
    /// [`Client::listen`].
    pub async fn upgrade(&self, stream: TcpStream, app_key: &str) -> Result<Arc<Client>, HubError> {
        let config =
            WebSocketConfig::default().max_message_size(Some(self.shared.options.max_message_size));
        let ws = tokio_tungstenite::accept_async_with_config(stream, Some(config)).await?;
        let client = Client::new(Some(ws), app_key, self.shared.clone());
        self.shared.pool.join(client.clone()).await;
        debug!(sid = %client.socket_id(), app_key, "session upgraded");
        Ok(client)
    }

    /// Subscribe to `<prefix>*` on the bus and run the receive loop until
    /// [`Hub::close`] is called or the bus fails. A bus failure shuts the
    /// pool down and surfaces as an error; the caller is expected to
    /// restart.
    pub async fn listen(&self, prefix: &str) -> Result<(), HubError> {
        self.shared
            .prefix
            .set(prefix.to_owned())
            .map_err(|_| HubError::PrefixAlreadySet)?;
        let bus_rx = self
            .bus_rx
            .lock()
            .take()
            .ok_or(HubError::AlreadyListening)?;

        let write_conn = self.redis.get_multiplexed_tokio_connection().await?;
        tokio::spawn(bus::writer_task(
            write_conn,
            prefix.to_owned(),
            bus_rx,
            self.close.clone(),
        ));

        let mut pubsub = self.redis.get_async_pubsub().await?;
        pubsub.psubscribe(format!("{prefix}*")).await?;
        let stream = pubsub.into_on_message();
        tokio::pin!(stream);
        info!(prefix, "listening on bus pattern");

        loop {
            tokio::select! {
                _ = self.close.cancelled() => {
                    self.shared.pool.shutdown().await;
                    return Ok(());
                }
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        self.shared.pool.shutdown().await;
                        return Err(HubError::BusClosed);
                    };
                    self.dispatch_bus_message(msg.get_channel_name(), msg.get_payload_bytes())
                        .await;
                }
            }
        }
    }

    /// Signal the listen loop to drain the pool and stop.
    pub fn close(&self) {
        self.close.cancel();
    }

    /// Round-trip against the bus.
    pub async fn ping(&self) -> Result<(), HubError> {
        let mut conn = self.redis.get_multiplexed_tokio_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    /// Number of sessions currently registered on this node.
    pub fn count_online_users(&self) -> usize {
        self.shared.pool.session_count()
    }

    /// Disconnect one local socket.
    pub async fn kick_sid(&self, sid: &str) {
        self.shared.pool.kick_sid(sid).await;
    }

    /// Disconnect every local socket belonging to a user.
    pub async fn kick_uid(&self, uid: &str) {
        self.shared.pool.kick_uid(uid).await;
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    // -- bus dispatch -------------------------------------------------------

    /// Route one bus message. Best-effort: malformed input is logged and
    /// dropped, never fatal.
    async fn dispatch_bus_message(&self, bus_channel: &str, data: &[u8]) {
        let prefix = self.shared.prefix.get().map(String::as_str).unwrap_or("");
        let Some((app_key, channel)) = parse_bus_channel(prefix, bus_channel) else {
            return;
        };

        match channel {
            CTRL_TO_UID => {
                let Some(env) = decode_envelope::<UidEnvelope>(bus_channel, data) else {
                    return;
                };
                if let Some(body) = self.reserialize_capped(&env.data) {
                    self.shared.pool.to_uid(&env.uid, body).await;
                }
            }
            CTRL_TO_SID => {
                let Some(env) = decode_envelope::<SidEnvelope>(bus_channel, data) else {
                    return;
                };
                if let Some(body) = self.reserialize_capped(&env.data) {
                    self.shared.pool.to_sid(&env.sid, body).await;
                }
            }
            CTRL_RELOAD_CHANNELS => {
                let Some(env) = decode_envelope::<ReloadChannelsEnvelope>(bus_channel, data) else {
                    return;
                };
                self.shared.pool.reload_uid_channels(&env.uid, env.data).await;
            }
            CTRL_ADD_CHANNEL => {
                let Some(env) = decode_envelope::<AddChannelEnvelope>(bus_channel, data) else {
                    return;
                };
                self.shared.pool.add_uid_channel(&env.uid, &env.data).await;
            }
            _ => {
                // Broadcast: validate and allocate the frame once, then share
                // it across every recipient.
                match Utf8Bytes::try_from(Bytes::copy_from_slice(data)) {
                    Ok(body) => {
                        let payload = Arc::new(Payload::prepared(channel, app_key, body));
                        self.shared.pool.broadcast(channel, payload).await;
                    }
                    Err(err) => {
                        warn!(bus_channel, %err, "dropping non-utf8 broadcast frame");
                    }
                }
            }
        }
    }

    /// Re-serialize an envelope's `data` for delivery, enforcing the same
    /// size bound as inbound frames so a bus producer cannot balloon node
    /// memory.
    fn reserialize_capped(&self, value: &serde_json::Value) -> Option<Bytes> {
        match serde_json::to_vec(value) {
            Ok(body) if body.len() <= self.shared.options.max_message_size => Some(body.into()),
            Ok(body) => {
                warn!(
                    len = body.len(),
                    limit = self.shared.options.max_message_size,
                    "dropping oversized control payload"
                );
                None
            }
            Err(err) => {
                warn!(%err, "control payload is not serializable");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn decode_envelope<T: serde::de::DeserializeOwned>(bus_channel: &str, data: &[u8]) -> Option<T> {
    match serde_json::from_slice(data) {
        Ok(env) => Some(env),
        Err(err) => {
            warn!(bus_channel, %err, "dropping malformed control envelope");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

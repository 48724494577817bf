//! Producer facade: stateless operations against the shared bus.
//!
//! Any process holding a bus connection can publish into the hub namespace
//! or query presence, whether or not it terminates sockets itself. All keys
//! and pub/sub channels follow `<prefix><appKey>@…`.

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::Serialize;

use crate::error::HubError;
use crate::protocol::{
    channel_key, online_key, AddChannelEnvelope, ReloadChannelsEnvelope, SidEnvelope, UidEnvelope,
    CTRL_ADD_CHANNEL, CTRL_RELOAD_CHANNELS, CTRL_TO_SID, CTRL_TO_UID, ONLINE_WINDOW_SECS,
};

/// One entry of a batch publish.
#[derive(Clone, Debug)]
pub struct BatchData {
    pub channel: String,
    pub data: Vec<u8>,
}

pub struct Sender {
    conn: MultiplexedConnection,
}

impl Sender {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    pub async fn connect(client: &redis::Client) -> Result<Self, HubError> {
        Ok(Self::new(client.get_multiplexed_tokio_connection().await?))
    }

    /// Publish raw bytes to a channel. Returns the bus's receiver count.
    pub async fn push(
        &self,
        prefix: &str,
        app_key: &str,
        channel: &str,
        data: &[u8],
    ) -> Result<i64, HubError> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(channel_key(prefix, app_key, channel), data).await?;
        Ok(receivers)
    }

    /// Sequential publishes; no transactional guarantee.
    pub async fn push_batch(
        &self,
        prefix: &str,
        app_key: &str,
        batch: &[BatchData],
    ) -> Result<(), HubError> {
        let mut conn = self.conn.clone();
        for entry in batch {
            let _: i64 = conn
                .publish(channel_key(prefix, app_key, &entry.channel), &entry.data)
                .await?;
        }
        Ok(())
    }

    /// Deliver `data` to one socket, wherever in the cluster it lives.
    pub async fn push_to_sid(
        &self,
        prefix: &str,
        app_key: &str,
        sid: &str,
        data: &impl Serialize,
    ) -> Result<i64, HubError> {
        let envelope = SidEnvelope {
            sid: sid.to_owned(),
            data: serde_json::to_value(data)?,
        };
        self.publish_envelope(prefix, app_key, CTRL_TO_SID, &envelope)
            .await
    }

    /// Deliver `data` to every socket of a user.
    pub async fn push_to_uid(
        &self,
        prefix: &str,
        app_key: &str,
        uid: &str,
        data: &impl Serialize,
    ) -> Result<i64, HubError> {
        let envelope = UidEnvelope {
            uid: uid.to_owned(),
            data: serde_json::to_value(data)?,
        };
        self.publish_envelope(prefix, app_key, CTRL_TO_UID, &envelope)
            .await
    }

    /// Replace a user's channel set on every node.
    pub async fn reload_channel(
        &self,
        prefix: &str,
        app_key: &str,
        uid: &str,
        channels: &[String],
    ) -> Result<i64, HubError> {
        let envelope = ReloadChannelsEnvelope {
            uid: uid.to_owned(),
            data: channels.to_vec(),
        };
        self.publish_envelope(prefix, app_key, CTRL_RELOAD_CHANNELS, &envelope)
            .await
    }

    /// Append one channel to a user's set on every node.
    pub async fn add_channel(
        &self,
        prefix: &str,
        app_key: &str,
        uid: &str,
        channel: &str,
    ) -> Result<i64, HubError> {
        let envelope = AddChannelEnvelope {
            uid: uid.to_owned(),
            data: channel.to_owned(),
        };
        self.publish_envelope(prefix, app_key, CTRL_ADD_CHANNEL, &envelope)
            .await
    }

    async fn publish_envelope(
        &self,
        prefix: &str,
        app_key: &str,
        sentinel: &str,
        envelope: &impl Serialize,
    ) -> Result<i64, HubError> {
        let body = serde_json::to_vec(envelope)?;
        let mut conn = self.conn.clone();
        let receivers: i64 = conn
            .publish(channel_key(prefix, app_key, sentinel), body)
            .await?;
        Ok(receivers)
    }

    /// List channels with live presence sets matching `pattern`. Cursor
    /// scan, so the result is an approximate snapshot.
    pub async fn get_channels(
        &self,
        prefix: &str,
        app_key: &str,
        pattern: &str,
    ) -> Result<Vec<String>, HubError> {
        let key_prefix = format!("{prefix}{app_key}@channels:");
        let scan_pattern = format!("{key_prefix}{pattern}");
        let mut conn = self.conn.clone();
        let mut channels = Vec::new();
        {
            let mut keys: redis::AsyncIter<'_, String> = conn.scan_match(&scan_pattern).await?;
            while let Some(key) = keys.next_item().await {
                if let Some(channel) = key.strip_prefix(&key_prefix) {
                    if !channel.is_empty() {
                        channels.push(channel.to_owned());
                    }
                }
            }
        }
        Ok(channels)
    }

    /// Uids whose online score falls inside the trailing window.
    pub async fn get_online(&self, prefix: &str, app_key: &str) -> Result<Vec<String>, HubError> {
        self.range_by_window(online_key(prefix, app_key)).await
    }

    /// Sids present in a channel inside the trailing window.
    pub async fn get_online_by_channel(
        &self,
        prefix: &str,
        app_key: &str,
        channel: &str,
    ) -> Result<Vec<String>, HubError> {
        self.range_by_window(crate::protocol::presence_key(prefix, app_key, channel))
            .await
    }

    async fn range_by_window(&self, key: String) -> Result<Vec<String>, HubError> {
        let now = crate::protocol::epoch_secs() as i64;
        let from = now - ONLINE_WINDOW_SECS as i64;
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.zrangebyscore(key, from, now).await?;
        Ok(members)
    }
}

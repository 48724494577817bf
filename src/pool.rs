//! Registry of live sessions and the control-plane dispatcher.
//!
//! All mutations and fan-out flow through one bounded command channel with a
//! single consumer, so the registry never needs a lock for writes; the map
//! itself is concurrently readable for counters. The serializer also owns
//! the scan timer that re-scores local presence entries. Peers never write
//! our entries; they age out of the window unless we refresh them.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tracing::{debug, warn};

use crate::bus::{BusCommand, PresenceRefresh};
use crate::client::Client;
use crate::error::HubError;
use crate::protocol::Payload;
use crate::stats::Statistic;

pub(crate) const POOL_QUEUE_CAPACITY: usize = 4096;

pub(crate) enum PoolCommand {
    Join(Arc<Client>),
    Leave(String),
    Broadcast {
        channel: String,
        payload: Arc<Payload>,
    },
    ToSid {
        sid: String,
        data: Bytes,
    },
    ToUid {
        uid: String,
        data: Bytes,
    },
    ReloadUidChannels {
        uid: String,
        channels: Vec<String>,
    },
    AddUidChannel {
        uid: String,
        channel: String,
    },
    KickSid(String),
    KickUid(String),
    Shutdown,
}

/// Handle to the serializer. Cloneable; every producer enqueues through it.
#[derive(Clone)]
pub(crate) struct Pool {
    tx: mpsc::Sender<PoolCommand>,
    sessions: Arc<DashMap<String, Arc<Client>>>,
}

impl Pool {
    pub(crate) fn spawn(
        stats: Statistic,
        bus_tx: mpsc::UnboundedSender<BusCommand>,
        scan_interval: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(POOL_QUEUE_CAPACITY);
        let sessions: Arc<DashMap<String, Arc<Client>>> = Arc::new(DashMap::new());
        tokio::spawn(run(rx, sessions.clone(), stats, bus_tx, scan_interval));
        Self { tx, sessions }
    }

    pub(crate) fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) async fn join(&self, client: Arc<Client>) {
        let _ = self.tx.send(PoolCommand::Join(client)).await;
    }

    pub(crate) async fn leave(&self, sid: &str) {
        let _ = self.tx.send(PoolCommand::Leave(sid.to_owned())).await;
    }

    pub(crate) async fn broadcast(&self, channel: &str, payload: Arc<Payload>) {
        let _ = self
            .tx
            .send(PoolCommand::Broadcast {
                channel: channel.to_owned(),
                payload,
            })
            .await;
    }

    pub(crate) async fn to_sid(&self, sid: &str, data: Bytes) {
        let _ = self
            .tx
            .send(PoolCommand::ToSid {
                sid: sid.to_owned(),
                data,
            })
            .await;
    }

    pub(crate) async fn to_uid(&self, uid: &str, data: Bytes) {
        let _ = self
            .tx
            .send(PoolCommand::ToUid {
                uid: uid.to_owned(),
                data,
            })
            .await;
    }

    pub(crate) async fn reload_uid_channels(&self, uid: &str, channels: Vec<String>) {
        let _ = self
            .tx
            .send(PoolCommand::ReloadUidChannels {
                uid: uid.to_owned(),
                channels,
            })
            .await;
    }

    pub(crate) async fn add_uid_channel(&self, uid: &str, channel: &str) {
        let _ = self
            .tx
            .send(PoolCommand::AddUidChannel {
                uid: uid.to_owned(),
                channel: channel.to_owned(),
            })
            .await;
    }

    pub(crate) async fn kick_sid(&self, sid: &str) {
        let _ = self.tx.send(PoolCommand::KickSid(sid.to_owned())).await;
    }

    pub(crate) async fn kick_uid(&self, uid: &str) {
        let _ = self.tx.send(PoolCommand::KickUid(uid.to_owned())).await;
    }

    pub(crate) async fn shutdown(&self) {
        let _ = self.tx.send(PoolCommand::Shutdown).await;
    }
}

async fn run(
    mut rx: mpsc::Receiver<PoolCommand>,
    sessions: Arc<DashMap<String, Arc<Client>>>,
    stats: Statistic,
    bus_tx: mpsc::UnboundedSender<BusCommand>,
    scan_interval: Duration,
) {
    let mut scan = interval_at(Instant::now() + scan_interval, scan_interval);
    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                if !dispatch(cmd, &sessions, &stats) {
                    break;
                }
            }
            _ = scan.tick() => refresh_presence(&sessions, &bus_tx),
        }
    }
    debug!("pool serializer stopped");
}

/// Apply one command. Returns `false` on shutdown.
fn dispatch(
    cmd: PoolCommand,
    sessions: &DashMap<String, Arc<Client>>,
    stats: &Statistic,
) -> bool {
    match cmd {
        PoolCommand::Join(client) => {
            client.mark_activity();
            sessions.insert(client.socket_id().to_owned(), client);
            stats.add_member_enter();
        }
        PoolCommand::Leave(sid) => {
            if sessions.remove(&sid).is_some() {
                stats.add_member_leave();
            }
        }
        PoolCommand::Broadcast { channel, payload } => {
            for entry in sessions.iter() {
                // Trigger filters on membership and tenant itself; a slow
                // session evicts itself without stalling the loop.
                match entry.value().trigger(&channel, payload.clone()) {
                    Ok(()) | Err(HubError::NoChannel) | Err(HubError::AppKeyMismatch) => {}
                    Err(err) => {
                        warn!(sid = %entry.key(), %err, "broadcast delivery failed");
                    }
                }
            }
        }
        PoolCommand::ToSid { sid, data } => {
            if let Some(client) = sessions.get(&sid) {
                client.send(data);
            }
        }
        PoolCommand::ToUid { uid, data } => {
            for entry in sessions.iter() {
                if entry.value().uid() == uid {
                    entry.value().send(data.clone());
                }
            }
        }
        PoolCommand::ReloadUidChannels { uid, channels } => {
            for entry in sessions.iter() {
                if entry.value().uid() == uid {
                    entry.value().set_channels(&channels);
                }
            }
        }
        PoolCommand::AddUidChannel { uid, channel } => {
            for entry in sessions.iter() {
                if entry.value().uid() == uid {
                    entry.value().sub(&channel);
                }
            }
        }
        PoolCommand::KickSid(sid) => {
            if let Some(client) = sessions.get(&sid) {
                client.close();
            }
        }
        PoolCommand::KickUid(uid) => {
            for entry in sessions.iter() {
                if entry.value().uid() == uid {
                    entry.value().close();
                }
            }
        }
        PoolCommand::Shutdown => {
            for entry in sessions.iter() {
                entry.value().close();
            }
            sessions.clear();
            return false;
        }
    }
    true
}

/// Re-score presence for every local session that has an identity and at
/// least one channel. Stale entries left by crashed peers fall out of the
/// online window because nobody refreshes them.
fn refresh_presence(
    sessions: &DashMap<String, Arc<Client>>,
    bus_tx: &mpsc::UnboundedSender<BusCommand>,
) {
    let mut entries = Vec::new();
    for entry in sessions.iter() {
        let client = entry.value();
        let uid = client.uid();
        if uid.is_empty() {
            continue;
        }
        let channels = client.channels();
        if channels.is_empty() {
            continue;
        }
        entries.push(PresenceRefresh {
            app_key: client.app_key().to_owned(),
            sid: client.socket_id().to_owned(),
            uid,
            channels,
        });
    }
    if !entries.is_empty() {
        let _ = bus_tx.send(BusCommand::Refresh { entries });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubOptions;
    use crate::hub::Shared;

    fn test_shared() -> Arc<Shared> {
        Shared::new(HubOptions {
            worker_count: 2,
            ..HubOptions::default()
        })
    }

    fn session(shared: &Arc<Shared>, app_key: &str) -> Arc<Client> {
        Client::new(None, app_key, shared.clone())
    }

    #[tokio::test]
    async fn scan_covers_identified_sessions_with_channels_only() {
        let shared = test_shared();
        let sessions = DashMap::new();

        let with_both = session(&shared, "K");
        with_both.set_uid("U");
        with_both.sub("a");
        with_both.sub("b");
        let no_uid = session(&shared, "K");
        no_uid.sub("x");
        let no_channels = session(&shared, "K");
        no_channels.set_uid("V");

        for c in [&with_both, &no_uid, &no_channels] {
            sessions.insert(c.socket_id().to_owned(), c.clone());
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        refresh_presence(&sessions, &tx);

        let Ok(BusCommand::Refresh { entries }) = rx.try_recv() else {
            panic!("expected one refresh command");
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].uid, "U");
        assert_eq!(entries[0].sid, with_both.socket_id());
        let mut channels = entries[0].channels.clone();
        channels.sort();
        assert_eq!(channels, vec!["a".to_string(), "b".to_string()]);
        assert!(rx.try_recv().is_err(), "only one batch per scan tick");
    }

    #[tokio::test]
    async fn scan_with_no_eligible_sessions_stays_quiet() {
        let shared = test_shared();
        let sessions = DashMap::new();
        let c = session(&shared, "K");
        c.sub("room");
        sessions.insert(c.socket_id().to_owned(), c);

        let (tx, mut rx) = mpsc::unbounded_channel();
        refresh_presence(&sessions, &tx);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn join_kick_and_leave_maintain_the_registry() {
        let shared = test_shared();
        let stats = crate::stats::Statistic::spawn();
        let sessions = DashMap::new();
        let c = session(&shared, "K");
        let sid = c.socket_id().to_owned();

        assert!(dispatch(PoolCommand::Join(c.clone()), &sessions, &stats));
        assert_eq!(sessions.len(), 1);

        assert!(dispatch(PoolCommand::KickSid(sid.clone()), &sessions, &stats));
        assert!(c.is_closed());

        assert!(dispatch(PoolCommand::Leave(sid), &sessions, &stats));
        assert_eq!(sessions.len(), 0);
    }

    #[tokio::test]
    async fn kick_uid_closes_every_socket_of_the_user() {
        let shared = test_shared();
        let stats = crate::stats::Statistic::spawn();
        let sessions = DashMap::new();

        let a = session(&shared, "K");
        a.set_uid("U");
        let b = session(&shared, "K");
        b.set_uid("U");
        let other = session(&shared, "K");
        other.set_uid("W");
        for c in [&a, &b, &other] {
            dispatch(PoolCommand::Join(c.clone()), &sessions, &stats);
        }

        dispatch(PoolCommand::KickUid("U".into()), &sessions, &stats);
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert!(!other.is_closed());
    }

    #[tokio::test]
    async fn shutdown_closes_and_clears_everything() {
        let shared = test_shared();
        let stats = crate::stats::Statistic::spawn();
        let sessions = DashMap::new();
        let a = session(&shared, "K");
        let b = session(&shared, "K");
        dispatch(PoolCommand::Join(a.clone()), &sessions, &stats);
        dispatch(PoolCommand::Join(b.clone()), &sessions, &stats);

        assert!(!dispatch(PoolCommand::Shutdown, &sessions, &stats));
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert_eq!(sessions.len(), 0);
    }
}

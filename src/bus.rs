//! Write path to the shared bus.
//!
//! Sessions and the pool never touch the bus directly; they enqueue
//! commands on an unbounded channel drained by a single writer task that
//! owns one multiplexed connection. Each command executes as an atomic
//! pipeline. The `CH` flag on ZADD makes a score refresh count as a change,
//! so metering on the bus side sees keepalives.

use redis::aio::MultiplexedConnection;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::{epoch_secs, online_key, presence_key};

/// One session's presence entries, re-scored on every scan tick.
pub(crate) struct PresenceRefresh {
    pub app_key: String,
    pub sid: String,
    pub uid: String,
    pub channels: Vec<String>,
}

pub(crate) enum BusCommand {
    /// Session subscribed a channel: refresh the online set (when the
    /// session has an identity) and the per-channel set, atomically.
    Subscribe {
        app_key: String,
        channel: String,
        sid: String,
        uid: Option<String>,
    },
    /// Session unsubscribed: drop the per-channel member. The online set is
    /// left alone; liveness is the scan's job.
    Unsubscribe {
        app_key: String,
        channel: String,
        sid: String,
    },
    /// Periodic re-score of every live local session.
    Refresh { entries: Vec<PresenceRefresh> },
}

/// Build the atomic pipeline for one command. Scores are Unix seconds.
fn command_pipeline(prefix: &str, now: u64, cmd: BusCommand) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic();
    match cmd {
        BusCommand::Subscribe {
            app_key,
            channel,
            sid,
            uid,
        } => {
            if let Some(uid) = uid {
                pipe.cmd("ZADD")
                    .arg(online_key(prefix, &app_key))
                    .arg("CH")
                    .arg(now)
                    .arg(uid)
                    .ignore();
            }
            pipe.cmd("ZADD")
                .arg(presence_key(prefix, &app_key, &channel))
                .arg("CH")
                .arg(now)
                .arg(sid)
                .ignore();
        }
        BusCommand::Unsubscribe {
            app_key,
            channel,
            sid,
        } => {
            pipe.cmd("ZREM")
                .arg(presence_key(prefix, &app_key, &channel))
                .arg(sid)
                .ignore();
        }
        BusCommand::Refresh { entries } => {
            for entry in &entries {
                pipe.cmd("ZADD")
                    .arg(online_key(prefix, &entry.app_key))
                    .arg("CH")
                    .arg(now)
                    .arg(&entry.uid)
                    .ignore();
                for channel in &entry.channels {
                    pipe.cmd("ZADD")
                        .arg(presence_key(prefix, &entry.app_key, channel))
                        .arg("CH")
                        .arg(now)
                        .arg(&entry.sid)
                        .ignore();
                }
            }
        }
    }
    pipe
}

pub(crate) async fn writer_task(
    mut conn: MultiplexedConnection,
    prefix: String,
    mut rx: mpsc::UnboundedReceiver<BusCommand>,
    shutdown: CancellationToken,
) {
    loop {
        let cmd = tokio::select! {
            _ = shutdown.cancelled() => break,
            cmd = rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
        };

        let pipe = command_pipeline(&prefix, epoch_secs(), cmd);
        // A lost write is repaired by the next scan tick, so log and move on.
        if let Err(err) = pipe.query_async::<()>(&mut conn).await {
            warn!(%err, "presence write failed");
        }
    }
    debug!("bus writer stopped");
}

//! Horizontally-scalable WebSocket fan-out hub backed by a Redis-compatible
//! pub/sub and sorted-set service.
//!
//! Every node runs a [`Hub`] that terminates WebSocket sessions, subscribes
//! to a single wildcard pattern on the shared bus, and demultiplexes bus
//! messages into per-session deliveries. Presence lives in shared sorted
//! sets scored by Unix time, so any peer node (or an out-of-band producer
//! using [`Sender`]) can publish to a channel or address a specific
//! user/socket by identifier.
//!
//! ```no_run
//! use std::sync::Arc;
//! use fanhub::{Hub, HubOptions};
//!
//! # async fn run() -> Result<(), fanhub::HubError> {
//! let redis = redis::Client::open("redis://127.0.0.1/")?;
//! let hub = Arc::new(Hub::new(redis, HubOptions::default()));
//!
//! // Accept loop (listener setup and auth omitted).
//! # let listener = tokio::net::TcpListener::bind("0.0.0.0:8001").await.unwrap();
//! {
//!     let hub = hub.clone();
//!     tokio::spawn(async move {
//!         while let Ok((stream, _)) = listener.accept().await {
//!             let Ok(session) = hub.upgrade(stream, "my-app").await else {
//!                 continue;
//!             };
//!             session.sub("lobby");
//!             tokio::spawn(async move {
//!                 let _ = session
//!                     .listen(Arc::new(|frame| Ok(frame.to_vec())))
//!                     .await;
//!             });
//!         }
//!     });
//! }
//!
//! hub.listen("gusher.").await
//! # }
//! ```

mod buffer;
mod bus;
mod client;
mod config;
mod error;
mod hub;
mod pool;
mod protocol;
mod queue;
mod sender;
mod stats;

pub use client::{Client, ReceiveMsgHandler};
pub use config::HubOptions;
pub use error::HubError;
pub use hub::Hub;
pub use protocol::{gen_socket_id, Payload, PayloadBody, ONLINE_WINDOW_SECS};
pub use sender::{BatchData, Sender};
pub use stats::StatsSnapshot;

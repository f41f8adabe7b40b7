//! Concord is a client library for Discord-style real-time gateway services.
//!
//! The library maintains one persistent WebSocket connection per shard, keeps
//! each connection alive and consistent under network failure, fans inbound
//! events into a shared in-memory [`cache`], and serializes outbound REST
//! calls through a rate-limited [`http`] dispatcher. A secondary [`voice`]
//! subsystem negotiates voice sessions over the primary gateway and manages
//! playback state on an independent signaling channel.
//!
//! # High-level flow
//!
//! Inbound: the remote service sends frames to a [`gateway::Shard`], which
//! decodes them into [`model::event::Event`]s, applies them to the
//! [`cache::Cache`], and re-emits them as [`client::ClientEvent`]s over a
//! single ordered channel.
//!
//! Outbound: callers go through [`http::Http`], which resolves a per-route
//! bucket, waits for a token, performs the request, and retries a throttled
//! request exactly once before surfacing the failure.
//!
//! # Example
//!
//! ```rust,no_run
//! use concord::client::{Client, ClientEvent};
//!
//! # async fn run() -> Result<(), concord::Error> {
//! let token = std::env::var("GATEWAY_TOKEN").expect("token");
//! let mut client = Client::builder(&token).shard_total(2).build().await?;
//! client.start().await;
//!
//! while let Some(event) = client.recv_event().await {
//!     if let ClientEvent::MessageCreate { message } = event {
//!         println!("{}: {}", message.author.name, message.content);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod bucket;
pub mod cache;
pub mod client;
pub mod constants;
mod error;
pub mod gateway;
pub mod http;
pub mod model;
pub mod voice;

pub use crate::error::{Error, Result};

/// A set of exports for convenient glob-importing.
pub mod prelude {
    pub use crate::cache::Cache;
    pub use crate::client::{Client, ClientEvent};
    pub use crate::error::{Error, Result};
    pub use crate::gateway::{ConnectionStage, ShardManager};
    pub use crate::http::Http;
    pub use crate::model::id::{ChannelId, GuildId, MessageId, RoleId, ShardId, UserId};
    pub use crate::model::prelude::*;
}

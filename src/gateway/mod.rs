//! The gateway layer: sharded WebSocket connections to the event service.
//!
//! A [`Shard`] is a pure protocol state machine; a [`ShardRunner`] gives it
//! a transport and a task; the [`ShardManager`] boots and tracks the fleet.
//! Handles into a running shard go through a [`ShardMessenger`].

mod error;
mod shard;
mod shard_manager;
mod shard_messenger;
mod shard_runner;
mod ws;

pub use self::error::Error as GatewayError;
pub use self::shard::{ConnectionStage, HeartbeatStatus, ReconnectType, Shard, ShardAction};
pub use self::shard_manager::{ShardManager, ShardManagerOptions, ShardRunnerInfo};
pub use self::shard_messenger::ShardMessenger;
pub use self::shard_runner::{ShardRunner, ShardRunnerMessage, ShardRunnerOptions};
pub use self::ws::WsClient;
use crate::model::gateway::PresenceData;
use crate::model::id::UserId;

/// A filter for requesting member chunks for a guild.
#[derive(Clone, Debug)]
pub enum ChunkGuildFilter {
    /// Every member, no filtering.
    None,
    /// Members whose usernames start with the query.
    Query(String),
    /// Members with these ids.
    UserIds(Vec<UserId>),
}

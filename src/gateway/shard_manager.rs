use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{
    ConnectionStage, Shard, ShardMessenger, ShardRunner, ShardRunnerOptions,
};
use crate::bucket::TokenBucket;
use crate::cache::Cache;
use crate::client::ClientEvent;
use crate::model::gateway::{ActivityData, OnlineStatus, PresenceData, ShardInfo};
use crate::model::id::{ChannelId, GuildId, ShardId};
use crate::voice::VoiceManager;

/// Identifies are serialized fleet-wide: one per this window.
const IDENTIFY_INTERVAL: Duration = Duration::from_secs(5);

/// A manager for the shards run by the client.
///
/// Owns the per-shard bookkeeping and the shared identify throttle, boots
/// one [`ShardRunner`] task per shard, and aggregates their Ready signals
/// into a single [`ClientEvent::AllShardsReady`].
#[derive(Debug)]
pub struct ShardManager {
    /// The state of the shard runners, keyed by shard id.
    pub runners: Mutex<HashMap<ShardId, ShardRunnerInfo>>,
    ready_shards: parking_lot::Mutex<HashSet<ShardId>>,
    all_ready_emitted: AtomicBool,
    shard_total: u16,
    ws_url: Arc<str>,
    token: SecretString,
    identify_bucket: Arc<TokenBucket>,
    event_tx: tokio::sync::mpsc::UnboundedSender<ClientEvent>,
    cache: Arc<Cache>,
    voice: Option<Arc<VoiceManager>>,
    presence: Option<PresenceData>,
}

impl ShardManager {
    #[must_use]
    pub fn new(opt: ShardManagerOptions) -> Arc<Self> {
        Arc::new(Self {
            runners: Mutex::new(HashMap::new()),
            ready_shards: parking_lot::Mutex::new(HashSet::new()),
            all_ready_emitted: AtomicBool::new(false),
            shard_total: opt.shard_total,
            ws_url: opt.ws_url,
            token: opt.token,
            identify_bucket: Arc::new(TokenBucket::new(1, IDENTIFY_INTERVAL)),
            event_tx: opt.event_tx,
            cache: opt.cache,
            voice: opt.voice,
            presence: opt.presence,
        })
    }

    /// Boots one runner per shard.
    pub async fn initialize(self: &Arc<Self>) {
        for id in 0..self.shard_total {
            self.boot(ShardId(id)).await;
        }
    }

    /// The total number of shards the manager was configured with.
    #[must_use]
    pub fn shard_total(&self) -> u16 {
        self.shard_total
    }

    /// Which shard carries events for the given guild.
    #[must_use]
    pub fn shard_id_for_guild(&self, guild_id: GuildId) -> ShardId {
        ShardId((guild_id.get() % u64::from(self.shard_total)) as u16)
    }

    async fn boot(self: &Arc<Self>, shard_id: ShardId) {
        info!("Booting shard {shard_id}");

        let shard = Shard::new(ShardInfo::new(shard_id, self.shard_total), self.presence.clone());
        let runner = ShardRunner::new(ShardRunnerOptions {
            shard,
            manager: Arc::clone(self),
            cache: Arc::clone(&self.cache),
            event_tx: self.event_tx.clone(),
            voice: self.voice.clone(),
            token: self.token.clone(),
            ws_url: Arc::clone(&self.ws_url),
            identify_bucket: Arc::clone(&self.identify_bucket),
        });

        let messenger = ShardMessenger::new(&runner);
        self.runners.lock().await.insert(shard_id, ShardRunnerInfo {
            latency: None,
            stage: ConnectionStage::Disconnected,
            runner_tx: messenger,
        });

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(why) = runner.run().await {
                warn!("Shard {shard_id} stopped: {why:?}");
            }

            manager.update_shard_latency_and_stage(shard_id, None, ConnectionStage::Disconnected)
                .await;
        });
    }

    /// The messenger for a shard, if the shard has been booted.
    pub async fn messenger(&self, shard_id: ShardId) -> Option<ShardMessenger> {
        self.runners.lock().await.get(&shard_id).map(|info| info.runner_tx.clone())
    }

    /// Records a shard as ready. When the last of the fleet reports in, a
    /// single [`ClientEvent::AllShardsReady`] is emitted; later resumes and
    /// reidentifies do not emit another.
    pub async fn notify_ready(&self, shard_id: ShardId) {
        let all_ready = {
            let mut ready = self.ready_shards.lock();
            ready.insert(shard_id);
            ready.len() == usize::from(self.shard_total)
        };

        if all_ready && !self.all_ready_emitted.swap(true, Ordering::SeqCst) {
            info!("All {} shards ready", self.shard_total);

            drop(self.event_tx.send(ClientEvent::AllShardsReady));
        }
    }

    pub(super) async fn update_shard_latency_and_stage(
        &self,
        shard_id: ShardId,
        latency: Option<Duration>,
        stage: ConnectionStage,
    ) {
        if let Some(info) = self.runners.lock().await.get_mut(&shard_id) {
            info.latency = latency;
            info.stage = stage;
        }
    }

    /// Sends a voice state update over the shard that carries the guild.
    pub async fn update_voice_state(
        &self,
        guild_id: GuildId,
        channel_id: Option<ChannelId>,
        self_mute: bool,
        self_deaf: bool,
    ) {
        let shard_id = self.shard_id_for_guild(guild_id);

        if let Some(messenger) = self.messenger(shard_id).await {
            messenger.update_voice_state(guild_id, channel_id, self_mute, self_deaf);
        } else {
            warn!("No runner for shard {shard_id}; dropping voice state update");
        }
    }

    /// Sets the presence on every shard.
    pub async fn set_presence(&self, activity: Option<ActivityData>, status: OnlineStatus) {
        for info in self.runners.lock().await.values() {
            info.runner_tx.set_presence(activity.clone(), status);
        }
    }

    /// Sets the activity on every shard, keeping each shard's status.
    pub async fn set_activity(&self, activity: Option<ActivityData>) {
        for info in self.runners.lock().await.values() {
            info.runner_tx.set_activity(activity.clone());
        }
    }

    /// Sets the online status on every shard, keeping each shard's activity.
    pub async fn set_status(&self, status: OnlineStatus) {
        for info in self.runners.lock().await.values() {
            info.runner_tx.set_status(status);
        }
    }

    /// Restarts a shard with a fresh session.
    pub async fn restart(&self, shard_id: ShardId) {
        info!("Restarting shard {shard_id}");

        if let Some(messenger) = self.messenger(shard_id).await {
            messenger.restart();
        }
    }

    /// Cleanly shuts one shard down.
    pub async fn shutdown(&self, shard_id: ShardId) {
        info!("Shutting down shard {shard_id}");

        if let Some(messenger) = self.messenger(shard_id).await {
            messenger.shutdown_clean();
        }

        self.ready_shards.lock().remove(&shard_id);
    }

    /// Cleanly shuts every shard down.
    pub async fn shutdown_all(&self) {
        let shard_ids = {
            let runners = self.runners.lock().await;
            runners.keys().copied().collect::<Vec<_>>()
        };

        for shard_id in shard_ids {
            self.shutdown(shard_id).await;
        }
    }
}

/// Information about a [`ShardRunner`].
///
/// The runner is a task on its own and can thus not be accessed directly;
/// this is the manager's view of it.
#[derive(Clone, Debug)]
pub struct ShardRunnerInfo {
    /// The latency between the last heartbeat and its acknowledgment.
    pub latency: Option<Duration>,
    /// The stage the runner's connection is in.
    pub stage: ConnectionStage,
    /// A handle for sending messages to the runner.
    pub runner_tx: ShardMessenger,
}

/// Options for [`ShardManager::new`].
pub struct ShardManagerOptions {
    pub token: SecretString,
    pub shard_total: u16,
    pub ws_url: Arc<str>,
    pub event_tx: tokio::sync::mpsc::UnboundedSender<ClientEvent>,
    pub cache: Arc<Cache>,
    pub voice: Option<Arc<VoiceManager>>,
    pub presence: Option<PresenceData>,
}

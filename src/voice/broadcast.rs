use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::warn;

use super::{AudioResource, VoiceConnection};
use crate::model::id::GuildId;

/// Fans one logical playback out over any number of member connections.
///
/// The stream keeps the authoritative resource and volume; members joining
/// mid-playback are caught up immediately. Members that are not ready for
/// playback are skipped with a warning rather than failing the whole fan-out,
/// so one bad connection cannot stall the rest.
#[derive(Debug)]
pub struct SharedStream {
    members: DashMap<GuildId, Arc<VoiceConnection>>,
    resource: Mutex<Option<AudioResource>>,
    volume: Mutex<f64>,
}

impl Default for SharedStream {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStream {
    #[must_use]
    pub fn new() -> Self {
        Self {
            members: DashMap::new(),
            resource: Mutex::new(None),
            volume: Mutex::new(1.0),
        }
    }

    /// Adds a connection to the stream. If something is already playing, the
    /// new member starts playing it immediately.
    pub fn add(&self, connection: Arc<VoiceConnection>) {
        connection.set_volume(*self.volume.lock());

        if let Some(resource) = self.resource.lock().clone() {
            if let Err(why) = connection.play(resource) {
                warn!(
                    "Shared stream member {} not ready for playback: {why:?}",
                    connection.guild_id()
                );
            }
        }

        self.members.insert(connection.guild_id(), connection);
    }

    /// Removes a guild's connection from the stream, stopping its playback.
    pub fn remove(&self, guild_id: GuildId) -> Option<Arc<VoiceConnection>> {
        let (_, connection) = self.members.remove(&guild_id)?;
        connection.stop_playing();
        Some(connection)
    }

    /// Starts playing `resource` on every member connection.
    pub fn play(&self, resource: AudioResource) {
        *self.resource.lock() = Some(resource.clone());

        for member in &self.members {
            if let Err(why) = member.play(resource.clone()) {
                warn!(
                    "Shared stream member {} not ready for playback: {why:?}",
                    member.guild_id()
                );
            }
        }
    }

    pub fn pause(&self) {
        for member in &self.members {
            member.pause();
        }
    }

    pub fn resume(&self) {
        for member in &self.members {
            member.resume();
        }
    }

    pub fn stop(&self) {
        *self.resource.lock() = None;

        for member in &self.members {
            member.stop_playing();
        }
    }

    /// Sets the volume on the stream and every member, clamped to
    /// `0.0..=2.0`.
    pub fn set_volume(&self, volume: f64) {
        let volume = volume.clamp(0.0, 2.0);
        *self.volume.lock() = volume;

        for member in &self.members {
            member.set_volume(volume);
        }
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn current_resource(&self) -> Option<AudioResource> {
        self.resource.lock().clone()
    }
}

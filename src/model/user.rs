use serde::{Deserialize, Serialize};

use crate::cache::CacheEntity;
use crate::model::id::UserId;

/// A user seen by the current session.
///
/// Users are shared across guilds; the cache holds one resident copy per id
/// and every member/message refers back to it.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[non_exhaustive]
pub struct User {
    pub id: UserId,
    #[serde(rename = "username")]
    pub name: String,
    #[serde(default)]
    pub bot: bool,
    #[serde(default)]
    pub avatar: Option<String>,
}

impl User {
    /// A minimal stand-in carrying only the identifier, used when an event
    /// refers to a user that is not resident in the cache.
    #[must_use]
    pub fn stand_in(id: UserId) -> Self {
        Self {
            id,
            name: String::new(),
            bot: false,
            avatar: None,
        }
    }
}

impl CacheEntity for User {
    type Id = UserId;

    fn entity_id(&self) -> UserId {
        self.id
    }

    fn merge(&mut self, newer: Self) {
        self.name = newer.name;
        self.bot = newer.bot;
        self.avatar = newer.avatar;
    }
}

//! The REST client and its ratelimiting layer.

mod error;
mod ratelimiting;
mod request;
mod routing;

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use self::error::{ErrorResponse, HttpError};
pub use self::ratelimiting::{Ratelimit, Ratelimiter, RatelimitingBucket};
pub use self::request::{LightMethod, Request};
pub use self::routing::Route;
use crate::error::{Error, Result};
use crate::model::channel::{Channel, Message};
use crate::model::gateway::Gateway;
use crate::model::guild::{Guild, Member};
use crate::model::id::{ChannelId, GuildId, MessageId, UserId};
use crate::model::user::User;

/// The REST dispatcher.
///
/// All requests funnel through the [`Ratelimiter`], so concurrent callers
/// share bucket state and the global window.
#[derive(Debug)]
pub struct Http {
    pub ratelimiter: Ratelimiter,
}

impl Http {
    /// Creates a dispatcher for the given token. The `"Bot "` prefix is
    /// added when absent.
    #[must_use]
    pub fn new(token: &str) -> Self {
        let client = Client::new();
        let token = if token.trim().starts_with("Bot ") {
            token.trim().to_string()
        } else {
            format!("Bot {}", token.trim())
        };

        Self {
            ratelimiter: Ratelimiter::new(client, token),
        }
    }

    /// Where to connect the gateway, along with the recommended shard count.
    pub async fn get_bot_gateway(&self) -> Result<Gateway> {
        self.fire(Request::new(Route::GatewayBot, LightMethod::Get)).await
    }

    pub async fn get_gateway(&self) -> Result<Gateway> {
        self.fire(Request::new(Route::Gateway, LightMethod::Get)).await
    }

    pub async fn get_current_user(&self) -> Result<User> {
        self.fire(Request::new(Route::CurrentUser, LightMethod::Get)).await
    }

    pub async fn get_user(&self, user_id: UserId) -> Result<User> {
        self.fire(Request::new(Route::User { user_id }, LightMethod::Get)).await
    }

    pub async fn get_channel(&self, channel_id: ChannelId) -> Result<Channel> {
        self.fire(Request::new(Route::Channel { channel_id }, LightMethod::Get)).await
    }

    pub async fn get_guild(&self, guild_id: GuildId) -> Result<Guild> {
        self.fire(Request::new(Route::Guild { guild_id }, LightMethod::Get)).await
    }

    pub async fn get_guild_channels(&self, guild_id: GuildId) -> Result<Vec<Channel>> {
        self.fire(Request::new(Route::GuildChannels { guild_id }, LightMethod::Get)).await
    }

    pub async fn get_member(&self, guild_id: GuildId, user_id: UserId) -> Result<Member> {
        let mut member: Member = self
            .fire(Request::new(Route::GuildMember { guild_id, user_id }, LightMethod::Get))
            .await?;
        member.guild_id = guild_id;
        Ok(member)
    }

    pub async fn get_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<Message> {
        self.fire(Request::new(
            Route::ChannelMessage {
                channel_id,
                message_id,
            },
            LightMethod::Get,
        ))
        .await
    }

    pub async fn send_message(
        &self,
        channel_id: ChannelId,
        map: &impl Serialize,
    ) -> Result<Message> {
        let body = serde_json::to_vec(map)?;
        self.fire(
            Request::new(Route::ChannelMessages { channel_id }, LightMethod::Post)
                .body(Some(body)),
        )
        .await
    }

    pub async fn delete_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<()> {
        self.wind(
            204,
            Request::new(
                Route::ChannelMessage {
                    channel_id,
                    message_id,
                },
                LightMethod::Delete,
            ),
        )
        .await
    }

    /// Fires a request and deserializes the response body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] when the request fails or comes back with a
    /// non-successful status code, and [`Error::Json`] when the body cannot
    /// be deserialized.
    pub async fn fire<T: DeserializeOwned>(&self, req: Request) -> Result<T> {
        let response = self.request(req).await?;
        Ok(response.json().await.map_err(HttpError::Request)?)
    }

    /// Fires a request, checking only the status code.
    ///
    /// The expected status is asserted in debug builds; services do change
    /// them, and a different success code is not worth failing over.
    pub async fn wind(&self, expected: u16, req: Request) -> Result<()> {
        let response = self.request(req).await?;
        debug_assert_eq!(response.status().as_u16(), expected);
        Ok(())
    }

    /// Performs a request over the ratelimiter, turning non-successful
    /// status codes into [`HttpError::UnsuccessfulRequest`].
    pub async fn request(&self, req: Request) -> Result<Response> {
        let response = self.ratelimiter.perform(req).await?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Error::Http(HttpError::UnsuccessfulRequest(
                ErrorResponse::from_response(response).await,
            )))
        }
    }
}

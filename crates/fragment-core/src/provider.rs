//! Contracts for the two collaborators the controller depends on.
//!
//! The controller only sequences these calls and reacts to their results.
//! It never assumes a provider call is transactional: a `create_room` that
//! succeeded is visible on the platform even if the following `move_member`
//! fails.

use async_trait::async_trait;

use crate::errors::{ProviderError, RegistryError};
use crate::ids::{CategoryId, GuildId, RoomId, UserId};
use crate::rooms::{RoomEdit, RoomInfo};

/// Read path into the fragment configuration.
#[async_trait]
pub trait FragmentRegistry: Send + Sync {
    /// Category new rooms are created under, if `room_id` is a registered parent.
    async fn is_fragment_parent(&self, room_id: RoomId) -> Result<Option<CategoryId>, RegistryError>;

    /// Guilds that have at least one registered parent room.
    async fn parent_guilds(&self) -> Result<Vec<GuildId>, RegistryError>;
}

/// Platform capability to manage voice rooms.
#[async_trait]
pub trait RoomProvider: Send + Sync {
    async fn create_room(
        &self,
        guild_id: GuildId,
        name: &str,
        category_id: CategoryId,
    ) -> Result<RoomId, ProviderError>;

    async fn move_member(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<(), ProviderError>;

    async fn delete_room(&self, guild_id: GuildId, room_id: RoomId) -> Result<(), ProviderError>;

    /// Members currently connected to the room, as the platform sees them now.
    async fn occupants(&self, guild_id: GuildId, room_id: RoomId) -> Result<Vec<UserId>, ProviderError>;

    async fn room_info(&self, guild_id: GuildId, room_id: RoomId) -> Result<RoomInfo, ProviderError>;

    /// The guild's designated away room, if it has one.
    async fn afk_room(&self, guild_id: GuildId) -> Result<Option<RoomId>, ProviderError>;

    async fn edit_room(
        &self,
        guild_id: GuildId,
        room_id: RoomId,
        edit: &RoomEdit,
    ) -> Result<(), ProviderError>;

    /// All voice rooms in the guild.
    async fn list_rooms(&self, guild_id: GuildId) -> Result<Vec<RoomInfo>, ProviderError>;
}

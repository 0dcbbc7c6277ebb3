use async_trait::async_trait;

use fragment_core::errors::RegistryError;
use fragment_core::ids::{CategoryId, GuildId, RoomId};
use fragment_core::provider::FragmentRegistry;

use crate::database::Database;
use crate::parents::ParentRepo;

/// [`FragmentRegistry`] backed by the `parent_rooms` table.
pub struct StoreRegistry {
    parents: ParentRepo,
}

impl StoreRegistry {
    pub fn new(db: Database) -> Self {
        Self {
            parents: ParentRepo::new(db),
        }
    }
}

#[async_trait]
impl FragmentRegistry for StoreRegistry {
    async fn is_fragment_parent(&self, room_id: RoomId) -> Result<Option<CategoryId>, RegistryError> {
        self.parents
            .category_of(room_id)
            .map_err(|e| RegistryError(e.to_string()))
    }

    async fn parent_guilds(&self) -> Result<Vec<GuildId>, RegistryError> {
        self.parents.guilds().map_err(|e| RegistryError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fragment_core::rooms::{ParentRoomConfig, RoomInfo};

    use crate::parents::CategoryRepo;

    fn voice_room(id: u64, category: u64) -> RoomInfo {
        RoomInfo {
            id: RoomId::new(id),
            guild_id: GuildId::new(1),
            name: format!("Room {id}"),
            category_id: Some(CategoryId::new(category)),
            user_limit: None,
        }
    }

    #[tokio::test]
    async fn answers_from_parent_rows() {
        let db = Database::in_memory().unwrap();
        ParentRepo::new(db.clone())
            .register(&ParentRoomConfig {
                room_id: RoomId::new(10),
                category_id: CategoryId::new(3),
                guild_id: GuildId::new(1),
                name: "Lobby".into(),
            })
            .unwrap();

        let registry = StoreRegistry::new(db);
        assert_eq!(
            registry.is_fragment_parent(RoomId::new(10)).await.unwrap(),
            Some(CategoryId::new(3))
        );
        assert_eq!(registry.is_fragment_parent(RoomId::new(11)).await.unwrap(), None);
        assert_eq!(registry.parent_guilds().await.unwrap(), vec![GuildId::new(1)]);
    }

    #[tokio::test]
    async fn category_registration_covers_rooms_present_at_that_time() {
        let db = Database::in_memory().unwrap();
        let categories = CategoryRepo::new(db.clone());
        let (_, added) = categories
            .register(
                GuildId::new(1),
                CategoryId::new(3),
                "Voice",
                &[voice_room(10, 3), voice_room(11, 3), voice_room(20, 4)],
            )
            .unwrap();
        assert_eq!(added, 2);

        let registry = StoreRegistry::new(db);
        assert_eq!(
            registry.is_fragment_parent(RoomId::new(11)).await.unwrap(),
            Some(CategoryId::new(3))
        );
        assert_eq!(registry.is_fragment_parent(RoomId::new(20)).await.unwrap(), None);
        // A room created in the category afterwards is not picked up.
        assert_eq!(registry.is_fragment_parent(RoomId::new(12)).await.unwrap(), None);

        assert_eq!(categories.unregister(CategoryId::new(3)).unwrap(), Some(2));
        assert_eq!(registry.is_fragment_parent(RoomId::new(10)).await.unwrap(), None);
    }
}

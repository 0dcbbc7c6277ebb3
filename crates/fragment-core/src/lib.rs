pub mod errors;
pub mod events;
pub mod ids;
pub mod provider;
pub mod rooms;

pub use errors::{ProviderError, RegistryError};
pub use events::{LifecycleEvent, TransitionEvent};
pub use ids::{CategoryId, EphemeralId, GuildId, RoomId, UserId};
pub use provider::{FragmentRegistry, RoomProvider};
pub use rooms::{EphemeralRoom, OwnershipRecord, ParentRoomConfig, RoomEdit, RoomInfo, RoomState};

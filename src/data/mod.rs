//! Data layer
//!
//! Models, the [`Store`] abstraction the engine consumes persistence
//! through, and the in-memory reference implementation.

mod memory;
mod models;
mod store;

pub use memory::MemoryStore;
pub use models::{
    Activity, ActivityType, Actor, ActorType, Favourite, Follow, FollowState, Notification,
    NotificationType, ObjectType, Reblog, Relay, RelayState, Status, StatusEdit, Visibility,
};
pub use store::{Recipient, ReconcileReport, Store};

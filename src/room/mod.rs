//! Arrangement room domain: data model (C6 types) and state store (C6
//! operations), split the way the teacher splits `sharify::room` (types) from
//! `sharify::room_manager` (the map of rooms and the operations on it).

pub mod model;
pub mod registry;
pub mod store;

pub use model::*;
pub use registry::RoomRegistry;
pub use store::RoomStateStore;

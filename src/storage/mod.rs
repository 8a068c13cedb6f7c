//! Persistent data owned by the stack

pub mod volume;

pub use volume::{Volume, VolumeManager, VOLUMES_FILE};

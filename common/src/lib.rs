pub mod config;
pub mod description;
pub mod entity;
pub mod snapshot;
pub mod topics;
pub mod types;

pub use config::{ConfigEntry, EntryData, EntryOptions, UserInput};
pub use description::{DescriptionError, Descriptions, MetricKey, MetricKind};
pub use entity::{build_entities, DeviceInfo, Entity, EntityKind, EntityState};
pub use snapshot::SnapshotStore;
pub use topics::*;
pub use types::{PayloadError, Snapshot};

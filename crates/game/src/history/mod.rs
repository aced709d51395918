mod changes;
mod config;
mod record;
mod scene;
mod store;

pub use changes::{ChangeSet, FieldChange};
pub use config::HistoryConfig;
pub use record::{ComponentRecord, FieldRecord, Frame};
pub use scene::{FoundRecord, SceneHistory};
pub use store::{PeerKey, ReplicationHistory};

pub mod bits;
pub mod history;
pub mod net;
pub mod reflect;
pub mod sync;
pub mod world;

pub use bits::{BitBuffer, Bits};
pub use history::{ChangeSet, FieldChange, HistoryConfig, PeerKey, ReplicationHistory};
pub use net::{
    Connection, ConnectionState, DEFAULT_PORT, Direction, Dispatcher, Message, NetworkStats, Peer,
    ProtocolError, Scheduler, Server, TransportConfig, TransportError, TransportEvent,
};
pub use reflect::{ObjectId, ReflectError, Replicable, Scene, SceneId, TypeRegistry, type_hash};
pub use sync::{Replicator, StateSync};
pub use world::World;

mod message;
mod replicator;

pub use message::StateSync;
pub use replicator::Replicator;

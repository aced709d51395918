use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use super::message::StateSync;
use crate::history::{PeerKey, ReplicationHistory};
use crate::net::{Dispatcher, Peer, Server, TransportError};
use crate::reflect::SceneId;

/// Turns history into [`StateSync`] messages per peer and applies the ones
/// that arrive.
///
/// A peer's first sync of a scene is a full snapshot at the newest frame;
/// after that it gets the frames in `(last synced, newest]` whenever the
/// history reports pending changes for it.
pub struct Replicator {
    history: Arc<ReplicationHistory>,
    synced: Mutex<HashMap<SocketAddr, HashMap<SceneId, u64>>>,
}

impl Replicator {
    pub fn new(history: Arc<ReplicationHistory>) -> Self {
        Self {
            history,
            synced: Mutex::new(HashMap::new()),
        }
    }

    pub fn history(&self) -> &Arc<ReplicationHistory> {
        &self.history
    }

    pub fn add_peer(&self, addr: SocketAddr) {
        self.history.register_peer(PeerKey::Remote(addr));
        self.synced.lock().entry(addr).or_default();
    }

    pub fn remove_peer(&self, addr: &SocketAddr) {
        self.history.unregister_peer(&PeerKey::Remote(*addr));
        self.synced.lock().remove(addr);
    }

    /// Last timestamp of `scene` sent to `addr`.
    pub fn last_synced(&self, addr: &SocketAddr, scene: SceneId) -> Option<u64> {
        self.synced.lock().get(addr)?.get(&scene).copied()
    }

    /// The messages owed to `addr`, marking them as sent.
    pub fn collect(&self, addr: SocketAddr) -> Vec<StateSync> {
        let plan = self.plan(addr);
        self.commit(addr, &plan.sent_up_to);
        plan.messages
    }

    fn plan(&self, addr: SocketAddr) -> SyncPlan {
        let key = PeerKey::Remote(addr);
        self.history.register_peer(key);
        let pending = self.history.take_pending(&key);

        let synced = self.synced.lock();
        let scenes = synced.get(&addr);
        let mut plan = SyncPlan {
            pending,
            ..SyncPlan::default()
        };
        for scene in self.history.scenes() {
            let Some(history) = self.history.scene(scene) else {
                continue;
            };
            let Some(newest) = history.last_timestamp() else {
                continue;
            };
            match scenes.and_then(|scenes| scenes.get(&scene)).copied() {
                None => {
                    let snapshot = self.history.snapshot(scene, newest);
                    plan.messages
                        .extend(StateSync::chunked(scene, newest, newest, snapshot));
                }
                Some(last) if plan.pending.contains_key(&scene) && newest > last => {
                    let changes = self.history.get_changes_between(scene, last, newest);
                    plan.messages
                        .extend(StateSync::chunked(scene, last, newest, changes));
                }
                Some(_) => continue,
            }
            plan.sent_up_to.push((scene, newest));
        }
        plan
    }

    fn commit(&self, addr: SocketAddr, sent_up_to: &[(SceneId, u64)]) {
        let mut synced = self.synced.lock();
        let scenes = synced.entry(addr).or_default();
        for &(scene, newest) in sent_up_to {
            scenes.insert(scene, newest);
        }
    }

    /// Hands everything owed to `addr` to `send`, in order. The peer's
    /// position only advances once every message went out; on failure its
    /// pending markers are put back so the next sync covers the same range.
    pub fn sync_with(
        &self,
        addr: SocketAddr,
        mut send: impl FnMut(&StateSync) -> Result<(), TransportError>,
    ) -> Result<usize, TransportError> {
        let plan = self.plan(addr);
        for message in &plan.messages {
            if let Err(e) = send(message) {
                self.history
                    .restore_pending(&PeerKey::Remote(addr), plan.pending);
                return Err(e);
            }
        }
        self.commit(addr, &plan.sent_up_to);
        if !plan.messages.is_empty() {
            log::debug!("synced {} messages to {addr}", plan.messages.len());
        }
        Ok(plan.messages.len())
    }

    /// Sends everything owed to one peer. Returns how many messages went out.
    pub fn sync(&self, peer: &Peer) -> Result<usize, TransportError> {
        if !peer.is_connected() {
            return Ok(0);
        }
        self.sync_with(peer.remote_addr(), |message| peer.send(message))
    }

    /// Syncs every connected peer of `server`.
    pub fn sync_all(&self, server: &Server) -> usize {
        let mut sent = 0;
        for peer in server.peers() {
            match self.sync(&peer) {
                Ok(count) => sent += count,
                Err(e) => log::warn!("sync to {} failed: {e}", peer.remote_addr()),
            }
        }
        sent
    }

    /// Writes a received sync into local history.
    pub fn apply(&self, message: &StateSync) -> usize {
        self.history.apply_changes(message.scene, &message.changes)
    }

    /// Routes incoming [`StateSync`] messages to [`apply`](Self::apply).
    pub fn install(self: &Arc<Self>, dispatcher: &Dispatcher) {
        let replicator = Arc::clone(self);
        dispatcher.on::<StateSync, _>(move |message, peer, _direction| {
            let applied = replicator.apply(&message);
            log::debug!(
                "{}: {} from {}: {applied} new records",
                message.scene,
                if message.is_snapshot() { "snapshot" } else { "changes" },
                peer.remote_addr()
            );
        });
    }
}

#[derive(Default)]
struct SyncPlan {
    messages: Vec<StateSync>,
    sent_up_to: Vec<(SceneId, u64)>,
    pending: BTreeMap<SceneId, u64>,
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("peers", &self.synced.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryConfig;
    use crate::reflect::{ObjectId, TypeRegistry, lerp};
    use crate::world::World;

    #[derive(Debug, Default)]
    struct Beacon {
        level: f32,
    }

    crate::impl_replicable!(Beacon);

    const SCENE: SceneId = SceneId(4);

    fn history() -> Arc<ReplicationHistory> {
        let mut registry = TypeRegistry::new();
        registry.register_replicable::<Beacon>();
        crate::reflect_field!(registry, Beacon, level);
        registry.set_interpolator::<Beacon>("level", lerp::<f32>()).unwrap();
        Arc::new(ReplicationHistory::new(Arc::new(registry), HistoryConfig::default()))
    }

    fn set_level(world: &World, id: ObjectId, level: f32) {
        world.get_mut(id, |beacon: &mut Beacon| beacon.level = level);
    }

    #[test]
    fn test_first_sync_is_snapshot_then_deltas() {
        let server = Replicator::new(history());
        let world = World::new(SCENE);
        let id = world.add(Beacon::default());
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        server.history().log(&world, 0);
        set_level(&world, id, 1.0);
        server.history().log(&world, 10);
        server.add_peer(addr);

        let first = server.collect(addr);
        assert_eq!(first.len(), 1);
        assert!(first[0].is_snapshot());
        assert_eq!(first[0].to, 10);
        assert_eq!(server.last_synced(&addr, SCENE), Some(10));

        assert!(server.collect(addr).is_empty());

        set_level(&world, id, 2.0);
        server.history().log(&world, 20);
        set_level(&world, id, 3.0);
        server.history().log(&world, 30);

        let next = server.collect(addr);
        assert_eq!(next.len(), 1);
        assert_eq!((next[0].from, next[0].to), (10, 30));
        assert_eq!(next[0].changes.timestamps().into_iter().collect::<Vec<_>>(), vec![20, 30]);
    }

    #[test]
    fn test_applied_syncs_rebuild_history() {
        let server = Replicator::new(history());
        let client = Replicator::new(history());
        let world = World::new(SCENE);
        let id = world.add(Beacon::default());
        let addr: SocketAddr = "127.0.0.1:4001".parse().unwrap();

        server.history().log(&world, 0);
        for message in server.collect(addr) {
            client.apply(&message);
        }
        set_level(&world, id, 8.0);
        server.history().log(&world, 40);
        for message in server.collect(addr) {
            client.apply(&message);
        }

        let level = client
            .history()
            .get_state(SCENE, 10, id, "level")
            .and_then(|value| value.read::<f32>());
        assert_eq!(level, Some(2.0));
        assert!(client.history().has_pending(&PeerKey::Local));
    }

    #[test]
    fn test_failed_send_is_retried_next_sync() {
        let server = Replicator::new(history());
        let world = World::new(SCENE);
        let id = world.add(Beacon::default());
        let addr: SocketAddr = "127.0.0.1:4002".parse().unwrap();
        server.add_peer(addr);
        let refuse = |_: &StateSync| -> Result<(), TransportError> {
            Err(TransportError::NotConnected)
        };

        server.history().log(&world, 0);
        assert!(server.sync_with(addr, refuse).is_err());
        assert_eq!(server.last_synced(&addr, SCENE), None);

        let mut sent = Vec::new();
        let count = server.sync_with(addr, |message| {
            sent.push(message.clone());
            Ok(())
        });
        assert_eq!(count.unwrap(), 1);
        assert!(sent[0].is_snapshot());
        assert_eq!(server.last_synced(&addr, SCENE), Some(0));

        set_level(&world, id, 5.0);
        server.history().log(&world, 20);
        assert!(server.sync_with(addr, refuse).is_err());
        assert_eq!(server.last_synced(&addr, SCENE), Some(0));
        assert!(server.history().has_pending(&PeerKey::Remote(addr)));

        let retry = server.collect(addr);
        assert_eq!(retry.len(), 1);
        assert_eq!((retry[0].from, retry[0].to), (0, 20));
        assert_eq!(server.last_synced(&addr, SCENE), Some(20));
    }
}

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use super::changes::{ChangeSet, FieldChange};
use super::config::HistoryConfig;
use super::scene::SceneHistory;
use crate::bits::BitBuffer;
use crate::reflect::{
    ObjectId, ReflectError, Replicable, ResolvedField, Scene, SceneId, TypeRegistry,
};

/// Who a pending-update marker is kept for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PeerKey {
    /// The local, offline consumer of history.
    Local,
    Remote(SocketAddr),
}

impl From<SocketAddr> for PeerKey {
    fn from(addr: SocketAddr) -> Self {
        PeerKey::Remote(addr)
    }
}

/// Per-scene, per-timestamp store of replicated field values.
///
/// Only fields whose value changed since their previous record are stored.
/// Lookups walk back (and for interpolation, forward) through the frames
/// to find the records around a timestamp.
pub struct ReplicationHistory {
    registry: Arc<TypeRegistry>,
    log_everything: AtomicBool,
    retention: Option<u64>,
    scenes: RwLock<HashMap<SceneId, Arc<SceneHistory>>>,
    /// Newest changed timestamp per scene not yet taken, per peer.
    pending: Mutex<HashMap<PeerKey, BTreeMap<SceneId, u64>>>,
}

impl ReplicationHistory {
    pub fn new(registry: Arc<TypeRegistry>, config: HistoryConfig) -> Self {
        let mut pending = HashMap::new();
        pending.insert(PeerKey::Local, BTreeMap::new());
        Self {
            registry,
            log_everything: AtomicBool::new(config.log_everything),
            retention: config.retention,
            scenes: RwLock::new(HashMap::new()),
            pending: Mutex::new(pending),
        }
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn log_everything(&self) -> bool {
        self.log_everything.load(Ordering::Relaxed)
    }

    pub fn set_log_everything(&self, enabled: bool) {
        self.log_everything.store(enabled, Ordering::Relaxed);
    }

    pub fn scene(&self, id: SceneId) -> Option<Arc<SceneHistory>> {
        self.scenes.read().get(&id).cloned()
    }

    fn scene_or_insert(&self, id: SceneId) -> Arc<SceneHistory> {
        if let Some(scene) = self.scene(id) {
            return scene;
        }
        Arc::clone(
            self.scenes
                .write()
                .entry(id)
                .or_insert_with(|| Arc::new(SceneHistory::new(id))),
        )
    }

    pub fn scenes(&self) -> Vec<SceneId> {
        let mut ids: Vec<SceneId> = self.scenes.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn remove_scene(&self, id: SceneId) -> bool {
        let removed = self.scenes.write().remove(&id).is_some();
        if removed {
            for scenes in self.pending.lock().values_mut() {
                scenes.remove(&id);
            }
        }
        removed
    }

    /// Records every leaf field of every object in `scene` that changed
    /// since its previous record. Returns how many field records were stored.
    pub fn log(&self, scene: &dyn Scene, timestamp: u64) -> usize {
        let id = scene.id();
        let history = self.scene_or_insert(id);
        let log_everything = self.log_everything();
        let _writer = history.lock_writer();

        let mut layouts: HashMap<u32, Vec<ResolvedField>> = HashMap::new();
        let mut changed: Vec<(ObjectId, u32, String, BitBuffer)> = Vec::new();
        scene.for_each_object(&mut |object_id, object| {
            let type_hash = object.type_hash();
            let fields = layouts.entry(type_hash).or_insert_with(|| {
                self.registry.leaf_fields(type_hash).unwrap_or_else(|e| {
                    log::debug!("{id}: not logging {object_id}: {e}");
                    Vec::new()
                })
            });
            for field in fields.iter() {
                let value = match self.registry.read_resolved(object, field) {
                    Ok(value) => value,
                    Err(ReflectError::NullReference(_)) => continue,
                    Err(e) => {
                        log::debug!("{id}: skipping {object_id}.{}: {e}", field.path);
                        continue;
                    }
                };
                if !log_everything {
                    let previous = history.latest_at_or_before(object_id, &field.path, timestamp);
                    let unchanged = previous.is_some_and(|previous| {
                        field.hooks.unchanged(&previous.record.value, &value)
                    });
                    if unchanged {
                        continue;
                    }
                }
                changed.push((object_id, type_hash, field.path.clone(), value));
            }
        });

        let stored = changed.len();
        for (object, type_hash, field, value) in changed {
            history.insert(timestamp, object, type_hash, &field, value);
        }
        if stored > 0 {
            self.mark_pending(id, timestamp);
        }
        stored
    }

    /// Value of one field at `timestamp`: the latest record at or before it,
    /// blended toward the next record when the field has an interpolator.
    pub fn get_state(
        &self,
        scene: SceneId,
        timestamp: u64,
        object: ObjectId,
        field: &str,
    ) -> Option<BitBuffer> {
        let history = self.scene(scene)?;
        let found = history.latest_at_or_before(object, field, timestamp)?;
        if found.timestamp == timestamp {
            return Some(found.record.value);
        }

        let interpolator = self
            .registry
            .resolve_field(found.type_hash, field)
            .ok()
            .and_then(|resolved| resolved.hooks.interpolator);
        let Some(interpolator) = interpolator else {
            return Some(found.record.value);
        };
        let Some(next) = history.next_after(object, field, timestamp) else {
            return Some(found.record.value);
        };

        let distance =
            (timestamp - found.timestamp) as f32 / (next.timestamp - found.timestamp) as f32;
        match interpolator(&found.record.value, &next.record.value, distance) {
            Some(value) => Some(value),
            None => {
                log::debug!("{scene}: interpolating {object}.{field} failed");
                Some(found.record.value)
            }
        }
    }

    /// The fields recorded exactly at `timestamp`.
    pub fn get_changes(&self, scene: SceneId, timestamp: u64) -> ChangeSet {
        let Some(frame) = self.scene(scene).and_then(|history| history.frame(timestamp)) else {
            return ChangeSet::new();
        };
        frame
            .components()
            .into_iter()
            .flat_map(|(object, component)| {
                let type_hash = component.type_hash;
                component.fields.into_iter().map(move |(field, record)| FieldChange {
                    timestamp,
                    object,
                    type_hash,
                    field,
                    value: record.value,
                })
            })
            .collect()
    }

    /// Every record in frames with `from_exclusive < timestamp <= to_inclusive`,
    /// each tagged with its own frame's timestamp.
    pub fn get_changes_between(
        &self,
        scene: SceneId,
        from_exclusive: u64,
        to_inclusive: u64,
    ) -> ChangeSet {
        let Some(history) = self.scene(scene) else {
            return ChangeSet::new();
        };
        let mut changes = Vec::new();
        for frame in history.frames_between(from_exclusive, to_inclusive) {
            let timestamp = frame.timestamp();
            for (object, component) in frame.components() {
                for (field, record) in component.fields {
                    changes.push(FieldChange {
                        timestamp,
                        object,
                        type_hash: component.type_hash,
                        field,
                        value: record.value,
                    });
                }
            }
        }
        changes.into_iter().collect()
    }

    /// The state of every field known at `timestamp`, tagged with it.
    /// Sent to peers that have nothing yet.
    pub fn snapshot(&self, scene: SceneId, timestamp: u64) -> ChangeSet {
        let Some(history) = self.scene(scene) else {
            return ChangeSet::new();
        };
        let mut known: BTreeMap<(ObjectId, String), u32> = BTreeMap::new();
        for frame in history.frames_until(timestamp) {
            for (object, type_hash, field) in frame.keys() {
                known.insert((object, field), type_hash);
            }
        }

        known
            .into_iter()
            .filter_map(|((object, field), type_hash)| {
                let value = self.get_state(scene, timestamp, object, &field)?;
                Some(FieldChange {
                    timestamp,
                    object,
                    type_hash,
                    field,
                    value,
                })
            })
            .collect()
    }

    /// Builds fresh objects through the registry factories holding the
    /// state at `timestamp`.
    pub fn get_objects(
        &self,
        scene: SceneId,
        timestamp: u64,
    ) -> Vec<(ObjectId, Box<dyn Replicable>)> {
        let snapshot = self.snapshot(scene, timestamp);
        let mut objects: BTreeMap<ObjectId, Box<dyn Replicable>> = BTreeMap::new();
        for change in &snapshot {
            if !objects.contains_key(&change.object) {
                match self.registry.create(change.type_hash) {
                    Some(object) => {
                        objects.insert(change.object, object);
                    }
                    None => {
                        log::debug!("{scene}: no factory for type {:#010x}", change.type_hash);
                        continue;
                    }
                }
            }
            if let Some(object) = objects.get_mut(&change.object) {
                self.write(object.as_mut(), change);
            }
        }
        objects.into_iter().collect()
    }

    /// Writes the state at `timestamp` into the live objects of `scene`,
    /// spawning objects it does not have yet. Returns how many fields
    /// were written.
    pub fn apply_state(&self, scene: &dyn Scene, timestamp: u64) -> usize {
        let id = scene.id();
        let snapshot = self.snapshot(id, timestamp);
        let mut by_object: BTreeMap<ObjectId, Vec<&FieldChange>> = BTreeMap::new();
        for change in &snapshot {
            by_object.entry(change.object).or_default().push(change);
        }

        let mut written = 0;
        for (object_id, changes) in by_object {
            let found = scene.with_object_mut(object_id, &mut |object| {
                for change in &changes {
                    if self.write(object, change) {
                        written += 1;
                    }
                }
            });
            if found {
                continue;
            }

            let Some(mut object) = self.registry.create(changes[0].type_hash) else {
                log::debug!("{id}: cannot create {object_id}");
                continue;
            };
            for change in &changes {
                if self.write(object.as_mut(), change) {
                    written += 1;
                }
            }
            scene.spawn(object_id, object);
        }
        written
    }

    fn write(&self, object: &mut dyn Replicable, change: &FieldChange) -> bool {
        let value = change.value.clone();
        value.set_read_position(0);
        match self.registry.write_field(object, &change.field, &value) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("cannot write {}.{}: {e}", change.object, change.field);
                false
            }
        }
    }

    /// Inserts remote records into local history in timestamp order.
    /// Records already present with the same value are skipped, so applying
    /// a change set twice changes nothing. Returns how many were inserted.
    pub fn apply_changes(&self, scene: SceneId, changes: &ChangeSet) -> usize {
        if changes.is_empty() {
            return 0;
        }
        let history = self.scene_or_insert(scene);
        let applied = {
            let _writer = history.lock_writer();
            let mut applied = 0;
            for change in changes {
                let existing = history
                    .frame(change.timestamp)
                    .and_then(|frame| frame.record(change.object, &change.field));
                if existing.is_some_and(|(_, record)| record.value == change.value) {
                    continue;
                }
                history.insert(
                    change.timestamp,
                    change.object,
                    change.type_hash,
                    &change.field,
                    change.value.clone(),
                );
                applied += 1;
            }
            applied
        };

        log::debug!("{scene}: applied {applied} of {} changes", changes.len());
        if applied > 0 {
            if let Some(latest) = changes.latest_timestamp() {
                self.mark_pending(scene, latest);
            }
        }
        applied
    }

    /// Runs the field's difference function over its states at `from` and `to`.
    pub fn difference(
        &self,
        scene: SceneId,
        object: ObjectId,
        field: &str,
        from: u64,
        to: u64,
    ) -> Option<BitBuffer> {
        let history = self.scene(scene)?;
        let type_hash = history.latest_at_or_before(object, field, to.max(from))?.type_hash;
        let difference = self
            .registry
            .resolve_field(type_hash, field)
            .ok()?
            .hooks
            .difference?;
        let start = self.get_state(scene, from, object, field)?;
        let end = self.get_state(scene, to, object, field)?;
        difference(&start, &end)
    }

    pub fn remove(&self, scene: SceneId, timestamp: u64) -> bool {
        self.scene(scene).is_some_and(|history| history.remove(timestamp))
    }

    pub fn remove_before(&self, scene: SceneId, timestamp: u64) -> usize {
        let removed = self
            .scene(scene)
            .map_or(0, |history| history.remove_before(timestamp));
        log::debug!("{scene}: removed {removed} frames before {timestamp}");
        removed
    }

    pub fn remove_after(&self, scene: SceneId, timestamp: u64) -> usize {
        let removed = self
            .scene(scene)
            .map_or(0, |history| history.remove_after(timestamp));
        log::debug!("{scene}: removed {removed} frames after {timestamp}");
        removed
    }

    /// Drops frames older than the configured retention behind `now`.
    ///
    /// Fields whose newest record would be dropped are first carried
    /// forward to the cutoff so their state stays known. Both steps run
    /// under one writer lock.
    pub fn prune(&self, scene: SceneId, now: u64) -> usize {
        let (Some(retention), Some(history)) = (self.retention, self.scene(scene)) else {
            return 0;
        };
        let cutoff = now.saturating_sub(retention);
        if history.first_timestamp().is_none_or(|first| first >= cutoff) {
            return 0;
        }

        let _writer = history.lock_writer();
        let mut carried: BTreeMap<(ObjectId, String), u32> = BTreeMap::new();
        for frame in history.frames_until(cutoff) {
            for (object, type_hash, field) in frame.keys() {
                carried.insert((object, field), type_hash);
            }
        }
        for ((object, field), type_hash) in carried {
            if let Some(latest) = history.latest_at_or_before(object, &field, cutoff) {
                if latest.timestamp < cutoff {
                    history.insert(cutoff, object, type_hash, &field, latest.record.value);
                }
            }
        }
        let removed = history.remove_before_locked(cutoff);
        log::debug!("{scene}: pruned {removed} frames before {cutoff}");
        removed
    }

    pub fn register_peer(&self, peer: PeerKey) {
        self.pending.lock().entry(peer).or_default();
    }

    pub fn unregister_peer(&self, peer: &PeerKey) -> bool {
        self.pending.lock().remove(peer).is_some()
    }

    pub fn peers(&self) -> Vec<PeerKey> {
        let mut peers: Vec<PeerKey> = self.pending.lock().keys().copied().collect();
        peers.sort();
        peers
    }

    pub fn has_pending(&self, peer: &PeerKey) -> bool {
        self.pending
            .lock()
            .get(peer)
            .is_some_and(|scenes| !scenes.is_empty())
    }

    /// Scenes with changes since the last call for `peer`, with the newest
    /// changed timestamp of each.
    pub fn take_pending(&self, peer: &PeerKey) -> BTreeMap<SceneId, u64> {
        self.pending
            .lock()
            .get_mut(peer)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Puts markers returned by [`take_pending`](Self::take_pending) back,
    /// keeping any newer ones recorded since.
    pub fn restore_pending(&self, peer: &PeerKey, taken: BTreeMap<SceneId, u64>) {
        let mut pending = self.pending.lock();
        let Some(scenes) = pending.get_mut(peer) else {
            return;
        };
        for (scene, timestamp) in taken {
            let newest = scenes.entry(scene).or_insert(timestamp);
            *newest = (*newest).max(timestamp);
        }
    }

    fn mark_pending(&self, scene: SceneId, timestamp: u64) {
        for scenes in self.pending.lock().values_mut() {
            let newest = scenes.entry(scene).or_insert(timestamp);
            *newest = (*newest).max(timestamp);
        }
    }
}

impl std::fmt::Debug for ReplicationHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationHistory")
            .field("scenes", &self.scenes.read().len())
            .field("log_everything", &self.log_everything())
            .field("retention", &self.retention)
            .finish()
    }
}

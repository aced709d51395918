use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use super::record::{FieldRecord, Frame};
use crate::bits::BitBuffer;
use crate::reflect::{ObjectId, SceneId};

/// A located record: frame timestamp, owning type and the record itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundRecord {
    pub timestamp: u64,
    pub type_hash: u32,
    pub record: FieldRecord,
}

/// Frames of one scene ordered by timestamp.
///
/// Lock order is `writer`, then `frames`, then a single frame's own lock.
/// Record searches walk the map under a read guard and lock one frame at a
/// time; everything else reads frame contents through cloned `Arc<Frame>`
/// handles. Writers (log, apply, prune) serialize on `writer` so each
/// field's delta chain is updated as a unit.
#[derive(Debug)]
pub struct SceneHistory {
    id: SceneId,
    frames: RwLock<BTreeMap<u64, Arc<Frame>>>,
    writer: Mutex<()>,
}

impl SceneHistory {
    pub fn new(id: SceneId) -> Self {
        Self {
            id,
            frames: RwLock::new(BTreeMap::new()),
            writer: Mutex::new(()),
        }
    }

    pub fn id(&self) -> SceneId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.frames.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.read().is_empty()
    }

    pub fn timestamps(&self) -> Vec<u64> {
        self.frames.read().keys().copied().collect()
    }

    pub fn first_timestamp(&self) -> Option<u64> {
        self.frames.read().keys().next().copied()
    }

    pub fn last_timestamp(&self) -> Option<u64> {
        self.frames.read().keys().next_back().copied()
    }

    pub fn frame(&self, timestamp: u64) -> Option<Arc<Frame>> {
        self.frames.read().get(&timestamp).cloned()
    }

    /// The latest frame at or before `timestamp`.
    pub fn frame_at_or_before(&self, timestamp: u64) -> Option<Arc<Frame>> {
        self.frames
            .read()
            .range(..=timestamp)
            .next_back()
            .map(|(_, frame)| Arc::clone(frame))
    }

    pub(crate) fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock()
    }

    fn collect(&self, range: (Bound<u64>, Bound<u64>)) -> Vec<Arc<Frame>> {
        self.frames.read().range(range).map(|(_, frame)| Arc::clone(frame)).collect()
    }

    /// Frames with `from < timestamp <= to`, ascending.
    pub fn frames_between(&self, from_exclusive: u64, to_inclusive: u64) -> Vec<Arc<Frame>> {
        if to_inclusive <= from_exclusive {
            return Vec::new();
        }
        self.collect((Bound::Excluded(from_exclusive), Bound::Included(to_inclusive)))
    }

    /// Frames with `timestamp <= to`, ascending.
    pub fn frames_until(&self, to_inclusive: u64) -> Vec<Arc<Frame>> {
        self.collect((Bound::Unbounded, Bound::Included(to_inclusive)))
    }

    /// Most recent record of the field in `bound`, searching backward.
    fn search_back(&self, object: ObjectId, field: &str, bound: Bound<u64>) -> Option<FoundRecord> {
        let frames = self.frames.read();
        frames
            .range((Bound::Unbounded, bound))
            .rev()
            .find_map(|(_, frame)| found(frame, object, field))
    }

    fn search_forward(&self, object: ObjectId, field: &str, after: u64) -> Option<FoundRecord> {
        let frames = self.frames.read();
        frames
            .range((Bound::Excluded(after), Bound::Unbounded))
            .find_map(|(_, frame)| found(frame, object, field))
    }

    pub fn latest_at_or_before(
        &self,
        object: ObjectId,
        field: &str,
        timestamp: u64,
    ) -> Option<FoundRecord> {
        self.search_back(object, field, Bound::Included(timestamp))
    }

    pub fn latest_before(
        &self,
        object: ObjectId,
        field: &str,
        timestamp: u64,
    ) -> Option<FoundRecord> {
        self.search_back(object, field, Bound::Excluded(timestamp))
    }

    pub fn next_after(&self, object: ObjectId, field: &str, timestamp: u64) -> Option<FoundRecord> {
        self.search_forward(object, field, timestamp)
    }

    /// Stores `value` for the field at `timestamp` and keeps the field's
    /// delta chain linked on both sides. Callers hold the writer lock.
    ///
    /// Returns the delta to the previous record, 0 when there is none.
    pub(crate) fn insert(
        &self,
        timestamp: u64,
        object: ObjectId,
        type_hash: u32,
        field: &str,
        value: BitBuffer,
    ) -> u64 {
        let delta_time = self
            .latest_before(object, field, timestamp)
            .map(|previous| timestamp - previous.timestamp)
            .unwrap_or(0);

        let frame = {
            let mut frames = self.frames.write();
            Arc::clone(
                frames
                    .entry(timestamp)
                    .or_insert_with(|| Arc::new(Frame::new(timestamp))),
            )
        };
        frame.insert(object, type_hash, field, FieldRecord::new(delta_time, value));

        if let Some(next) = self.next_after(object, field, timestamp) {
            if let Some(frame) = self.frame(next.timestamp) {
                frame.set_delta(object, field, next.timestamp - timestamp);
            }
        }
        delta_time
    }

    /// Erases the frame at `timestamp`. Returns whether one existed.
    pub fn remove(&self, timestamp: u64) -> bool {
        let _writer = self.lock_writer();
        let removed = self.frames.write().remove(&timestamp);
        match removed {
            Some(frame) => {
                self.relink(&keys_of(&[frame]));
                true
            }
            None => false,
        }
    }

    /// Erases every frame older than `timestamp`. Returns how many went.
    pub fn remove_before(&self, timestamp: u64) -> usize {
        let _writer = self.lock_writer();
        self.remove_before_locked(timestamp)
    }

    /// [`remove_before`](Self::remove_before) for callers already holding
    /// the writer lock.
    pub(crate) fn remove_before_locked(&self, timestamp: u64) -> usize {
        let removed: Vec<Arc<Frame>> = {
            let mut frames = self.frames.write();
            let kept = frames.split_off(&timestamp);
            std::mem::replace(&mut *frames, kept).into_values().collect()
        };
        self.relink(&keys_of(&removed));
        removed.len()
    }

    /// Erases every frame newer than `timestamp`. Returns how many went.
    pub fn remove_after(&self, timestamp: u64) -> usize {
        let _writer = self.lock_writer();
        let Some(first_removed) = timestamp.checked_add(1) else {
            return 0;
        };
        let removed = self.frames.write().split_off(&first_removed);
        // Nothing later survives, so no remaining delta referred to these.
        removed.len()
    }

    /// Recomputes the delta chain of each field in `keys` across all frames.
    fn relink(&self, keys: &BTreeSet<(ObjectId, String)>) {
        if keys.is_empty() {
            return;
        }
        let frames = self.collect((Bound::Unbounded, Bound::Unbounded));
        let mut last_seen: BTreeMap<&(ObjectId, String), u64> = BTreeMap::new();
        for frame in &frames {
            for key in keys {
                if frame.record(key.0, &key.1).is_none() {
                    continue;
                }
                let delta = last_seen
                    .insert(key, frame.timestamp())
                    .map(|previous| frame.timestamp() - previous)
                    .unwrap_or(0);
                frame.set_delta(key.0, &key.1, delta);
            }
        }
        log::debug!("{}: relinked {} field chains", self.id, keys.len());
    }
}

fn found(frame: &Frame, object: ObjectId, field: &str) -> Option<FoundRecord> {
    frame
        .record(object, field)
        .map(|(type_hash, record)| FoundRecord {
            timestamp: frame.timestamp(),
            type_hash,
            record,
        })
}

fn keys_of(frames: &[Arc<Frame>]) -> BTreeSet<(ObjectId, String)> {
    frames
        .iter()
        .flat_map(|frame| frame.keys())
        .map(|(object, _, field)| (object, field))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const OBJECT: ObjectId = ObjectId(7);
    const TYPE: u32 = 0xdead_beef;

    fn value(v: f32) -> BitBuffer {
        let buffer = BitBuffer::new();
        buffer.write(&v);
        buffer
    }

    fn insert(scene: &SceneHistory, timestamp: u64, v: f32) -> u64 {
        let _writer = scene.lock_writer();
        scene.insert(timestamp, OBJECT, TYPE, "x", value(v))
    }

    fn delta(scene: &SceneHistory, timestamp: u64) -> u64 {
        scene
            .frame(timestamp)
            .and_then(|frame| frame.record(OBJECT, "x"))
            .map(|(_, record)| record.delta_time)
            .unwrap()
    }

    #[test]
    fn test_insert_links_deltas() {
        let scene = SceneHistory::new(SceneId(1));
        assert_eq!(insert(&scene, 10, 1.0), 0);
        assert_eq!(insert(&scene, 25, 2.0), 15);
        assert_eq!(scene.timestamps(), vec![10, 25]);
    }

    #[test]
    fn test_out_of_order_insert_relinks_successor() {
        let scene = SceneHistory::new(SceneId(1));
        insert(&scene, 10, 1.0);
        insert(&scene, 30, 3.0);
        assert_eq!(delta(&scene, 30), 20);

        assert_eq!(insert(&scene, 20, 2.0), 10);
        assert_eq!(delta(&scene, 30), 10);
        assert_eq!(delta(&scene, 10), 0);
    }

    #[test]
    fn test_lookups() {
        let scene = SceneHistory::new(SceneId(1));
        insert(&scene, 10, 1.0);
        insert(&scene, 30, 3.0);

        assert_eq!(scene.latest_at_or_before(OBJECT, "x", 30).unwrap().timestamp, 30);
        assert_eq!(scene.latest_before(OBJECT, "x", 30).unwrap().timestamp, 10);
        assert_eq!(scene.latest_at_or_before(OBJECT, "x", 29).unwrap().timestamp, 10);
        assert!(scene.latest_at_or_before(OBJECT, "x", 9).is_none());
        assert_eq!(scene.next_after(OBJECT, "x", 10).unwrap().timestamp, 30);
        assert!(scene.next_after(OBJECT, "x", 30).is_none());
        assert!(scene.latest_at_or_before(OBJECT, "y", 30).is_none());
    }

    #[test]
    fn test_remove_relinks_over_gap() {
        let scene = SceneHistory::new(SceneId(1));
        insert(&scene, 10, 1.0);
        insert(&scene, 20, 2.0);
        insert(&scene, 35, 3.0);

        assert!(scene.remove(20));
        assert!(!scene.remove(20));
        assert_eq!(scene.timestamps(), vec![10, 35]);
        assert_eq!(delta(&scene, 35), 25);
    }

    #[test]
    fn test_remove_before_resets_first_delta() {
        let scene = SceneHistory::new(SceneId(1));
        for (ts, v) in [(10, 1.0), (20, 2.0), (30, 3.0)] {
            insert(&scene, ts, v);
        }

        assert_eq!(scene.remove_before(20), 1);
        assert_eq!(scene.timestamps(), vec![20, 30]);
        assert_eq!(delta(&scene, 20), 0);
        assert_eq!(delta(&scene, 30), 10);
    }

    #[test]
    fn test_lookups_skip_frames_without_the_field() {
        let scene = SceneHistory::new(SceneId(1));
        insert(&scene, 10, 1.0);
        {
            let _writer = scene.lock_writer();
            for ts in 11..40 {
                scene.insert(ts, ObjectId(8), TYPE, "x", value(0.0));
            }
        }
        insert(&scene, 40, 4.0);

        let back = scene.latest_at_or_before(OBJECT, "x", 39).unwrap();
        assert_eq!((back.timestamp, back.record.value.read::<f32>()), (10, Some(1.0)));
        assert_eq!(scene.next_after(OBJECT, "x", 10).unwrap().timestamp, 40);
        assert_eq!(delta(&scene, 40), 30);
    }

    #[test]
    fn test_remove_after_keeps_boundary() {
        let scene = SceneHistory::new(SceneId(1));
        for (ts, v) in [(10, 1.0), (20, 2.0), (30, 3.0)] {
            insert(&scene, ts, v);
        }

        assert_eq!(scene.remove_after(20), 1);
        assert_eq!(scene.timestamps(), vec![10, 20]);
        assert_eq!(scene.remove_after(u64::MAX), 0);
    }

    #[test]
    fn test_frames_between_is_half_open() {
        let scene = SceneHistory::new(SceneId(1));
        for (ts, v) in [(0, 0.0), (10, 1.0), (30, 3.0)] {
            insert(&scene, ts, v);
        }

        let stamps: Vec<u64> = scene
            .frames_between(0, 30)
            .iter()
            .map(|frame| frame.timestamp())
            .collect();
        assert_eq!(stamps, vec![10, 30]);
        assert!(scene.frames_between(30, 30).is_empty());
        assert!(scene.frames_between(30, 10).is_empty());
    }
}

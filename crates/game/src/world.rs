use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::reflect::{ObjectId, Replicable, Scene, SceneId};

/// In-memory scene: replicable objects keyed by id behind one lock.
pub struct World {
    id: SceneId,
    objects: RwLock<BTreeMap<ObjectId, Box<dyn Replicable>>>,
    next_object_id: AtomicU64,
}

impl World {
    pub fn new(id: SceneId) -> Self {
        Self {
            id,
            objects: RwLock::new(BTreeMap::new()),
            next_object_id: AtomicU64::new(1),
        }
    }

    /// Stores `object` under the next id no other object holds.
    pub fn add<T: Replicable>(&self, object: T) -> ObjectId {
        let mut objects = self.objects.write();
        let mut id = ObjectId(self.next_object_id.fetch_add(1, Ordering::Relaxed));
        while objects.contains_key(&id) {
            id = ObjectId(self.next_object_id.fetch_add(1, Ordering::Relaxed));
        }
        objects.insert(id, Box::new(object));
        id
    }

    /// Ids come off the wire, so any value is accepted.
    pub fn add_with_id(&self, id: ObjectId, object: Box<dyn Replicable>) {
        self.next_object_id
            .fetch_max(id.0.saturating_add(1), Ordering::Relaxed);
        self.objects.write().insert(id, object);
    }

    pub fn despawn(&self, id: ObjectId) -> Option<Box<dyn Replicable>> {
        self.objects.write().remove(&id)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.read().contains_key(&id)
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    pub fn ids(&self) -> Vec<ObjectId> {
        self.objects.read().keys().copied().collect()
    }

    /// Runs `f` on the object if it exists and is a `T`.
    pub fn get<T: Replicable, R>(&self, id: ObjectId, f: impl FnOnce(&T) -> R) -> Option<R> {
        let objects = self.objects.read();
        let object = objects.get(&id)?.as_any().downcast_ref::<T>()?;
        Some(f(object))
    }

    pub fn get_mut<T: Replicable, R>(
        &self,
        id: ObjectId,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let mut objects = self.objects.write();
        let object = objects.get_mut(&id)?.as_any_mut().downcast_mut::<T>()?;
        Some(f(object))
    }

    /// Runs `f` on every `T` in the world.
    pub fn for_each_mut<T: Replicable>(&self, mut f: impl FnMut(ObjectId, &mut T)) {
        let mut objects = self.objects.write();
        for (&id, object) in objects.iter_mut() {
            if let Some(object) = object.as_any_mut().downcast_mut::<T>() {
                f(id, object);
            }
        }
    }
}

impl Scene for World {
    fn id(&self) -> SceneId {
        self.id
    }

    fn for_each_object(&self, visit: &mut dyn FnMut(ObjectId, &dyn Replicable)) {
        let objects = self.objects.read();
        for (&id, object) in objects.iter() {
            visit(id, &**object);
        }
    }

    fn with_object_mut(&self, id: ObjectId, apply: &mut dyn FnMut(&mut dyn Replicable)) -> bool {
        let mut objects = self.objects.write();
        match objects.get_mut(&id) {
            Some(object) => {
                apply(&mut **object);
                true
            }
            None => false,
        }
    }

    fn spawn(&self, id: ObjectId, object: Box<dyn Replicable>) {
        self.add_with_id(id, object);
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("id", &self.id)
            .field("objects", &self.object_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Counter {
        value: u32,
    }

    crate::impl_replicable!(Counter);

    #[test]
    fn test_add_and_access() {
        let world = World::new(SceneId(3));
        let id = world.add(Counter { value: 4 });

        assert_eq!(world.get(id, |c: &Counter| c.value), Some(4));
        world.get_mut(id, |c: &mut Counter| c.value += 1);
        assert_eq!(world.get(id, |c: &Counter| c.value), Some(5));
        assert_eq!(world.get(ObjectId(99), |c: &Counter| c.value), None);
    }

    #[test]
    fn test_spawned_ids_are_not_reused() {
        let world = World::new(SceneId(3));
        world.spawn(ObjectId(10), Box::new(Counter::default()));
        let next = world.add(Counter::default());
        assert!(next.0 > 10);
        assert_eq!(world.object_count(), 2);

        assert!(world.despawn(next).is_some());
        assert!(!world.contains(next));
    }

    #[test]
    fn test_highest_possible_id_can_be_spawned() {
        let world = World::new(SceneId(3));
        world.spawn(ObjectId(u64::MAX), Box::new(Counter { value: 9 }));

        let next = world.add(Counter { value: 1 });
        assert_ne!(next, ObjectId(u64::MAX));
        assert_eq!(world.object_count(), 2);
        assert_eq!(world.get(ObjectId(u64::MAX), |c: &Counter| c.value), Some(9));
        assert_eq!(world.get(next, |c: &Counter| c.value), Some(1));
    }

    #[test]
    fn test_scene_visits_every_object() {
        let world = World::new(SceneId(3));
        world.add(Counter { value: 1 });
        world.add(Counter { value: 2 });

        let mut seen = Vec::new();
        world.for_each_object(&mut |id, _| seen.push(id));
        assert_eq!(seen, world.ids());

        let hit = world.with_object_mut(seen[0], &mut |object| {
            if let Some(counter) = object.as_any_mut().downcast_mut::<Counter>() {
                counter.value = 7;
            }
        });
        assert!(hit);
        assert_eq!(world.get(seen[0], |c: &Counter| c.value), Some(7));
    }
}

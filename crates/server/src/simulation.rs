use std::sync::Arc;

use glam::{Quat, Vec3};
use strata::reflect::lerp;
use strata::{SceneId, TypeRegistry, World};

pub const SCENE: SceneId = SceneId(1);

const GRAVITY: f32 = 9.8;
const ARENA_HALF_EXTENT: f32 = 20.0;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub orientation: Quat,
}

#[derive(Debug, Default)]
pub struct Drone {
    pub transform: Transform,
    pub velocity: Vec3,
    pub bounces: u32,
}

strata::impl_replicable!(Drone);

/// Layouts shared by server and client; both sides must agree on them.
pub fn registry() -> anyhow::Result<Arc<TypeRegistry>> {
    let mut registry = TypeRegistry::new();
    strata::reflect_field!(registry, Transform, position);
    strata::reflect_field!(registry, Transform, orientation);
    registry.register_replicable::<Drone>();
    strata::reflect_field!(registry, Drone, transform);
    strata::reflect_field!(registry, Drone, velocity);
    strata::reflect_field!(registry, Drone, bounces);

    registry.set_interpolator::<Transform>("position", lerp::<Vec3>())?;
    registry.set_interpolator::<Transform>("orientation", lerp::<Quat>())?;
    registry.set_interpolator::<Drone>("velocity", lerp::<Vec3>())?;
    Ok(Arc::new(registry))
}

pub fn spawn_drones(world: &World, count: usize) {
    for index in 0..count {
        let angle = index as f32 / count.max(1) as f32 * std::f32::consts::TAU;
        let (sin, cos) = angle.sin_cos();
        world.add(Drone {
            transform: Transform {
                position: Vec3::new(cos * 5.0, 2.0 + index as f32, sin * 5.0),
                orientation: Quat::IDENTITY,
            },
            velocity: Vec3::new(-sin * 4.0, 6.0, cos * 4.0),
            bounces: 0,
        });
    }
}

pub fn simulate_world(world: &World, dt: f32) {
    world.for_each_mut(|_, drone: &mut Drone| simulate_drone(drone, dt));
}

fn simulate_drone(drone: &mut Drone, dt: f32) {
    drone.velocity.y -= GRAVITY * dt;
    drone.transform.position += drone.velocity * dt;

    if drone.transform.position.y < 0.0 {
        drone.transform.position.y = 0.0;
        drone.velocity.y = drone.velocity.y.abs();
        drone.bounces += 1;
    }
    for axis in [0, 2] {
        if drone.transform.position[axis].abs() > ARENA_HALF_EXTENT {
            drone.transform.position[axis] =
                drone.transform.position[axis].clamp(-ARENA_HALF_EXTENT, ARENA_HALF_EXTENT);
            drone.velocity[axis] = -drone.velocity[axis];
        }
    }

    let horizontal = Vec3::new(drone.velocity.x, 0.0, drone.velocity.z);
    if horizontal.length_squared() > 0.001 {
        let yaw = horizontal.x.atan2(horizontal.z);
        drone.transform.orientation = Quat::from_rotation_y(yaw);
    }
}

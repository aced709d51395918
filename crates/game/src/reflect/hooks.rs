use std::any::Any;
use std::ops::{Add, Sub};
use std::sync::Arc;

use glam::{Quat, Vec2, Vec3};

use crate::bits::{BitBuffer, Bits};

/// Reports whether two serialized values count as unchanged.
pub type Comparator = Arc<dyn Fn(&BitBuffer, &BitBuffer) -> bool + Send + Sync>;
/// Blends two serialized values; `t` runs from 0 (first) to 1 (second).
pub type Interpolator = Arc<dyn Fn(&BitBuffer, &BitBuffer, f32) -> Option<BitBuffer> + Send + Sync>;
/// `second - first`, serialized.
pub type Difference = Arc<dyn Fn(&BitBuffer, &BitBuffer) -> Option<BitBuffer> + Send + Sync>;
/// `first + second`, serialized.
pub type Accumulator = Arc<dyn Fn(&BitBuffer, &BitBuffer) -> Option<BitBuffer> + Send + Sync>;
/// Runs on the object that owns a field, around a write to that field.
pub type MutationHook = Arc<dyn Fn(&mut dyn Any) + Send + Sync>;

#[derive(Clone, Default)]
pub struct FieldHooks {
    pub comparator: Option<Comparator>,
    pub interpolator: Option<Interpolator>,
    pub difference: Option<Difference>,
    pub accumulator: Option<Accumulator>,
    pub pre_hook: Option<MutationHook>,
    pub post_hook: Option<MutationHook>,
}

impl FieldHooks {
    /// Uses the registered comparator, falling back to bit equality.
    pub fn unchanged(&self, previous: &BitBuffer, current: &BitBuffer) -> bool {
        match &self.comparator {
            Some(comparator) => comparator(previous, current),
            None => previous == current,
        }
    }
}

impl std::fmt::Debug for FieldHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldHooks")
            .field("comparator", &self.comparator.is_some())
            .field("interpolator", &self.interpolator.is_some())
            .field("difference", &self.difference.is_some())
            .field("accumulator", &self.accumulator.is_some())
            .field("pre_hook", &self.pre_hook.is_some())
            .field("post_hook", &self.post_hook.is_some())
            .finish()
    }
}

pub trait Lerp {
    fn lerp_to(&self, other: &Self, t: f32) -> Self;
}

impl Lerp for f32 {
    fn lerp_to(&self, other: &Self, t: f32) -> Self {
        self + (other - self) * t
    }
}

impl Lerp for f64 {
    fn lerp_to(&self, other: &Self, t: f32) -> Self {
        self + (other - self) * f64::from(t)
    }
}

impl Lerp for Vec2 {
    fn lerp_to(&self, other: &Self, t: f32) -> Self {
        self.lerp(*other, t)
    }
}

impl Lerp for Vec3 {
    fn lerp_to(&self, other: &Self, t: f32) -> Self {
        self.lerp(*other, t)
    }
}

impl Lerp for Quat {
    fn lerp_to(&self, other: &Self, t: f32) -> Self {
        self.slerp(*other, t)
    }
}

fn encoded<T: Bits>(value: &T) -> BitBuffer {
    let buffer = BitBuffer::new();
    buffer.write(value);
    buffer
}

pub fn bit_equality() -> Comparator {
    Arc::new(|a: &BitBuffer, b: &BitBuffer| a == b)
}

/// Equality within `epsilon` for float fields that jitter.
pub fn approx_equality(epsilon: f32) -> Comparator {
    Arc::new(move |a: &BitBuffer, b: &BitBuffer| match (a.peek::<f32>(), b.peek::<f32>()) {
        (Some(a), Some(b)) => (a - b).abs() <= epsilon,
        _ => a == b,
    })
}

pub fn lerp<T: Lerp + Bits + 'static>() -> Interpolator {
    Arc::new(|from: &BitBuffer, to: &BitBuffer, t: f32| {
        let from = from.peek::<T>()?;
        let to = to.peek::<T>()?;
        Some(encoded(&from.lerp_to(&to, t)))
    })
}

pub fn difference<T: Sub<Output = T> + Bits + 'static>() -> Difference {
    Arc::new(|from: &BitBuffer, to: &BitBuffer| {
        let from = from.peek::<T>()?;
        let to = to.peek::<T>()?;
        Some(encoded(&(to - from)))
    })
}

pub fn accumulate<T: Add<Output = T> + Bits + 'static>() -> Accumulator {
    Arc::new(|a: &BitBuffer, b: &BitBuffer| {
        let a = a.peek::<T>()?;
        let b = b.peek::<T>()?;
        Some(encoded(&(a + b)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lerp_midpoint() {
        let blend = lerp::<f32>();
        let out = blend(&encoded(&0.0f32), &encoded(&10.0f32), 0.5).unwrap();
        assert_eq!(out.read::<f32>(), Some(5.0));
    }

    #[test]
    fn test_lerp_leaves_inputs_unread() {
        let blend = lerp::<Vec3>();
        let from = encoded(&Vec3::ZERO);
        let to = encoded(&Vec3::splat(2.0));
        let out = blend(&from, &to, 0.25).unwrap();

        assert_eq!(out.read::<Vec3>(), Some(Vec3::splat(0.5)));
        assert_eq!(from.read_position(), 0);
        assert_eq!(to.read_position(), 0);
    }

    #[test]
    fn test_quat_uses_slerp() {
        let blend = lerp::<Quat>();
        let a = Quat::IDENTITY;
        let b = Quat::from_rotation_z(std::f32::consts::FRAC_PI_2);
        let out = blend(&encoded(&a), &encoded(&b), 0.5).unwrap();
        let mid = out.read::<Quat>().unwrap();
        assert!(mid.angle_between(Quat::from_rotation_z(std::f32::consts::FRAC_PI_4)) < 1e-4);
    }

    #[test]
    fn test_difference_and_accumulate() {
        let diff = difference::<i32>()(&encoded(&3i32), &encoded(&10i32)).unwrap();
        assert_eq!(diff.peek::<i32>(), Some(7));

        let sum = accumulate::<i32>()(&encoded(&3i32), &diff).unwrap();
        assert_eq!(sum.peek::<i32>(), Some(10));
    }

    #[test]
    fn test_default_comparator_is_bitwise() {
        let hooks = FieldHooks::default();
        assert!(hooks.unchanged(&encoded(&1u8), &encoded(&1u8)));
        assert!(!hooks.unchanged(&encoded(&1u8), &encoded(&2u8)));

        let hooks = FieldHooks {
            comparator: Some(approx_equality(0.01)),
            ..Default::default()
        };
        assert!(hooks.unchanged(&encoded(&1.0f32), &encoded(&1.005f32)));
    }
}

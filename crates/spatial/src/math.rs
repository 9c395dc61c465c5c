//! # Cell Geometry
//!
//! Transforms and bounding volumes carried by spatial cells.
//!
//! A cell's world transform is its parent's world transform composed with
//! its local transform. World bounds are the local bounds pushed through the
//! world transform, merged with the world bounds of every descendant.

use glam::{Mat3, Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Tolerance used when deciding whether a transform actually changed
const TRANSFORM_EPSILON: f32 = 1e-5;

// ============================================================================
// Transform
// ============================================================================

/// Rotation, translation and scale of a cell relative to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellTransform {
    pub rotation: Quat,
    pub translation: Vec3,
    pub scale: Vec3,
}

impl Default for CellTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl CellTransform {
    pub const IDENTITY: Self = Self {
        rotation: Quat::IDENTITY,
        translation: Vec3::ZERO,
        scale: Vec3::ONE,
    };

    /// Pure translation
    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            translation,
            ..Self::IDENTITY
        }
    }

    /// Pure translation from components
    pub fn from_xyz(x: f32, y: f32, z: f32) -> Self {
        Self::from_translation(Vec3::new(x, y, z))
    }

    /// Replace the rotation
    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    /// Replace the scale
    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    /// Compose `child` (expressed in this frame) into this frame.
    pub fn mul(&self, child: &CellTransform) -> CellTransform {
        CellTransform {
            rotation: self.rotation * child.rotation,
            translation: self.transform_point(child.translation),
            scale: self.scale * child.scale,
        }
    }

    /// Map a point from this frame into the parent frame
    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.rotation * (self.scale * point) + self.translation
    }

    /// Rotation and scale as a matrix
    fn linear(&self) -> Mat3 {
        Mat3::from_quat(self.rotation) * Mat3::from_diagonal(self.scale)
    }

    pub fn approx_eq(&self, other: &CellTransform) -> bool {
        self.translation.abs_diff_eq(other.translation, TRANSFORM_EPSILON)
            && self.rotation.abs_diff_eq(other.rotation, TRANSFORM_EPSILON)
            && self.scale.abs_diff_eq(other.scale, TRANSFORM_EPSILON)
    }
}

// ============================================================================
// Bounds
// ============================================================================

/// Bounding volume of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Bounds {
    Sphere { center: Vec3, radius: f32 },
    /// Axis-aligned box
    Box { center: Vec3, half_extents: Vec3 },
}

impl Default for Bounds {
    fn default() -> Self {
        Self::point(Vec3::ZERO)
    }
}

impl Bounds {
    /// Degenerate sphere at a point
    pub fn point(center: Vec3) -> Self {
        Self::Sphere { center, radius: 0.0 }
    }

    pub fn sphere(center: Vec3, radius: f32) -> Self {
        Self::Sphere {
            center,
            radius: radius.abs(),
        }
    }

    pub fn aabb(center: Vec3, half_extents: Vec3) -> Self {
        Self::Box {
            center,
            half_extents: half_extents.abs(),
        }
    }

    /// Box spanning two corners
    pub fn from_min_max(min: Vec3, max: Vec3) -> Self {
        Self::Box {
            center: (min + max) * 0.5,
            half_extents: (max - min).abs() * 0.5,
        }
    }

    pub fn center(&self) -> Vec3 {
        match *self {
            Bounds::Sphere { center, .. } | Bounds::Box { center, .. } => center,
        }
    }

    pub fn min(&self) -> Vec3 {
        match *self {
            Bounds::Sphere { center, radius } => center - Vec3::splat(radius),
            Bounds::Box {
                center,
                half_extents,
            } => center - half_extents,
        }
    }

    pub fn max(&self) -> Vec3 {
        match *self {
            Bounds::Sphere { center, radius } => center + Vec3::splat(radius),
            Bounds::Box {
                center,
                half_extents,
            } => center + half_extents,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.min().is_finite() && self.max().is_finite()
    }

    /// Bounds expressed in the frame `transform` maps into.
    ///
    /// Boxes stay axis aligned, so a rotated box grows to enclose its
    /// rotated corners.
    pub fn transformed(&self, transform: &CellTransform) -> Bounds {
        match *self {
            Bounds::Sphere { center, radius } => Bounds::Sphere {
                center: transform.transform_point(center),
                radius: radius * transform.scale.abs().max_element(),
            },
            Bounds::Box {
                center,
                half_extents,
            } => {
                let m = transform.linear();
                let abs = Mat3::from_cols(m.x_axis.abs(), m.y_axis.abs(), m.z_axis.abs());
                Bounds::Box {
                    center: transform.transform_point(center),
                    half_extents: abs * half_extents,
                }
            }
        }
    }

    /// Smallest volume of the same family enclosing both. Mixed pairs
    /// merge into a box.
    pub fn merge(&self, other: &Bounds) -> Bounds {
        match (*self, *other) {
            (
                Bounds::Sphere {
                    center: a,
                    radius: ra,
                },
                Bounds::Sphere {
                    center: b,
                    radius: rb,
                },
            ) => {
                let offset = b - a;
                let distance = offset.length();
                if distance + rb <= ra {
                    return *self;
                }
                if distance + ra <= rb {
                    return *other;
                }
                let radius = (distance + ra + rb) * 0.5;
                let center = a + offset * ((radius - ra) / distance);
                Bounds::Sphere { center, radius }
            }
            _ => Bounds::from_min_max(self.min().min(other.min()), self.max().max(other.max())),
        }
    }

    /// Whether the volume touches the box `[min, max]`
    pub fn intersects_aabb(&self, min: Vec3, max: Vec3) -> bool {
        match *self {
            Bounds::Sphere { center, radius } => {
                let closest = center.clamp(min, max);
                closest.distance_squared(center) <= radius * radius
            }
            Bounds::Box { .. } => {
                self.min().cmple(max).all() && self.max().cmpge(min).all()
            }
        }
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        match *self {
            Bounds::Sphere { center, radius } => point.distance_squared(center) <= radius * radius,
            Bounds::Box { .. } => point.cmpge(self.min()).all() && point.cmple(self.max()).all(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    #[test]
    fn test_compose_translation_and_rotation() {
        let parent = CellTransform::from_xyz(10.0, 0.0, 0.0)
            .with_rotation(Quat::from_rotation_z(FRAC_PI_2));
        let child = CellTransform::from_xyz(1.0, 0.0, 0.0);

        let world = parent.mul(&child);
        assert!(world.translation.abs_diff_eq(Vec3::new(10.0, 1.0, 0.0), 1e-5));
    }

    #[test]
    fn test_compose_scale() {
        let parent = CellTransform::IDENTITY.with_scale(Vec3::splat(2.0));
        let child = CellTransform::from_xyz(3.0, 0.0, 0.0);

        let world = parent.mul(&child);
        assert_eq!(world.translation, Vec3::new(6.0, 0.0, 0.0));
        assert_eq!(world.scale, Vec3::splat(2.0));
    }

    #[test]
    fn test_sphere_transformed() {
        let bounds = Bounds::sphere(Vec3::ZERO, 1.0);
        let transform = CellTransform::from_xyz(5.0, 5.0, 0.0).with_scale(Vec3::new(1.0, 3.0, 1.0));

        match bounds.transformed(&transform) {
            Bounds::Sphere { center, radius } => {
                assert_eq!(center, Vec3::new(5.0, 5.0, 0.0));
                assert_eq!(radius, 3.0);
            }
            other => panic!("unexpected bounds {other:?}"),
        }
    }

    #[test]
    fn test_rotated_box_grows() {
        let bounds = Bounds::aabb(Vec3::ZERO, Vec3::new(2.0, 1.0, 1.0));
        let transform = CellTransform::IDENTITY.with_rotation(Quat::from_rotation_z(FRAC_PI_2));

        let rotated = bounds.transformed(&transform);
        assert!(rotated.max().abs_diff_eq(Vec3::new(1.0, 2.0, 1.0), 1e-5));
    }

    #[test]
    fn test_merge_spheres() {
        let a = Bounds::sphere(Vec3::ZERO, 1.0);
        let b = Bounds::sphere(Vec3::new(4.0, 0.0, 0.0), 1.0);

        let merged = a.merge(&b);
        assert!(merged.center().abs_diff_eq(Vec3::new(2.0, 0.0, 0.0), 1e-5));
        assert!(merged.contains_point(Vec3::new(-1.0, 0.0, 0.0)));
        assert!(merged.contains_point(Vec3::new(5.0, 0.0, 0.0)));

        // Nested spheres collapse to the outer one
        let inner = Bounds::sphere(Vec3::new(0.5, 0.0, 0.0), 0.25);
        assert_eq!(a.merge(&inner), a);
    }

    #[test]
    fn test_merge_mixed_is_box() {
        let a = Bounds::sphere(Vec3::ZERO, 1.0);
        let b = Bounds::aabb(Vec3::new(5.0, 0.0, 0.0), Vec3::ONE);

        let merged = a.merge(&b);
        assert!(matches!(merged, Bounds::Box { .. }));
        assert_eq!(merged.min(), Vec3::new(-1.0, -1.0, -1.0));
        assert_eq!(merged.max(), Vec3::new(6.0, 1.0, 1.0));
    }

    #[test]
    fn test_sphere_aabb_intersection() {
        let sphere = Bounds::sphere(Vec3::ZERO, 20.0);
        assert!(sphere.intersects_aabb(Vec3::splat(-50.0), Vec3::splat(50.0)));
        assert!(!sphere.intersects_aabb(Vec3::new(50.0, -50.0, -50.0), Vec3::new(150.0, 50.0, 50.0)));

        // Corner region is outside the sphere even though the boxes overlap
        assert!(!sphere.intersects_aabb(Vec3::splat(15.0), Vec3::splat(30.0)));
    }
}

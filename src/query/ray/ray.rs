//! Structure needed to cast rays.

use crate::math::{Point, Real, Vector};

/// A ray for ray-casting queries.
///
/// The direction does not need to be normalized. Casts against a mesh BVH treat the ray as the
/// segment going from `origin` to `origin + dir`, i.e. the time-of-impact is restricted to
/// `[0, 1]`.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[repr(C)]
pub struct Ray {
    /// Starting point of the ray.
    pub origin: Point<Real>,
    /// Direction of the ray.
    pub dir: Vector<Real>,
}

impl Ray {
    /// Creates a new ray starting from `origin` and with the direction `dir`.
    pub fn new(origin: Point<Real>, dir: Vector<Real>) -> Ray {
        Ray { origin, dir }
    }

    /// Creates the ray going from `origin` to `target`, so that `target` lies at
    /// time-of-impact 1.
    pub fn between(origin: Point<Real>, target: Point<Real>) -> Ray {
        Ray {
            origin,
            dir: target - origin,
        }
    }

    /// Computes the point at the parameter `t` of this ray.
    pub fn point_at(&self, t: Real) -> Point<Real> {
        self.origin + self.dir * t
    }
}

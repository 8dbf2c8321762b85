//! Bounding volumes.

#[doc(inline)]
pub use self::aabb::Aabb;
#[doc(inline)]
pub use self::bounding_volume::BoundingVolume;

#[doc(hidden)]
pub mod aabb;
mod aabb_triangle;
#[doc(hidden)]
pub mod bounding_volume;

//! Core value types: positions, bounding boxes, samples and query results

use serde::{Deserialize, Serialize};

/// 3D position in world units
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn splat(v: f32) -> Self {
        Self { x: v, y: v, z: v }
    }

    pub fn distance_squared(&self, other: &Vec3) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }

    pub fn distance(&self, other: &Vec3) -> f32 {
        self.distance_squared(other).sqrt()
    }

    /// Any NaN component marks the sample as missing in the shard format.
    pub fn has_nan(&self) -> bool {
        self.x.is_nan() || self.y.is_nan() || self.z.is_nan()
    }
}

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Inverted box suitable as the identity for min/max folding.
    pub fn empty() -> Self {
        Self {
            min: Vec3::splat(f32::MAX),
            max: Vec3::splat(f32::MIN),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.min.x <= self.max.x && self.min.y <= self.max.y && self.min.z <= self.max.z
    }

    pub fn expand(&mut self, p: &Vec3) {
        self.min.x = self.min.x.min(p.x);
        self.min.y = self.min.y.min(p.y);
        self.min.z = self.min.z.min(p.z);
        self.max.x = self.max.x.max(p.x);
        self.max.y = self.max.y.max(p.y);
        self.max.z = self.max.z.max(p.z);
    }

    pub fn expand_by_margin(&mut self, margin: f32) {
        self.min.x -= margin;
        self.min.y -= margin;
        self.min.z -= margin;
        self.max.x += margin;
        self.max.y += margin;
        self.max.z += margin;
    }

    pub fn contains(&self, p: &Vec3) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }
}

/// One trajectory position at one time step, used during build and query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectorySample {
    pub trajectory_id: u32,
    pub time_step: i32,
    pub position: Vec3,
}

impl TrajectorySample {
    pub fn new(trajectory_id: u32, time_step: i32, position: Vec3) -> Self {
        Self { trajectory_id, time_step, position }
    }
}

/// Single-distance result for the legacy radius query form
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SpatialQueryResult {
    pub trajectory_id: i32,
    pub distance: f32,
}

/// One verified sample belonging to a query result
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TrajectorySamplePoint {
    pub position: Vec3,
    pub time_step: i32,
    /// Exact distance to the query reference at this sample's time step
    pub distance: f32,
}

/// All surviving samples of one trajectory for a query
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrajectoryQueryResult {
    pub trajectory_id: i32,
    pub sample_points: Vec<TrajectorySamplePoint>,
}

impl TrajectoryQueryResult {
    pub fn new(trajectory_id: i32) -> Self {
        Self { trajectory_id, sample_points: Vec::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec3_distance() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(3.0, 4.0, 0.0);
        assert!((a.distance(&b) - 5.0).abs() < 1e-6);
        assert_eq!(a.distance_squared(&b), 25.0);
    }

    #[test]
    fn test_vec3_nan_detection() {
        assert!(!Vec3::new(1.0, 2.0, 3.0).has_nan());
        assert!(Vec3::new(f32::NAN, 2.0, 3.0).has_nan());
        assert!(Vec3::new(1.0, 2.0, f32::NAN).has_nan());
    }

    #[test]
    fn test_aabb_fold() {
        let mut bbox = Aabb::empty();
        assert!(!bbox.is_valid());

        bbox.expand(&Vec3::new(1.0, -2.0, 3.0));
        bbox.expand(&Vec3::new(-1.0, 4.0, 0.0));
        assert!(bbox.is_valid());
        assert_eq!(bbox.min, Vec3::new(-1.0, -2.0, 0.0));
        assert_eq!(bbox.max, Vec3::new(1.0, 4.0, 3.0));

        bbox.expand_by_margin(1.0);
        assert_eq!(bbox.min, Vec3::new(-2.0, -3.0, -1.0));
        assert_eq!(bbox.max, Vec3::new(2.0, 5.0, 4.0));
    }

    #[test]
    fn test_aabb_contains() {
        let bbox = Aabb::new(Vec3::ZERO, Vec3::splat(10.0));
        assert!(bbox.contains(&Vec3::splat(5.0)));
        assert!(bbox.contains(&Vec3::ZERO));
        assert!(!bbox.contains(&Vec3::new(5.0, 11.0, 5.0)));
    }
}

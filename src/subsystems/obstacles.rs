//! Obstacle fields the simulated proximity sensors ray-cast against.
//!
//! The surrounding harness owns the world; the sensor suite only ever asks
//! "how far along this ray is the first obstacle".

use serde::{Deserialize, Serialize};

const MAX_MARCH_STEPS: usize = 256;
const SURFACE_EPSILON: f64 = 1e-6;

pub trait ObstacleField {
    /// Distance from `origin` along `direction` (rad, world frame) to the
    /// first obstacle, or `None` if nothing lies within `max_range`.
    fn cast_ray(&self, origin: (f64, f64), direction: f64, max_range: f64) -> Option<f64>;
}

/// An empty world.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoObstacles;

impl ObstacleField for NoObstacles {
    fn cast_ray(&self, _origin: (f64, f64), _direction: f64, _max_range: f64) -> Option<f64> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiscObstacle {
    pub x: f64,
    pub y: f64,
    pub radius: f64,
}

impl DiscObstacle {
    pub fn new(x: f64, y: f64, radius: f64) -> Self {
        Self {
            x,
            y,
            radius: radius.max(0.0),
        }
    }

    fn intersect(&self, origin: (f64, f64), direction: (f64, f64)) -> Option<f64> {
        let ox = origin.0 - self.x;
        let oy = origin.1 - self.y;
        let b = ox * direction.0 + oy * direction.1;
        let c = ox * ox + oy * oy - self.radius * self.radius;

        if c <= 0.0 {
            // Origin inside the disc.
            return Some(0.0);
        }

        let discriminant = b * b - c;
        if discriminant < 0.0 {
            return None;
        }

        let t = -b - discriminant.sqrt();
        (t >= 0.0).then_some(t)
    }
}

/// A set of discs, the usual way to scatter point obstacles in a scenario.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointField {
    pub obstacles: Vec<DiscObstacle>,
}

impl PointField {
    pub fn new(obstacles: Vec<DiscObstacle>) -> Self {
        Self { obstacles }
    }

    pub fn from_points(points: &[(f64, f64)], radius: f64) -> Self {
        Self {
            obstacles: points
                .iter()
                .map(|&(x, y)| DiscObstacle::new(x, y, radius))
                .collect(),
        }
    }

    pub fn push(&mut self, obstacle: DiscObstacle) {
        self.obstacles.push(obstacle);
    }

    pub fn is_empty(&self) -> bool {
        self.obstacles.is_empty()
    }
}

impl ObstacleField for PointField {
    fn cast_ray(&self, origin: (f64, f64), direction: f64, max_range: f64) -> Option<f64> {
        let dir = (direction.cos(), direction.sin());
        self.obstacles
            .iter()
            .filter_map(|obstacle| obstacle.intersect(origin, dir))
            .filter(|&t| t <= max_range)
            .min_by(f64::total_cmp)
    }
}

/// A signed distance function, sphere-traced along each ray.
pub struct DistanceField<F>
where
    F: Fn(f64, f64) -> f64,
{
    distance: F,
}

impl<F> DistanceField<F>
where
    F: Fn(f64, f64) -> f64,
{
    pub fn new(distance: F) -> Self {
        Self { distance }
    }
}

impl<F> ObstacleField for DistanceField<F>
where
    F: Fn(f64, f64) -> f64,
{
    fn cast_ray(&self, origin: (f64, f64), direction: f64, max_range: f64) -> Option<f64> {
        let (dx, dy) = (direction.cos(), direction.sin());
        let mut travelled = 0.0;

        for _ in 0..MAX_MARCH_STEPS {
            let step = (self.distance)(origin.0 + dx * travelled, origin.1 + dy * travelled);
            if !step.is_finite() {
                return None;
            }
            if step <= SURFACE_EPSILON {
                return Some(travelled);
            }
            travelled += step;
            if travelled > max_range {
                return None;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disc_hit_straight_ahead() {
        let field = PointField::new(vec![DiscObstacle::new(2.0, 0.0, 0.5)]);
        let hit = field.cast_ray((0.0, 0.0), 0.0, 5.0).unwrap();
        assert!((hit - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_disc_behind_is_ignored() {
        let field = PointField::new(vec![DiscObstacle::new(-2.0, 0.0, 0.5)]);
        assert!(field.cast_ray((0.0, 0.0), 0.0, 5.0).is_none());
    }

    #[test]
    fn test_nearest_disc_wins_and_range_is_respected() {
        let field = PointField::from_points(&[(3.0, 0.0), (1.0, 0.0), (9.0, 0.0)], 0.1);
        let hit = field.cast_ray((0.0, 0.0), 0.0, 5.0).unwrap();
        assert!((hit - 0.9).abs() < 1e-12);

        let far = PointField::from_points(&[(9.0, 0.0)], 0.1);
        assert!(far.cast_ray((0.0, 0.0), 0.0, 5.0).is_none());
    }

    #[test]
    fn test_distance_field_wall() {
        // Wall along x = 2.
        let field = DistanceField::new(|x, _y| 2.0 - x);
        let hit = field.cast_ray((0.0, 0.0), 0.0, 5.0).unwrap();
        assert!((hit - 2.0).abs() < 1e-5);
        assert!(field.cast_ray((0.0, 0.0), std::f64::consts::PI, 5.0).is_none());
    }
}

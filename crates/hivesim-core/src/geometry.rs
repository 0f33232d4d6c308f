//! Minimal planar geometry: agent locations and shapes.
//!
//! Only the contract "given a shape, return a transformed shape" is provided
//! here; richer geometric algorithms live outside the core.

use hivesim_index::{Bounds, Coord};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[must_use]
    pub fn distance(&self, other: &Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    #[must_use]
    pub fn translated(&self, dx: f64, dy: f64) -> Self {
        Self::new(self.x + dx, self.y + dy)
    }
}

impl From<Point> for Coord {
    fn from(point: Point) -> Self {
        Coord::new(point.x, point.y)
    }
}

impl From<Coord> for Point {
    fn from(coord: Coord) -> Self {
        Point::new(coord.x, coord.y)
    }
}

/// Geometry carried by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Shape {
    Point { at: Point },
    Circle { center: Point, radius: f64 },
    Rectangle { center: Point, width: f64, height: f64 },
}

impl Default for Shape {
    fn default() -> Self {
        Self::Point {
            at: Point::default(),
        }
    }
}

impl Shape {
    /// Axis-aligned rectangle of `width` x `height` centered on `center`.
    #[must_use]
    pub const fn rectangle(width: f64, height: f64, center: Point) -> Self {
        Self::Rectangle {
            center,
            width,
            height,
        }
    }

    #[must_use]
    pub fn location(&self) -> Point {
        match self {
            Self::Point { at } => *at,
            Self::Circle { center, .. } | Self::Rectangle { center, .. } => *center,
        }
    }

    #[must_use]
    pub fn envelope(&self) -> Bounds {
        match self {
            Self::Point { at } => Bounds::new(at.x, at.y, at.x, at.y),
            Self::Circle { center, radius } => Bounds::new(
                center.x - radius,
                center.y - radius,
                center.x + radius,
                center.y + radius,
            ),
            Self::Rectangle {
                center,
                width,
                height,
            } => Bounds::new(
                center.x - width / 2.0,
                center.y - height / 2.0,
                center.x + width / 2.0,
                center.y + height / 2.0,
            ),
        }
    }

    /// Radius of the disc used to index this shape.
    #[must_use]
    pub fn footprint_radius(&self) -> f64 {
        match self {
            Self::Point { .. } => 0.0,
            Self::Circle { radius, .. } => *radius,
            Self::Rectangle { width, height, .. } => width.max(*height) / 2.0,
        }
    }

    #[must_use]
    pub fn translated_by(&self, dx: f64, dy: f64) -> Self {
        match *self {
            Self::Point { at } => Self::Point {
                at: at.translated(dx, dy),
            },
            Self::Circle { center, radius } => Self::Circle {
                center: center.translated(dx, dy),
                radius,
            },
            Self::Rectangle {
                center,
                width,
                height,
            } => Self::Rectangle {
                center: center.translated(dx, dy),
                width,
                height,
            },
        }
    }

    /// Same shape recentered on `location`.
    #[must_use]
    pub fn moved_to(&self, location: Point) -> Self {
        let current = self.location();
        self.translated_by(location.x - current.x, location.y - current.y)
    }

    #[must_use]
    pub fn contains(&self, point: Point) -> bool {
        match self {
            Self::Point { at } => at == &point,
            Self::Circle { center, radius } => center.distance(&point) <= *radius,
            Self::Rectangle { .. } => self.envelope().contains(point.into()),
        }
    }
}

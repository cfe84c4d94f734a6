//! Axis-aligned bounding rectangle with a distinguished null state.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::geometry::Coord;

/// Minimum bounding rectangle (minX, minY, maxX, maxY).
///
/// The null envelope is encoded as an inverted infinite box so that
/// accumulation through `min`/`max` needs no special case and stays
/// commutative and associative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Default for Envelope {
    fn default() -> Self {
        Self::null()
    }
}

impl Envelope {
    /// Envelope covering the two corners, normalised so min <= max
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { min_x: x1.min(x2), min_y: y1.min(y2), max_x: x1.max(x2), max_y: y1.max(y2) }
    }

    /// The empty envelope: nothing has been unioned into it yet
    pub const fn null() -> Self {
        Self {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
        }
    }

    /// Degenerate envelope around a single position
    pub fn from_point(x: f64, y: f64) -> Self {
        Self { min_x: x, min_y: y, max_x: x, max_y: y }
    }

    pub fn is_null(&self) -> bool {
        self.min_x > self.max_x || self.min_y > self.max_y
    }

    pub fn width(&self) -> f64 {
        if self.is_null() {
            0.0
        } else {
            self.max_x - self.min_x
        }
    }

    pub fn height(&self) -> f64 {
        if self.is_null() {
            0.0
        } else {
            self.max_y - self.min_y
        }
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    pub fn center(&self) -> Option<(f64, f64)> {
        if self.is_null() {
            return None;
        }
        Some(((self.min_x + self.max_x) / 2.0, (self.min_y + self.max_y) / 2.0))
    }

    /// Grow to include another envelope
    pub fn expand_to_include(&mut self, other: &Envelope) {
        if other.is_null() {
            return;
        }
        self.min_x = self.min_x.min(other.min_x);
        self.min_y = self.min_y.min(other.min_y);
        self.max_x = self.max_x.max(other.max_x);
        self.max_y = self.max_y.max(other.max_y);
    }

    /// Grow to include a position
    pub fn expand_to_include_xy(&mut self, x: f64, y: f64) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }

    /// Non-mutating union
    pub fn union(&self, other: &Envelope) -> Envelope {
        let mut out = *self;
        out.expand_to_include(other);
        out
    }

    /// Envelope grown by `distance` on every side
    pub fn expanded_by(&self, distance: f64) -> Envelope {
        if self.is_null() {
            return *self;
        }
        Envelope::new(
            self.min_x - distance,
            self.min_y - distance,
            self.max_x + distance,
            self.max_y + distance,
        )
    }

    /// Closed-interval overlap test; null envelopes intersect nothing
    pub fn intersects(&self, other: &Envelope) -> bool {
        if self.is_null() || other.is_null() {
            return false;
        }
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    /// Whether `other` lies entirely inside this envelope
    pub fn contains(&self, other: &Envelope) -> bool {
        if self.is_null() || other.is_null() {
            return false;
        }
        other.min_x >= self.min_x
            && other.max_x <= self.max_x
            && other.min_y >= self.min_y
            && other.max_y <= self.max_y
    }

    pub fn contains_xy(&self, x: f64, y: f64) -> bool {
        !self.is_null() && x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    pub fn contains_coord(&self, coord: &Coord) -> bool {
        self.contains_xy(coord.x, coord.y)
    }

    /// Overlapping region, or the null envelope when disjoint
    pub fn intersection(&self, other: &Envelope) -> Envelope {
        if !self.intersects(other) {
            return Envelope::null();
        }
        Envelope {
            min_x: self.min_x.max(other.min_x),
            min_y: self.min_y.max(other.min_y),
            max_x: self.max_x.min(other.max_x),
            max_y: self.max_y.min(other.max_y),
        }
    }

    /// Corner array `[min_x, min_y, max_x, max_y]`
    pub fn to_array(&self) -> Option<[f64; 4]> {
        (!self.is_null()).then_some([self.min_x, self.min_y, self.max_x, self.max_y])
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_array().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let corners = Option::<[f64; 4]>::deserialize(deserializer)?;
        Ok(corners.map(|c| Envelope::new(c[0], c[1], c[2], c[3])).unwrap_or_default())
    }
}

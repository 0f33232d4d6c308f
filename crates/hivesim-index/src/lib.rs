//! Spatial indexing abstractions for population topologies.
//!
//! A topology indexes the agents of one population. The continuous variant
//! buckets agent footprints into a uniform grid over the environment bounds and
//! optionally wraps coordinates toroidally; the amorphous variant only tracks
//! membership, for populations with no spatial meaning.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error, PartialEq)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The key is already present in the index.
    #[error("key is already indexed")]
    AlreadyIndexed,
    /// The key is not present in the index.
    #[error("key is not indexed")]
    NotIndexed,
}

/// Planar coordinate in environment units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
}

impl Coord {
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned extent of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    #[must_use]
    pub const fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Bounds anchored at the origin with the given size.
    #[must_use]
    pub const fn from_size(width: f64, height: f64) -> Self {
        Self::new(0.0, 0.0, width, height)
    }

    #[must_use]
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    #[must_use]
    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    #[must_use]
    pub fn center(&self) -> Coord {
        Coord::new(
            self.min_x + self.width() / 2.0,
            self.min_y + self.height() / 2.0,
        )
    }

    #[must_use]
    pub fn contains(&self, coord: Coord) -> bool {
        coord.x >= self.min_x && coord.x <= self.max_x && coord.y >= self.min_y && coord.y <= self.max_y
    }
}

/// Parameters fixed when a continuous topology is built.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TopologySettings {
    /// Environment extent covered by the grid.
    pub bounds: Bounds,
    /// Whether coordinates wrap modulo the environment width and height.
    pub torus: bool,
    /// Edge length of each grid cell used for bucketing agents.
    pub cell_size: f64,
}

impl TopologySettings {
    #[must_use]
    pub const fn new(bounds: Bounds, torus: bool, cell_size: f64) -> Self {
        Self {
            bounds,
            torus,
            cell_size,
        }
    }

    fn validate(&self) -> Result<(), IndexError> {
        if !(self.cell_size > 0.0) {
            return Err(IndexError::InvalidConfig("cell_size must be positive"));
        }
        if !(self.bounds.width() > 0.0) || !(self.bounds.height() > 0.0) {
            return Err(IndexError::InvalidConfig(
                "environment bounds must have a positive extent",
            ));
        }
        Ok(())
    }
}

/// Spatial footprint of an indexed agent: a disc around its location.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Footprint {
    pub center: Coord,
    pub radius: f64,
}

impl Footprint {
    #[must_use]
    pub const fn new(center: Coord, radius: f64) -> Self {
        Self { center, radius }
    }

    #[must_use]
    pub const fn point(center: Coord) -> Self {
        Self::new(center, 0.0)
    }
}

/// Common behaviour exposed by neighborhood indices.
pub trait NeighborhoodIndex<K> {
    /// Add `key` to the index. Fails if it is already present.
    fn insert(&mut self, key: K, footprint: Footprint) -> Result<(), IndexError>;

    /// Move an indexed key to a new footprint.
    fn update(&mut self, key: K, footprint: Footprint) -> Result<(), IndexError>;

    /// Remove `key`, returning whether it was indexed.
    fn remove(&mut self, key: K) -> bool;

    fn contains(&self, key: K) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit keys whose center lies within `radius` of `origin`.
    fn neighbors_within(
        &self,
        origin: Coord,
        radius: f64,
        visitor: &mut dyn FnMut(K, OrderedFloat<f64>),
    );

    /// Earliest-inserted key whose footprint covers `location`.
    fn agent_at(&self, location: Coord) -> Option<K>;

    /// Full reset: discards every entry, then indexes `entries` in order.
    fn rebuild(&mut self, entries: &[(K, Footprint)]) -> Result<(), IndexError>;
}

#[derive(Debug, Clone)]
struct GridSlot {
    footprint: Footprint,
    cell: usize,
    sequence: u64,
}

/// Uniform grid index over a bounded, optionally toroidal, environment.
#[derive(Debug, Clone)]
pub struct ContinuousIndex<K> {
    settings: TopologySettings,
    cols: usize,
    rows: usize,
    cells: Vec<Vec<K>>,
    slots: HashMap<K, GridSlot>,
    next_sequence: u64,
    max_radius: f64,
}

impl<K: Copy + Eq + Hash> ContinuousIndex<K> {
    /// Create an empty grid covering `settings.bounds`.
    pub fn new(settings: TopologySettings) -> Result<Self, IndexError> {
        settings.validate()?;
        let cols = (settings.bounds.width() / settings.cell_size).ceil().max(1.0) as usize;
        let rows = (settings.bounds.height() / settings.cell_size).ceil().max(1.0) as usize;
        Ok(Self {
            settings,
            cols,
            rows,
            cells: vec![Vec::new(); cols * rows],
            slots: HashMap::new(),
            next_sequence: 0,
            max_radius: 0.0,
        })
    }

    #[must_use]
    pub fn settings(&self) -> &TopologySettings {
        &self.settings
    }

    /// Grid dimensions as `(columns, rows)`.
    #[must_use]
    pub fn dimensions(&self) -> (usize, usize) {
        (self.cols, self.rows)
    }

    /// Map `coord` into the environment: modulo the extent on a torus,
    /// unchanged otherwise.
    #[must_use]
    pub fn normalize(&self, coord: Coord) -> Coord {
        if !self.settings.torus {
            return coord;
        }
        let bounds = &self.settings.bounds;
        Coord::new(
            bounds.min_x + (coord.x - bounds.min_x).rem_euclid(bounds.width()),
            bounds.min_y + (coord.y - bounds.min_y).rem_euclid(bounds.height()),
        )
    }

    /// Distance between two coordinates, taking the shortest way around on a torus.
    #[must_use]
    pub fn distance(&self, a: Coord, b: Coord) -> f64 {
        let mut dx = (a.x - b.x).abs();
        let mut dy = (a.y - b.y).abs();
        if self.settings.torus {
            let width = self.settings.bounds.width();
            let height = self.settings.bounds.height();
            dx = dx.rem_euclid(width);
            dy = dy.rem_euclid(height);
            dx = dx.min(width - dx);
            dy = dy.min(height - dy);
        }
        dx.hypot(dy)
    }

    fn cell_coords(&self, coord: Coord) -> (usize, usize) {
        let coord = self.normalize(coord);
        let bounds = &self.settings.bounds;
        let col = ((coord.x - bounds.min_x) / self.settings.cell_size).floor();
        let row = ((coord.y - bounds.min_y) / self.settings.cell_size).floor();
        let col = col.clamp(0.0, (self.cols - 1) as f64) as usize;
        let row = row.clamp(0.0, (self.rows - 1) as f64) as usize;
        (col, row)
    }

    fn cell_of(&self, coord: Coord) -> usize {
        let (col, row) = self.cell_coords(coord);
        row * self.cols + col
    }

    /// Grid cells within `radius` of `origin`, each listed once. A reach
    /// covering the whole grid visits every cell.
    fn cells_around(&self, origin: Coord, radius: f64) -> Vec<usize> {
        let (col, row) = self.cell_coords(origin);
        let reach = (radius / self.settings.cell_size).ceil().max(0.0) + 1.0;
        let cols = self.axis_around(col, reach, self.cols);
        let rows = self.axis_around(row, reach, self.rows);
        let mut cells = Vec::with_capacity(cols.len() * rows.len());
        for r in &rows {
            for c in &cols {
                cells.push(r * self.cols + c);
            }
        }
        cells
    }

    /// Indexes within `reach` of `center` along one axis of length `len`,
    /// wrapped on a torus and clipped otherwise. Never longer than `len`.
    fn axis_around(&self, center: usize, reach: f64, len: usize) -> Vec<usize> {
        if reach * 2.0 + 1.0 >= len as f64 {
            return (0..len).collect();
        }
        let span = reach as usize;
        if self.settings.torus {
            (0..=2 * span)
                .map(|offset| (center + len + offset - span) % len)
                .collect()
        } else {
            (center.saturating_sub(span)..=(center + span).min(len - 1)).collect()
        }
    }

    fn detach(&mut self, key: K, cell: usize) {
        if let Some(bucket) = self.cells.get_mut(cell)
            && let Some(pos) = bucket.iter().position(|candidate| *candidate == key)
        {
            bucket.remove(pos);
        }
    }
}

impl<K: Copy + Eq + Hash> NeighborhoodIndex<K> for ContinuousIndex<K> {
    fn insert(&mut self, key: K, footprint: Footprint) -> Result<(), IndexError> {
        if self.slots.contains_key(&key) {
            return Err(IndexError::AlreadyIndexed);
        }
        let cell = self.cell_of(footprint.center);
        self.cells[cell].push(key);
        self.max_radius = self.max_radius.max(footprint.radius);
        self.slots.insert(
            key,
            GridSlot {
                footprint,
                cell,
                sequence: self.next_sequence,
            },
        );
        self.next_sequence += 1;
        Ok(())
    }

    fn update(&mut self, key: K, footprint: Footprint) -> Result<(), IndexError> {
        let cell = self.cell_of(footprint.center);
        let previous = match self.slots.get_mut(&key) {
            Some(slot) => {
                let previous = slot.cell;
                slot.footprint = footprint;
                slot.cell = cell;
                previous
            }
            None => return Err(IndexError::NotIndexed),
        };
        self.max_radius = self.max_radius.max(footprint.radius);
        if previous != cell {
            self.detach(key, previous);
            self.cells[cell].push(key);
        }
        Ok(())
    }

    fn remove(&mut self, key: K) -> bool {
        match self.slots.remove(&key) {
            Some(slot) => {
                self.detach(key, slot.cell);
                true
            }
            None => false,
        }
    }

    fn contains(&self, key: K) -> bool {
        self.slots.contains_key(&key)
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn neighbors_within(
        &self,
        origin: Coord,
        radius: f64,
        visitor: &mut dyn FnMut(K, OrderedFloat<f64>),
    ) {
        if radius < 0.0 {
            return;
        }
        let origin = self.normalize(origin);
        for cell in self.cells_around(origin, radius) {
            for key in &self.cells[cell] {
                if let Some(slot) = self.slots.get(key) {
                    let distance = self.distance(origin, slot.footprint.center);
                    if distance <= radius {
                        visitor(*key, OrderedFloat(distance));
                    }
                }
            }
        }
    }

    fn agent_at(&self, location: Coord) -> Option<K> {
        let location = self.normalize(location);
        let reach = self.max_radius.max(f64::EPSILON);
        let mut best: Option<(u64, K)> = None;
        for cell in self.cells_around(location, reach) {
            for key in &self.cells[cell] {
                let Some(slot) = self.slots.get(key) else {
                    continue;
                };
                let distance = self.distance(location, slot.footprint.center);
                if distance <= slot.footprint.radius.max(f64::EPSILON)
                    && best.is_none_or(|(sequence, _)| slot.sequence < sequence)
                {
                    best = Some((slot.sequence, *key));
                }
            }
        }
        best.map(|(_, key)| key)
    }

    fn rebuild(&mut self, entries: &[(K, Footprint)]) -> Result<(), IndexError> {
        for bucket in &mut self.cells {
            bucket.clear();
        }
        self.slots.clear();
        self.max_radius = 0.0;
        for (key, footprint) in entries {
            self.insert(*key, *footprint)?;
        }
        Ok(())
    }
}

/// Membership-only index for populations without spatial meaning.
#[derive(Debug, Clone)]
pub struct AmorphousIndex<K> {
    members: Vec<K>,
}

impl<K> Default for AmorphousIndex<K> {
    fn default() -> Self {
        Self {
            members: Vec::new(),
        }
    }
}

impl<K: Copy + Eq + Hash> AmorphousIndex<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K: Copy + Eq + Hash> NeighborhoodIndex<K> for AmorphousIndex<K> {
    fn insert(&mut self, key: K, _footprint: Footprint) -> Result<(), IndexError> {
        if self.members.contains(&key) {
            return Err(IndexError::AlreadyIndexed);
        }
        self.members.push(key);
        Ok(())
    }

    fn update(&mut self, key: K, _footprint: Footprint) -> Result<(), IndexError> {
        if self.members.contains(&key) {
            Ok(())
        } else {
            Err(IndexError::NotIndexed)
        }
    }

    fn remove(&mut self, key: K) -> bool {
        match self.members.iter().position(|member| *member == key) {
            Some(pos) => {
                self.members.remove(pos);
                true
            }
            None => false,
        }
    }

    fn contains(&self, key: K) -> bool {
        self.members.contains(&key)
    }

    fn len(&self) -> usize {
        self.members.len()
    }

    fn neighbors_within(
        &self,
        _origin: Coord,
        _radius: f64,
        _visitor: &mut dyn FnMut(K, OrderedFloat<f64>),
    ) {
    }

    fn agent_at(&self, _location: Coord) -> Option<K> {
        None
    }

    fn rebuild(&mut self, entries: &[(K, Footprint)]) -> Result<(), IndexError> {
        self.members.clear();
        for (key, footprint) in entries {
            self.insert(*key, *footprint)?;
        }
        Ok(())
    }
}

/// Index attached to a population.
#[derive(Debug, Clone)]
pub enum Topology<K> {
    Continuous(ContinuousIndex<K>),
    Amorphous(AmorphousIndex<K>),
}

impl<K: Copy + Eq + Hash> Topology<K> {
    /// Build an empty continuous topology.
    pub fn continuous(settings: TopologySettings) -> Result<Self, IndexError> {
        ContinuousIndex::new(settings).map(Self::Continuous)
    }

    #[must_use]
    pub fn amorphous() -> Self {
        Self::Amorphous(AmorphousIndex::new())
    }

    #[must_use]
    pub fn is_torus(&self) -> bool {
        matches!(self, Self::Continuous(index) if index.settings().torus)
    }

    #[must_use]
    pub fn is_continuous(&self) -> bool {
        matches!(self, Self::Continuous(_))
    }

    /// Settings of a continuous topology; `None` for amorphous ones.
    #[must_use]
    pub fn settings(&self) -> Option<&TopologySettings> {
        match self {
            Self::Continuous(index) => Some(index.settings()),
            Self::Amorphous(_) => None,
        }
    }

    #[must_use]
    pub fn normalize(&self, coord: Coord) -> Coord {
        match self {
            Self::Continuous(index) => index.normalize(coord),
            Self::Amorphous(_) => coord,
        }
    }

    /// Distance under this topology's metric (plain Euclidean when amorphous).
    #[must_use]
    pub fn distance(&self, a: Coord, b: Coord) -> f64 {
        match self {
            Self::Continuous(index) => index.distance(a, b),
            Self::Amorphous(_) => (a.x - b.x).hypot(a.y - b.y),
        }
    }

    /// Collect neighbors of `origin` sorted by distance, then by visit order.
    #[must_use]
    pub fn neighbors(&self, origin: Coord, radius: f64) -> Vec<(K, f64)> {
        let mut found: Vec<(K, OrderedFloat<f64>)> = Vec::new();
        self.neighbors_within(origin, radius, &mut |key, distance| {
            found.push((key, distance));
        });
        found.sort_by_key(|(_, distance)| *distance);
        found
            .into_iter()
            .map(|(key, distance)| (key, distance.into_inner()))
            .collect()
    }

    fn inner(&self) -> &dyn NeighborhoodIndex<K> {
        match self {
            Self::Continuous(index) => index,
            Self::Amorphous(index) => index,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn NeighborhoodIndex<K> {
        match self {
            Self::Continuous(index) => index,
            Self::Amorphous(index) => index,
        }
    }
}

impl<K: Copy + Eq + Hash> NeighborhoodIndex<K> for Topology<K> {
    fn insert(&mut self, key: K, footprint: Footprint) -> Result<(), IndexError> {
        self.inner_mut().insert(key, footprint)
    }

    fn update(&mut self, key: K, footprint: Footprint) -> Result<(), IndexError> {
        self.inner_mut().update(key, footprint)
    }

    fn remove(&mut self, key: K) -> bool {
        self.inner_mut().remove(key)
    }

    fn contains(&self, key: K) -> bool {
        self.inner().contains(key)
    }

    fn len(&self) -> usize {
        self.inner().len()
    }

    fn neighbors_within(
        &self,
        origin: Coord,
        radius: f64,
        visitor: &mut dyn FnMut(K, OrderedFloat<f64>),
    ) {
        self.inner().neighbors_within(origin, radius, visitor);
    }

    fn agent_at(&self, location: Coord) -> Option<K> {
        self.inner().agent_at(location)
    }

    fn rebuild(&mut self, entries: &[(K, Footprint)]) -> Result<(), IndexError> {
        self.inner_mut().rebuild(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(torus: bool) -> ContinuousIndex<u32> {
        ContinuousIndex::new(TopologySettings::new(
            Bounds::from_size(100.0, 100.0),
            torus,
            10.0,
        ))
        .expect("grid")
    }

    fn collect(index: &impl NeighborhoodIndex<u32>, origin: Coord, radius: f64) -> Vec<u32> {
        let mut keys = Vec::new();
        index.neighbors_within(origin, radius, &mut |key, _| keys.push(key));
        keys.sort_unstable();
        keys
    }

    #[test]
    fn rejects_non_positive_cell_size() {
        let settings = TopologySettings::new(Bounds::from_size(10.0, 10.0), false, 0.0);
        assert!(matches!(
            ContinuousIndex::<u32>::new(settings),
            Err(IndexError::InvalidConfig(_))
        ));
    }

    #[test]
    fn neighbors_respect_radius() {
        let mut index = grid(false);
        index.insert(1, Footprint::point(Coord::new(50.0, 50.0))).unwrap();
        index.insert(2, Footprint::point(Coord::new(55.0, 50.0))).unwrap();
        index.insert(3, Footprint::point(Coord::new(80.0, 80.0))).unwrap();
        assert_eq!(collect(&index, Coord::new(50.0, 50.0), 6.0), vec![1, 2]);
        assert_eq!(collect(&index, Coord::new(50.0, 50.0), 50.0), vec![1, 2, 3]);
    }

    #[test]
    fn torus_wraps_queries_across_edges() {
        let mut flat = grid(false);
        let mut torus = grid(true);
        for index in [&mut flat, &mut torus] {
            index.insert(1, Footprint::point(Coord::new(1.0, 50.0))).unwrap();
            index.insert(2, Footprint::point(Coord::new(98.0, 50.0))).unwrap();
        }
        assert_eq!(collect(&flat, Coord::new(1.0, 50.0), 5.0), vec![1]);
        assert_eq!(collect(&torus, Coord::new(1.0, 50.0), 5.0), vec![1, 2]);
        assert_eq!(collect(&torus, Coord::new(-99.0, 150.0), 0.5), vec![1]);
        assert!((torus.distance(Coord::new(1.0, 50.0), Coord::new(98.0, 50.0)) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn unbounded_radius_reaches_every_agent_once() {
        for torus in [false, true] {
            let mut index = grid(torus);
            index.insert(1, Footprint::point(Coord::new(0.5, 0.5))).unwrap();
            index.insert(2, Footprint::point(Coord::new(99.5, 99.5))).unwrap();
            index.insert(3, Footprint::point(Coord::new(50.0, 10.0))).unwrap();
            let origin = Coord::new(20.0, 70.0);
            assert_eq!(collect(&index, origin, f64::INFINITY), vec![1, 2, 3]);
            assert_eq!(collect(&index, origin, 1e12), vec![1, 2, 3]);
            assert_eq!(collect(&index, origin, 100.0), vec![1, 2, 3]);
        }
    }

    #[test]
    fn wide_torus_query_visits_each_cell_once() {
        let index = grid(true);
        for radius in [35.0, 45.0, 60.0, 1e9] {
            let mut cells = index.cells_around(Coord::new(5.0, 95.0), radius);
            let visited = cells.len();
            cells.sort_unstable();
            cells.dedup();
            assert_eq!(cells.len(), visited, "radius {radius}");
            assert!(visited <= 100);
        }
        assert_eq!(index.cells_around(Coord::new(5.0, 5.0), 1e9).len(), 100);
    }

    #[test]
    fn torus_query_reaches_past_the_corner() {
        let mut index = grid(true);
        index.insert(1, Footprint::point(Coord::new(98.0, 98.0))).unwrap();
        index.insert(2, Footprint::point(Coord::new(60.0, 60.0))).unwrap();
        assert_eq!(collect(&index, Coord::new(2.0, 2.0), 6.0), vec![1]);
        assert_eq!(collect(&index, Coord::new(2.0, 2.0), 30.0), vec![1]);
    }

    #[test]
    fn agent_at_with_huge_footprint_stays_bounded() {
        let mut index = grid(false);
        index.insert(9, Footprint::new(Coord::new(50.0, 50.0), f64::INFINITY)).unwrap();
        assert_eq!(index.agent_at(Coord::new(1.0, 99.0)), Some(9));
    }

    #[test]
    fn update_moves_between_cells_and_remove_detaches() {
        let mut index = grid(false);
        index.insert(7, Footprint::point(Coord::new(5.0, 5.0))).unwrap();
        index.update(7, Footprint::point(Coord::new(95.0, 95.0))).unwrap();
        assert!(collect(&index, Coord::new(5.0, 5.0), 3.0).is_empty());
        assert_eq!(collect(&index, Coord::new(95.0, 95.0), 3.0), vec![7]);
        assert!(index.remove(7));
        assert!(!index.remove(7));
        assert!(collect(&index, Coord::new(95.0, 95.0), 3.0).is_empty());
        assert_eq!(
            index.update(7, Footprint::point(Coord::new(1.0, 1.0))),
            Err(IndexError::NotIndexed)
        );
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut index = grid(false);
        index.insert(1, Footprint::point(Coord::new(1.0, 1.0))).unwrap();
        assert_eq!(
            index.insert(1, Footprint::point(Coord::new(2.0, 2.0))),
            Err(IndexError::AlreadyIndexed)
        );
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn agent_at_prefers_earliest_covering_footprint() {
        let mut index = grid(false);
        index.insert(4, Footprint::new(Coord::new(20.0, 20.0), 5.0)).unwrap();
        index.insert(2, Footprint::new(Coord::new(22.0, 20.0), 5.0)).unwrap();
        assert_eq!(index.agent_at(Coord::new(21.0, 20.0)), Some(4));
        assert_eq!(index.agent_at(Coord::new(26.5, 20.0)), Some(2));
        assert_eq!(index.agent_at(Coord::new(60.0, 60.0)), None);
    }

    #[test]
    fn rebuild_is_a_full_reset() {
        let mut index = grid(false);
        index.insert(1, Footprint::point(Coord::new(1.0, 1.0))).unwrap();
        index
            .rebuild(&[(2, Footprint::point(Coord::new(3.0, 3.0)))])
            .unwrap();
        assert!(!index.contains(1));
        assert!(index.contains(2));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn amorphous_tracks_identity_only() {
        let mut topology: Topology<u32> = Topology::amorphous();
        topology.insert(1, Footprint::default()).unwrap();
        topology.insert(2, Footprint::default()).unwrap();
        assert!(topology.contains(1));
        assert!(topology.neighbors(Coord::new(0.0, 0.0), 1_000.0).is_empty());
        assert_eq!(topology.agent_at(Coord::new(0.0, 0.0)), None);
        assert!(topology.remove(1));
        assert_eq!(topology.len(), 1);
        assert!(!topology.is_torus());
    }

    #[test]
    fn neighbors_are_sorted_by_distance() {
        let mut topology: Topology<u32> =
            Topology::continuous(TopologySettings::new(Bounds::from_size(50.0, 50.0), false, 5.0))
                .unwrap();
        topology.insert(1, Footprint::point(Coord::new(10.0, 10.0))).unwrap();
        topology.insert(2, Footprint::point(Coord::new(12.0, 10.0))).unwrap();
        topology.insert(3, Footprint::point(Coord::new(11.0, 10.0))).unwrap();
        let ordered: Vec<u32> = topology
            .neighbors(Coord::new(12.5, 10.0), 10.0)
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(ordered, vec![2, 3, 1]);
    }
}

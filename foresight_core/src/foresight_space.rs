//! The "SPACE" Engine - Quadtree index over candidate regions
//!
//! Narrows a large set of on-screen regions down to the few that lie along
//! the pointer's predicted path:
//! - `Quadtree` partitions the viewport into quadrants, keeping oversized
//!   regions at the parent level
//! - `SpatialIndex` holds the current tree as an immutable snapshot that is
//!   rebuilt off to the side and swapped in, so readers never block on a
//!   rebuild
//!
//! ```text
//!   +---------+---------+
//!   |   NW    |   NE    |      A region straddling the split lines
//!   |    [r1] |         |      stays in the parent's item list.
//!   +-----[ r3 ]--------+
//!   |   SW    |   SE    |
//!   |         |  [r2]   |
//!   +---------+---------+
//! ```

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use foresight_env::ResourceKey;
use geo::{coord, Coord, Rect};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::ConfigError;

const GEOMETRY_EPSILON: f64 = 1e-9;

/// Stable identifier of a candidate region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionId(pub Uuid);

impl RegionId {
    /// A fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// A deterministic identifier, for reproducible runs.
    pub fn from_index(index: u64) -> Self {
        Self(Uuid::from_u128(index as u128))
    }
}

impl Default for RegionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A rectangular on-screen target backed by a fetchable resource.
///
/// Supplied from outside; the engine only indexes and scores regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: RegionId,

    /// Screen-space bounds (y grows downwards, but nothing here cares)
    pub bounds: Rect<f64>,

    /// What to prefetch when the pointer heads here
    pub key: ResourceKey,

    /// Caller-defined priority; carried through to candidates untouched
    pub priority: i32,
}

impl Region {
    /// Region with its top-left corner at `(x, y)` and size `width`×`height`.
    pub fn new(id: RegionId, x: f64, y: f64, width: f64, height: f64, key: impl Into<ResourceKey>) -> Self {
        Self {
            id,
            bounds: Rect::new(coord! { x: x, y: y }, coord! { x: x + width, y: y + height }),
            key: key.into(),
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn center(&self) -> Point2<f64> {
        let c = self.bounds.center();
        Point2::new(c.x, c.y)
    }

    /// Half of the smaller dimension.
    pub fn effective_radius(&self) -> f64 {
        self.bounds.width().min(self.bounds.height()) / 2.0
    }

    pub fn contains_point(&self, point: &Point2<f64>) -> bool {
        rect_contains_point(&self.bounds, point.x, point.y)
    }
}

/// Builds a viewport rectangle, rejecting empty or non-finite sizes.
pub fn viewport(x: f64, y: f64, width: f64, height: f64) -> Result<Rect<f64>, ConfigError> {
    let valid = [x, y, width, height].iter().all(|v| v.is_finite()) && width > 0.0 && height > 0.0;
    if !valid {
        return Err(ConfigError::EmptyViewport { width, height });
    }
    Ok(Rect::new(coord! { x: x, y: y }, coord! { x: x + width, y: y + height }))
}

// ============================================================================
// QUADTREE
// ============================================================================

/// Configuration for the Quadtree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuadtreeConfig {
    /// Items a node holds before it subdivides (default: 4)
    pub capacity: usize,

    /// Deepest level a node may subdivide to; the root is depth 0 (default: 5)
    pub max_depth: usize,
}

impl Default for QuadtreeConfig {
    fn default() -> Self {
        Self {
            capacity: 4,
            max_depth: 5,
        }
    }
}

impl QuadtreeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::require_nonzero("quadtree.capacity", self.capacity)
    }
}

#[derive(Debug, Clone)]
struct QuadNode {
    bounds: Rect<f64>,
    depth: usize,
    /// Indices into `Quadtree::regions`
    items: Vec<usize>,
    children: Option<Box<[QuadNode; 4]>>,
}

impl QuadNode {
    fn new(bounds: Rect<f64>, depth: usize) -> Self {
        Self {
            bounds,
            depth,
            items: Vec::new(),
            children: None,
        }
    }

    fn insert(&mut self, index: usize, regions: &[Region], config: &QuadtreeConfig) {
        let rect = &regions[index].bounds;

        if let Some(children) = self.children.as_mut() {
            match children.iter_mut().find(|c| rect_contains_rect(&c.bounds, rect)) {
                Some(child) => child.insert(index, regions, config),
                None => self.items.push(index),
            }
            return;
        }

        self.items.push(index);
        if self.items.len() > config.capacity && self.depth < config.max_depth {
            self.subdivide(regions, config);
        }
    }

    /// Splits into four quadrants and pushes down every item that fits
    /// entirely inside one of them.
    fn subdivide(&mut self, regions: &[Region], config: &QuadtreeConfig) {
        let min = self.bounds.min();
        let max = self.bounds.max();
        let mid = self.bounds.center();
        let depth = self.depth + 1;

        let quadrant = |a: Coord<f64>, b: Coord<f64>| QuadNode::new(Rect::new(a, b), depth);
        let mut children = Box::new([
            quadrant(min, mid),
            quadrant(coord! { x: mid.x, y: min.y }, coord! { x: max.x, y: mid.y }),
            quadrant(coord! { x: min.x, y: mid.y }, coord! { x: mid.x, y: max.y }),
            quadrant(mid, max),
        ]);

        let mut kept = Vec::new();
        for index in self.items.drain(..) {
            let rect = &regions[index].bounds;
            match children.iter_mut().find(|c| rect_contains_rect(&c.bounds, rect)) {
                Some(child) => child.insert(index, regions, config),
                None => kept.push(index),
            }
        }
        self.items = kept;
        self.children = Some(children);
    }

    fn query_line(
        &self,
        start: &Point2<f64>,
        end: &Point2<f64>,
        regions: &[Region],
        seen: &mut HashSet<usize>,
        out: &mut Vec<usize>,
    ) {
        if !segment_intersects_rect(start, end, &self.bounds) {
            return;
        }

        for &index in &self.items {
            if segment_intersects_rect(start, end, &regions[index].bounds) && seen.insert(index) {
                out.push(index);
            }
        }

        if let Some(children) = &self.children {
            for child in children.iter() {
                child.query_line(start, end, regions, seen, out);
            }
        }
    }

    fn visit(&self, stats: &mut QuadtreeStats) {
        stats.nodes += 1;
        stats.depth = stats.depth.max(self.depth);
        if let Some(children) = &self.children {
            for child in children.iter() {
                child.visit(stats);
            }
        } else {
            stats.leaves += 1;
        }
    }
}

/// Quadtree over the regions of one viewport.
#[derive(Debug, Clone)]
pub struct Quadtree {
    config: QuadtreeConfig,
    root: QuadNode,
    regions: Vec<Region>,
}

impl Quadtree {
    pub fn new(bounds: Rect<f64>, config: QuadtreeConfig) -> Self {
        Self {
            root: QuadNode::new(bounds, 0),
            config,
            regions: Vec::new(),
        }
    }

    /// Builds a tree from scratch over `regions`.
    pub fn build<'a>(
        bounds: Rect<f64>,
        regions: impl IntoIterator<Item = &'a Region>,
        config: QuadtreeConfig,
    ) -> Self {
        let mut tree = Self::new(bounds, config);
        for region in regions {
            tree.insert(region.clone());
        }
        tree
    }

    /// Inserts `region` if it overlaps the tree bounds. Returns whether it
    /// was stored.
    pub fn insert(&mut self, region: Region) -> bool {
        if !rects_intersect(&self.root.bounds, &region.bounds) {
            return false;
        }
        let index = self.regions.len();
        self.regions.push(region);
        self.root.insert(index, &self.regions, &self.config);
        true
    }

    /// Every region whose bounds touch the segment `start → end`, each
    /// reported once.
    pub fn query_line(&self, start: &Point2<f64>, end: &Point2<f64>) -> Vec<&Region> {
        let mut seen = HashSet::new();
        let mut hits = Vec::new();
        self.root
            .query_line(start, end, &self.regions, &mut seen, &mut hits);
        hits.into_iter().map(|i| &self.regions[i]).collect()
    }

    /// Empties the tree, keeping its bounds.
    pub fn clear(&mut self) {
        self.root = QuadNode::new(self.root.bounds, 0);
        self.regions.clear();
    }

    pub fn bounds(&self) -> Rect<f64> {
        self.root.bounds
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn stats(&self) -> QuadtreeStats {
        let mut stats = QuadtreeStats {
            regions: self.regions.len(),
            ..QuadtreeStats::default()
        };
        self.root.visit(&mut stats);
        stats
    }
}

/// Shape of a built tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuadtreeStats {
    pub regions: usize,
    pub nodes: usize,
    pub leaves: usize,
    pub depth: usize,
}

// ============================================================================
// SNAPSHOT HOLDER
// ============================================================================

/// Copy-on-rebuild holder for the current quadtree.
///
/// Rebuilds happen on a private tree and are published with a single
/// pointer swap; queries keep the snapshot they started with.
#[derive(Debug)]
pub struct SpatialIndex {
    current: RwLock<Arc<Quadtree>>,
    config: QuadtreeConfig,
}

impl SpatialIndex {
    pub fn new(bounds: Rect<f64>, config: QuadtreeConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(Quadtree::new(bounds, config.clone()))),
            config,
        }
    }

    /// The tree readers should query right now.
    pub fn snapshot(&self) -> Arc<Quadtree> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Builds a fresh tree over `regions` and swaps it in.
    pub fn rebuild(&self, bounds: Rect<f64>, regions: &[Region]) -> QuadtreeStats {
        let tree = Quadtree::build(bounds, regions, self.config.clone());
        let stats = tree.stats();
        debug!(
            regions = stats.regions,
            dropped = regions.len() - stats.regions,
            nodes = stats.nodes,
            depth = stats.depth,
            "Spatial index rebuilt"
        );

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(tree);
        stats
    }

    pub fn query_line(&self, start: &Point2<f64>, end: &Point2<f64>) -> Vec<Region> {
        self.snapshot()
            .query_line(start, end)
            .into_iter()
            .cloned()
            .collect()
    }
}

// ============================================================================
// GEOMETRY
// ============================================================================

fn rect_contains_point(rect: &Rect<f64>, x: f64, y: f64) -> bool {
    let (min, max) = (rect.min(), rect.max());
    x >= min.x && x <= max.x && y >= min.y && y <= max.y
}

fn rect_contains_rect(outer: &Rect<f64>, inner: &Rect<f64>) -> bool {
    let (omin, omax) = (outer.min(), outer.max());
    let (imin, imax) = (inner.min(), inner.max());
    imin.x >= omin.x && imax.x <= omax.x && imin.y >= omin.y && imax.y <= omax.y
}

fn rects_intersect(a: &Rect<f64>, b: &Rect<f64>) -> bool {
    let (amin, amax) = (a.min(), a.max());
    let (bmin, bmax) = (b.min(), b.max());
    amin.x <= bmax.x && bmin.x <= amax.x && amin.y <= bmax.y && bmin.y <= amax.y
}

/// Inclusive segment/rectangle test. Touching an edge or corner counts.
pub fn segment_intersects_rect(start: &Point2<f64>, end: &Point2<f64>, rect: &Rect<f64>) -> bool {
    let (min, max) = (rect.min(), rect.max());

    if rect_contains_point(rect, start.x, start.y) || rect_contains_point(rect, end.x, end.y) {
        return true;
    }

    // Axis-aligned segments reduce to an interval overlap
    if (end.y - start.y).abs() < GEOMETRY_EPSILON {
        let (lo, hi) = (start.x.min(end.x), start.x.max(end.x));
        return start.y >= min.y && start.y <= max.y && lo <= max.x && hi >= min.x;
    }
    if (end.x - start.x).abs() < GEOMETRY_EPSILON {
        let (lo, hi) = (start.y.min(end.y), start.y.max(end.y));
        return start.x >= min.x && start.x <= max.x && lo <= max.y && hi >= min.y;
    }

    let corners = [
        Point2::new(min.x, min.y),
        Point2::new(max.x, min.y),
        Point2::new(max.x, max.y),
        Point2::new(min.x, max.y),
    ];
    (0..4).any(|i| segments_intersect(start, end, &corners[i], &corners[(i + 1) % 4]))
}

/// Inclusive segment/segment test using orientation signs.
fn segments_intersect(p1: &Point2<f64>, p2: &Point2<f64>, p3: &Point2<f64>, p4: &Point2<f64>) -> bool {
    let d1 = orientation(p3, p4, p1);
    let d2 = orientation(p3, p4, p2);
    let d3 = orientation(p1, p2, p3);
    let d4 = orientation(p1, p2, p4);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }

    (d1.abs() < GEOMETRY_EPSILON && on_segment(p3, p4, p1))
        || (d2.abs() < GEOMETRY_EPSILON && on_segment(p3, p4, p2))
        || (d3.abs() < GEOMETRY_EPSILON && on_segment(p1, p2, p3))
        || (d4.abs() < GEOMETRY_EPSILON && on_segment(p1, p2, p4))
}

/// Cross product of `(b - a) × (c - a)`.
fn orientation(a: &Point2<f64>, b: &Point2<f64>, c: &Point2<f64>) -> f64 {
    (b - a).perp(&(c - a))
}

/// Whether collinear point `p` lies within the bounding box of `a → b`.
fn on_segment(a: &Point2<f64>, b: &Point2<f64>, p: &Point2<f64>) -> bool {
    p.x >= a.x.min(b.x) && p.x <= a.x.max(b.x) && p.y >= a.y.min(b.y) && p.y <= a.y.max(b.y)
}

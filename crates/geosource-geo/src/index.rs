use geosource_core::{Envelope, Geometry};
use rstar::{ParentNode, RTree, RTreeNode, RTreeObject, AABB};

/// Index entry: a stored envelope and its payload
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry<T> {
    /// The payload, usually a feature id
    pub payload: T,

    /// Bounding box for spatial indexing
    envelope: AABB<[f64; 2]>,
}

impl<T> IndexEntry<T> {
    pub fn envelope(&self) -> Envelope {
        let lower = self.envelope.lower();
        let upper = self.envelope.upper();
        Envelope::new(lower[0], lower[1], upper[0], upper[1])
    }
}

impl<T> RTreeObject for IndexEntry<T> {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

fn to_aabb(envelope: &Envelope) -> Option<AABB<[f64; 2]>> {
    if envelope.is_null() {
        return None;
    }
    Some(AABB::from_corners(
        [envelope.min_x, envelope.min_y],
        [envelope.max_x, envelope.max_y],
    ))
}

/// Structure statistics of an index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub entries: usize,
    /// Inner nodes, root included
    pub nodes: usize,
    /// Inner nodes whose children are all entries
    pub leaves: usize,
    pub depth: usize,
}

/// R-Tree over envelopes.
///
/// Queries are a coarse filter: they return every entry whose stored envelope
/// intersects the query envelope, and callers apply an exact test afterwards.
#[derive(Debug, Clone)]
pub struct SpatialIndex<T> {
    tree: RTree<IndexEntry<T>>,
}

impl<T: Clone + PartialEq> SpatialIndex<T> {
    /// Create a new empty spatial index
    pub fn new() -> Self {
        Self { tree: RTree::new() }
    }

    /// Bulk-load an index; entries with null envelopes are skipped
    pub fn bulk_load(items: Vec<(Envelope, T)>) -> Self {
        let entries = items
            .into_iter()
            .filter_map(|(envelope, payload)| {
                to_aabb(&envelope).map(|envelope| IndexEntry { payload, envelope })
            })
            .collect();
        Self { tree: RTree::bulk_load(entries) }
    }

    /// Insert an entry. Returns false for a null envelope, which cannot be indexed.
    pub fn insert(&mut self, envelope: &Envelope, payload: T) -> bool {
        match to_aabb(envelope) {
            Some(envelope) => {
                self.tree.insert(IndexEntry { payload, envelope });
                true
            }
            None => false,
        }
    }

    /// Insert a geometry under its envelope
    pub fn insert_geometry(&mut self, geometry: &Geometry, payload: T) -> bool {
        self.insert(&geometry.envelope(), payload)
    }

    /// Remove the entry stored under `envelope` with this payload. Falls back
    /// to a full scan when the envelope no longer matches the stored one.
    pub fn remove(&mut self, envelope: &Envelope, payload: &T) -> bool {
        if let Some(envelope) = to_aabb(envelope) {
            let probe = IndexEntry { payload: payload.clone(), envelope };
            if self.tree.remove(&probe).is_some() {
                return true;
            }
        }
        self.remove_payload(payload)
    }

    /// Remove an entry by payload alone
    pub fn remove_payload(&mut self, payload: &T) -> bool {
        let found = self.tree.iter().find(|e| e.payload == *payload).cloned();
        match found {
            Some(entry) => self.tree.remove(&entry).is_some(),
            None => false,
        }
    }

    /// Payloads whose envelope intersects `envelope`
    pub fn query(&self, envelope: &Envelope) -> Vec<&T> {
        match to_aabb(envelope) {
            Some(aabb) => self
                .tree
                .locate_in_envelope_intersecting(&aabb)
                .map(|e| &e.payload)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Candidates for a geometry: entries intersecting its envelope
    pub fn query_geometry(&self, geometry: &Geometry) -> Vec<&T> {
        self.query(&geometry.envelope())
    }

    /// Candidates around a point, for hit-testing
    pub fn query_point(&self, x: f64, y: f64, tolerance: f64) -> Vec<&T> {
        self.query(&Envelope::from_point(x, y).expanded_by(tolerance.max(0.0)))
    }

    /// Union of all stored envelopes
    pub fn extent(&self) -> Envelope {
        let mut extent = Envelope::null();
        if self.tree.size() > 0 {
            let aabb = self.tree.root().envelope();
            extent.expand_to_include(&Envelope::new(
                aabb.lower()[0],
                aabb.lower()[1],
                aabb.upper()[0],
                aabb.upper()[1],
            ));
        }
        extent
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry<T>> {
        self.tree.iter()
    }

    /// Get the total number of entries in the index
    pub fn len(&self) -> usize {
        self.tree.size()
    }

    /// Check if the index is empty
    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    /// Clear the index
    pub fn clear(&mut self) {
        self.tree = RTree::new();
    }

    /// Walk the tree and count its nodes
    pub fn stats(&self) -> IndexStats {
        let mut stats = IndexStats { entries: self.tree.size(), ..IndexStats::default() };
        walk(self.tree.root(), 1, &mut stats);
        stats
    }
}

fn walk<T>(node: &ParentNode<IndexEntry<T>>, depth: usize, stats: &mut IndexStats) {
    stats.nodes += 1;
    stats.depth = stats.depth.max(depth);
    let mut has_parent_child = false;
    for child in node.children() {
        if let RTreeNode::Parent(parent) = child {
            has_parent_child = true;
            walk(parent, depth + 1, stats);
        }
    }
    if !has_parent_child {
        stats.leaves += 1;
    }
}

impl<T: Clone + PartialEq> Default for SpatialIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spatial_index_creation() {
        let index: SpatialIndex<i64> = SpatialIndex::new();
        assert_eq!(index.len(), 0);
        assert!(index.is_empty());
        assert!(index.extent().is_null());
    }

    #[test]
    fn test_query_returns_intersecting_candidates() {
        let mut index = SpatialIndex::new();
        index.insert(&Envelope::new(0.0, 0.0, 10.0, 10.0), "A");
        index.insert(&Envelope::new(20.0, 20.0, 30.0, 30.0), "B");
        index.insert(&Envelope::new(5.0, 5.0, 15.0, 15.0), "C");

        let mut hits: Vec<&str> = index.query(&Envelope::new(0.0, 0.0, 12.0, 12.0)).into_iter().copied().collect();
        hits.sort();
        assert_eq!(hits, vec!["A", "C"]);
    }

    #[test]
    fn test_null_envelope_not_indexed() {
        let mut index = SpatialIndex::new();
        assert!(!index.insert(&Envelope::null(), 1));
        assert!(index.is_empty());
        assert!(index.query(&Envelope::null()).is_empty());
    }

    #[test]
    fn test_remove() {
        let mut index = SpatialIndex::new();
        let envelope = Envelope::new(1.0, 1.0, 2.0, 2.0);
        index.insert(&envelope, 7i64);
        index.insert(&envelope, 8i64);

        assert!(index.remove(&envelope, &7));
        assert!(!index.remove(&envelope, &7));
        assert_eq!(index.len(), 1);

        // Stale envelope falls back to a payload scan
        assert!(index.remove(&Envelope::new(50.0, 50.0, 60.0, 60.0), &8));
        assert!(index.is_empty());
    }

    #[test]
    fn test_point_query_and_clear() {
        let mut index = SpatialIndex::new();
        index.insert_geometry(&Geometry::point(0.0, 0.0), 1);
        index.insert_geometry(&Geometry::point(5.0, 5.0), 2);

        assert_eq!(index.query_point(0.5, 0.5, 1.0), vec![&1]);
        assert!(index.query_point(2.5, 2.5, 0.5).is_empty());

        index.clear();
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_stats() {
        let items: Vec<_> = (0..500)
            .map(|i| {
                let x = f64::from(i % 25);
                let y = f64::from(i / 25);
                (Envelope::new(x, y, x + 0.5, y + 0.5), i)
            })
            .collect();
        let index = SpatialIndex::bulk_load(items);
        let stats = index.stats();
        assert_eq!(stats.entries, 500);
        assert!(stats.depth >= 2);
        assert!(stats.leaves >= 1 && stats.leaves < stats.nodes);
        assert_eq!(index.extent(), Envelope::new(0.0, 0.0, 24.5, 19.5));
    }

    fn envelope_strategy() -> impl proptest::strategy::Strategy<Value = Envelope> {
        use proptest::prelude::*;
        (-100i32..100, -100i32..100, 0i32..20, 0i32..20).prop_map(|(x, y, w, h)| {
            Envelope::new(x.into(), y.into(), f64::from(x + w), f64::from(y + h))
        })
    }

    proptest::proptest! {
        #[test]
        fn prop_query_matches_linear_scan(
            boxes in proptest::collection::vec(envelope_strategy(), 0..200),
            window in envelope_strategy(),
        ) {
            let index = SpatialIndex::bulk_load(boxes.iter().copied().enumerate().map(|(i, e)| (e, i)).collect());
            let mut found: Vec<usize> = index.query(&window).into_iter().copied().collect();
            found.sort_unstable();
            let expected: Vec<usize> =
                boxes.iter().enumerate().filter(|(_, e)| e.intersects(&window)).map(|(i, _)| i).collect();
            proptest::prop_assert_eq!(found, expected);
            proptest::prop_assert_eq!(index.stats().entries, boxes.len());
        }
    }
}

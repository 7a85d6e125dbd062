// Duplicate clustering over perceptual fingerprints.
// Pairwise distances fan out on rayon; the union-find reduction runs on the
// calling thread.

use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::core::hash::Fingerprint;
use crate::database::models::ItemId;

/// A connected component of items whose fingerprints are within the
/// threshold of at least one other member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cluster {
    pub ids: BTreeSet<ItemId>,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.ids.contains(&id)
    }
}

struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
            rank: vec![0; size],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        if self.rank[ra] < self.rank[rb] {
            self.parent[ra] = rb;
        } else if self.rank[ra] > self.rank[rb] {
            self.parent[rb] = ra;
        } else {
            self.parent[rb] = ra;
            self.rank[ra] += 1;
        }
    }
}

/// Index pairs `(i, j)` with `i < j` whose distance is `<= threshold`.
fn close_pairs<F>(n: usize, threshold: u32, distance: &F) -> Vec<(usize, usize)>
where
    F: Fn(usize, usize) -> u32 + Sync,
{
    (0..n)
        .into_par_iter()
        .flat_map_iter(|i| {
            (i + 1..n).filter_map(move |j| (distance(i, j) <= threshold).then_some((i, j)))
        })
        .collect()
}

/// Partition `pairs` into duplicate clusters.
///
/// Membership is transitive: two items end up together when a chain of
/// pairs, each within `threshold`, connects them. Items without any
/// neighbour are not reported. The order of the returned clusters is
/// unspecified. Repeated ids keep their first fingerprint.
pub fn cluster(pairs: &[(ItemId, Fingerprint)], threshold: u32) -> Vec<Cluster> {
    let mut seen = HashSet::with_capacity(pairs.len());
    let points: Vec<(ItemId, Fingerprint)> = pairs
        .iter()
        .copied()
        .filter(|(id, _)| seen.insert(*id))
        .collect();

    let ids: Vec<ItemId> = points.iter().map(|(id, _)| *id).collect();
    cluster_by(&ids, threshold, |i, j| points[i].1.distance(points[j].1))
}

/// Same as [`cluster`] with an arbitrary distance between the `i`th and
/// `j`th id. `ids` must not contain repeats.
pub fn cluster_by<F>(ids: &[ItemId], threshold: u32, distance: F) -> Vec<Cluster>
where
    F: Fn(usize, usize) -> u32 + Sync,
{
    if ids.len() < 2 {
        return Vec::new();
    }

    let edges = close_pairs(ids.len(), threshold, &distance);
    log::debug!(
        "{} of {} candidate pairs within distance {}",
        edges.len(),
        ids.len() * (ids.len() - 1) / 2,
        threshold
    );

    let mut sets = DisjointSet::new(ids.len());
    for &(i, j) in &edges {
        sets.union(i, j);
    }

    let mut components: HashMap<usize, BTreeSet<ItemId>> = HashMap::new();
    for &(i, j) in &edges {
        for idx in [i, j] {
            let root = sets.find(idx);
            components.entry(root).or_default().insert(ids[idx]);
        }
    }

    components
        .into_values()
        .filter(|members| members.len() > 1)
        .map(|ids| Cluster { ids })
        .collect()
}

//! HNSW graph over record embeddings.
//!
//! The index is approximate: a query visits at most `ef` candidates per layer, so the
//! returned neighbors are a sample of the true nearest set. `ef_search` is the knob;
//! [`HnswIndex::search_exact`] scores an explicit candidate set without the graph.
//!
//! The index holds no locks of its own. The store wraps it together with the record
//! table so a search sees both under one read guard.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

use ordered_float::OrderedFloat;

use crate::config::IndexParams;
use crate::vector::Metric;

const MAX_LEVEL: usize = 16;

/// Ordered by distance, then id, so every tie resolves the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Candidate {
    dist: OrderedFloat<f32>,
    node_id: u128,
}

impl Candidate {
    fn new(dist: f32, node_id: u128) -> Self {
        Self { dist: OrderedFloat(dist), node_id }
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist.cmp(&other.dist).then(self.node_id.cmp(&other.node_id))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
struct Node {
    vector: Vec<f32>,
    connections: Vec<Vec<u128>>,
}

#[derive(Debug)]
pub struct HnswIndex {
    nodes: HashMap<u128, Node>,
    entry_point: Option<u128>,
    max_layer: usize,
    params: IndexParams,
    metric: Metric,
    level_mult: f64,
}

impl HnswIndex {
    pub fn new(params: IndexParams, metric: Metric) -> Self {
        Self {
            nodes: HashMap::new(),
            entry_point: None,
            max_layer: 0,
            params,
            metric,
            level_mult: 1.0 / (params.m.max(2) as f64).ln(),
        }
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn params(&self) -> IndexParams {
        self.params
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn layers(&self) -> usize {
        if self.entry_point.is_some() { self.max_layer + 1 } else { 0 }
    }

    pub fn contains(&self, id: u128) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = u128> + '_ {
        self.nodes.keys().copied()
    }

    pub fn vector(&self, id: u128) -> Option<&[f32]> {
        self.nodes.get(&id).map(|n| n.vector.as_slice())
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.entry_point = None;
        self.max_layer = 0;
    }

    /// Node level from the id hash: geometric with ratio `1/m`, identical across rebuilds.
    fn level_for(&self, id: u128) -> usize {
        let h = seahash::hash(&id.to_le_bytes());
        let u = (h >> 11) as f64 / (1u64 << 53) as f64;
        let level = (-(1.0 - u).ln() * self.level_mult).floor() as usize;
        level.min(MAX_LEVEL)
    }

    fn max_links(&self, layer: usize) -> usize {
        if layer == 0 { self.params.m * 2 } else { self.params.m }
    }

    /// Insert or replace the vector for `id`.
    pub fn insert(&mut self, id: u128, vector: Vec<f32>) {
        if self.nodes.contains_key(&id) {
            self.remove(id);
        }

        let level = self.level_for(id);
        let Some(entry) = self.entry_point else {
            self.nodes.insert(id, Node { vector, connections: vec![Vec::new(); level + 1] });
            self.entry_point = Some(id);
            self.max_layer = level;
            return;
        };

        // Greedy descent through layers above the new node's level
        let mut eps = vec![entry];
        for lc in (level + 1..=self.max_layer).rev() {
            let nearest = self.search_layer(&vector, &eps, 1, lc);
            if let Some(best) = nearest.first() {
                eps = vec![best.node_id];
            }
        }

        let top = level.min(self.max_layer);
        let mut connections = vec![Vec::new(); level + 1];
        for lc in (0..=top).rev() {
            let found = self.search_layer(&vector, &eps, self.params.ef_construction, lc);
            connections[lc] = found.iter().take(self.max_links(lc)).map(|c| c.node_id).collect();
            if !found.is_empty() {
                eps = found.iter().map(|c| c.node_id).collect();
            }
        }

        self.nodes.insert(id, Node { vector, connections: connections.clone() });
        for (lc, links) in connections.iter().enumerate() {
            for &peer in links {
                self.connect(peer, id, lc);
            }
        }

        if level > self.max_layer {
            self.max_layer = level;
            self.entry_point = Some(id);
        }
    }

    /// Add `to` to `from`'s links on `layer`, keeping only the nearest `max_links`.
    fn connect(&mut self, from: u128, to: u128, layer: usize) {
        let cap = self.max_links(layer);
        let links = {
            let Some(node) = self.nodes.get(&from) else { return };
            if layer >= node.connections.len() || from == to || node.connections[layer].contains(&to) {
                return;
            }
            let mut links = node.connections[layer].clone();
            links.push(to);
            if links.len() > cap {
                let mut scored: Vec<Candidate> = links
                    .iter()
                    .filter_map(|l| self.nodes.get(l).map(|n| Candidate::new(self.metric.distance(&node.vector, &n.vector), *l)))
                    .collect();
                scored.sort();
                scored.truncate(cap);
                links = scored.into_iter().map(|c| c.node_id).collect();
            }
            links
        };
        if let Some(node) = self.nodes.get_mut(&from) {
            node.connections[layer] = links;
        }
    }

    /// Remove `id` and re-link its former neighbors among themselves.
    pub fn remove(&mut self, id: u128) -> bool {
        let Some(removed) = self.nodes.remove(&id) else { return false };

        // Pruning makes links asymmetric, so incoming edges are found by a full sweep.
        for node in self.nodes.values_mut() {
            for links in node.connections.iter_mut() {
                links.retain(|l| *l != id);
            }
        }

        for (lc, links) in removed.connections.iter().enumerate() {
            for &a in links {
                for &b in links {
                    if a != b {
                        self.connect(a, b, lc);
                    }
                }
            }
        }

        if self.entry_point == Some(id) {
            let next = self
                .nodes
                .iter()
                .map(|(nid, n)| (n.connections.len() - 1, Reverse(*nid)))
                .max();
            match next {
                Some((layer, Reverse(nid))) => {
                    self.entry_point = Some(nid);
                    self.max_layer = layer;
                }
                None => {
                    self.entry_point = None;
                    self.max_layer = 0;
                }
            }
        }
        true
    }

    /// Beam search on one layer. Returns up to `ef` candidates, nearest first.
    fn search_layer(&self, query: &[f32], entry_points: &[u128], ef: usize, layer: usize) -> Vec<Candidate> {
        let mut visited: HashSet<u128> = HashSet::new();
        let mut frontier: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();
        let mut results: BinaryHeap<Candidate> = BinaryHeap::new();

        for &ep in entry_points {
            if let Some(node) = self.nodes.get(&ep) {
                if visited.insert(ep) {
                    let c = Candidate::new(self.metric.distance(query, &node.vector), ep);
                    frontier.push(Reverse(c));
                    results.push(c);
                }
            }
        }
        while results.len() > ef {
            results.pop();
        }

        while let Some(Reverse(current)) = frontier.pop() {
            if let Some(furthest) = results.peek() {
                if results.len() >= ef && current > *furthest {
                    break;
                }
            }
            let Some(node) = self.nodes.get(&current.node_id) else { continue };
            let Some(links) = node.connections.get(layer) else { continue };

            for &neighbor in links {
                if !visited.insert(neighbor) {
                    continue;
                }
                let Some(n) = self.nodes.get(&neighbor) else { continue };
                let c = Candidate::new(self.metric.distance(query, &n.vector), neighbor);
                let admit = results.len() < ef || results.peek().map_or(true, |f| c < *f);
                if admit {
                    frontier.push(Reverse(c));
                    results.push(c);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        results.into_sorted_vec()
    }

    /// Approximate k nearest: `(id, distance)` ascending, ties by smaller id.
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<(u128, f32)> {
        let Some(entry) = self.entry_point else { return vec![] };
        let k = k.min(self.nodes.len());
        if k == 0 {
            return vec![];
        }

        let mut eps = vec![entry];
        for lc in (1..=self.max_layer).rev() {
            if let Some(best) = self.search_layer(query, &eps, 1, lc).first() {
                eps = vec![best.node_id];
            }
        }

        self.search_layer(query, &eps, ef.max(k), 0)
            .into_iter()
            .take(k)
            .map(|c| (c.node_id, c.dist.into_inner()))
            .collect()
    }

    /// Exact k nearest among `candidates`. Ids absent from the index are skipped.
    pub fn search_exact<I>(&self, query: &[f32], k: usize, candidates: I) -> Vec<(u128, f32)>
    where
        I: IntoIterator<Item = u128>,
    {
        let k = k.min(self.nodes.len());
        if k == 0 {
            return vec![];
        }
        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(k + 1);
        for id in candidates {
            let Some(node) = self.nodes.get(&id) else { continue };
            let c = Candidate::new(self.metric.distance(query, &node.vector), id);
            if heap.len() < k {
                heap.push(c);
            } else if heap.peek().map_or(false, |f| c < *f) {
                heap.pop();
                heap.push(c);
            }
        }
        heap.into_sorted_vec().into_iter().map(|c| (c.node_id, c.dist.into_inner())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<(u128, Vec<f32>)> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|i| (i as u128 + 1, (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect()))
            .collect()
    }

    fn brute_force(data: &[(u128, Vec<f32>)], q: &[f32], k: usize, metric: Metric) -> Vec<u128> {
        let mut scored: Vec<Candidate> = data.iter().map(|(id, v)| Candidate::new(metric.distance(q, v), *id)).collect();
        scored.sort();
        scored.into_iter().take(k).map(|c| c.node_id).collect()
    }

    #[test]
    fn small_graph_is_exact() {
        let data = random_vectors(30, 8, 1);
        let mut idx = HnswIndex::new(IndexParams::default(), Metric::Cosine);
        for (id, v) in &data {
            idx.insert(*id, v.clone());
        }
        let q = &data[3].1;
        let got: Vec<u128> = idx.search(q, 5, 64).into_iter().map(|(id, _)| id).collect();
        assert_eq!(got, brute_force(&data, q, 5, Metric::Cosine));
        assert_eq!(got[0], data[3].0);
    }

    #[test]
    fn recall_stays_high_on_larger_graph() {
        let data = random_vectors(600, 16, 2);
        let mut idx = HnswIndex::new(IndexParams { m: 8, ef_construction: 64, ef_search: 64 }, Metric::Euclidean);
        for (id, v) in &data {
            idx.insert(*id, v.clone());
        }

        let queries = random_vectors(20, 16, 3);
        let mut hits = 0;
        for (_, q) in &queries {
            let truth: HashSet<u128> = brute_force(&data, q, 10, Metric::Euclidean).into_iter().collect();
            hits += idx.search(q, 10, 128).iter().filter(|(id, _)| truth.contains(id)).count();
        }
        // Approximate: tolerate misses, but most true neighbors must come back.
        assert!(hits as f32 / 200.0 >= 0.8, "recall {}", hits as f32 / 200.0);
    }

    #[test]
    fn update_replaces_vector() {
        let mut idx = HnswIndex::new(IndexParams::default(), Metric::Euclidean);
        idx.insert(1, vec![0.0, 0.0]);
        idx.insert(2, vec![10.0, 10.0]);
        idx.insert(1, vec![9.0, 9.0]);

        assert_eq!(idx.len(), 2);
        assert_eq!(idx.vector(1), Some(&[9.0, 9.0][..]));
        let res = idx.search(&[0.0, 0.0], 2, 16);
        assert_eq!(res[0], (1, 162.0));
    }

    #[test]
    fn remove_keeps_graph_searchable() {
        let data = random_vectors(80, 8, 4);
        let mut idx = HnswIndex::new(IndexParams { m: 4, ef_construction: 32, ef_search: 32 }, Metric::Cosine);
        for (id, v) in &data {
            idx.insert(*id, v.clone());
        }
        for (id, _) in data.iter().step_by(2) {
            assert!(idx.remove(*id));
        }
        assert!(!idx.remove(data[0].0));
        assert_eq!(idx.len(), 40);

        let res = idx.search(&data[1].1, 5, 80);
        assert!(res.iter().all(|(id, _)| id % 2 == 0));
        assert_eq!(res[0].0, data[1].0);
    }

    #[test]
    fn ties_break_by_smaller_id() {
        let mut idx = HnswIndex::new(IndexParams::default(), Metric::Euclidean);
        for id in [7u128, 3, 5] {
            idx.insert(id, vec![1.0, 1.0]);
        }
        let ids: Vec<u128> = idx.search(&[1.0, 1.0], 3, 8).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![3, 5, 7]);

        let exact: Vec<u128> = idx.search_exact(&[1.0, 1.0], 2, [7, 5, 3]).into_iter().map(|(id, _)| id).collect();
        assert_eq!(exact, vec![3, 5]);
    }

    #[test]
    fn k_beyond_graph_size_returns_every_node() {
        let data = random_vectors(12, 4, 5);
        let mut idx = HnswIndex::new(IndexParams::default(), Metric::Cosine);
        for (id, v) in &data {
            idx.insert(*id, v.clone());
        }
        let q = &data[0].1;
        assert_eq!(idx.search(q, usize::MAX, usize::MAX).len(), 12);
        let exact = idx.search_exact(q, usize::MAX, data.iter().map(|(id, _)| *id));
        assert_eq!(exact.len(), 12);
        assert_eq!(exact[0].0, data[0].0);
    }

    #[test]
    fn empty_index_returns_nothing() {
        let idx = HnswIndex::new(IndexParams::default(), Metric::Cosine);
        assert!(idx.search(&[1.0], 3, 10).is_empty());
        assert_eq!(idx.layers(), 0);
    }
}

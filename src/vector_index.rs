//! Approximate nearest neighbours over a small set of vectors.
//!
//! A forest of random-projection trees under angular distance. Each split is
//! the hyperplane through the origin separating two far-apart pivots;
//! queries walk all trees best-first and re-rank the collected candidates
//! exactly. Pivot selection is deterministic, so the same items always
//! build the same forest.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashSet},
};

use crate::error::{Error, Result};

/// Trees built when the caller has no preference.
pub const DEFAULT_TREES: usize = 10;

/// Nodes with at most this many items become leaves.
const LEAF_SIZE: usize = 8;

/// Spreads the starting pivot of each tree across the items.
const PIVOT_STRIDE: usize = 7919;

enum Node {
    Leaf(Vec<usize>),
    Split {
        normal: Vec<f32>,
        left: usize,
        right: usize,
    },
    /// Fallback when no hyperplane separates the items, e.g. duplicates.
    Halves { left: usize, right: usize },
}

/// Heap entry ordered by priority, highest first.
struct Pending {
    priority: f32,
    node: usize,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.node.cmp(&self.node))
    }
}

/// An angular nearest-neighbour index.
///
/// # Examples
///
/// ```
/// use docfuse::vector_index::VectorIndex;
///
/// let mut index = VectorIndex::new(2);
/// index.add_item(0, &[1.0, 0.0]).unwrap();
/// index.add_item(1, &[0.0, 1.0]).unwrap();
/// index.build(10);
///
/// assert_eq!(index.query(&[0.9, 0.1], 1).unwrap(), vec![0]);
/// ```
pub struct VectorIndex {
    dimension: usize,
    ids: Vec<usize>,
    vectors: Vec<Vec<f32>>,
    nodes: Vec<Node>,
    roots: Vec<usize>,
}

impl VectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            ids: Vec::new(),
            vectors: Vec::new(),
            nodes: Vec::new(),
            roots: Vec::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Store `vector` under `id`. The vector is normalised to unit length.
    ///
    /// Adding items discards any built forest.
    pub fn add_item(&mut self, id: usize, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        self.ids.push(id);
        self.vectors.push(normalized(vector));
        self.nodes.clear();
        self.roots.clear();
        Ok(())
    }

    /// Build `n_trees` trees over the stored items.
    pub fn build(&mut self, n_trees: usize) {
        self.nodes.clear();
        self.roots.clear();
        if self.ids.is_empty() {
            return;
        }

        let all: Vec<usize> = (0..self.ids.len()).collect();
        for tree in 0..n_trees.max(1) {
            let root = self.build_node(all.clone(), tree, 0);
            self.roots.push(root);
        }
    }

    fn build_node(&mut self, items: Vec<usize>, tree: usize, depth: usize) -> usize {
        if items.len() <= LEAF_SIZE {
            return self.push(Node::Leaf(items));
        }

        if let Some((normal, left, right)) = self.hyperplane_split(&items, tree, depth) {
            let left = self.build_node(left, tree, depth + 1);
            let right = self.build_node(right, tree, depth + 1);
            return self.push(Node::Split {
                normal,
                left,
                right,
            });
        }

        let mut left = items;
        let right = left.split_off(left.len() / 2);
        let left = self.build_node(left, tree, depth + 1);
        let right = self.build_node(right, tree, depth + 1);
        self.push(Node::Halves { left, right })
    }

    /// Split `items` by the hyperplane between two far-apart pivots.
    ///
    /// Returns `None` when the pivots coincide or one side would be empty.
    fn hyperplane_split(
        &self,
        items: &[usize],
        tree: usize,
        depth: usize,
    ) -> Option<(Vec<f32>, Vec<usize>, Vec<usize>)> {
        let start = items[(tree * PIVOT_STRIDE + depth) % items.len()];
        let a = self.farthest_from(items, start);
        let b = self.farthest_from(items, a);

        let normal: Vec<f32> = self.vectors[a]
            .iter()
            .zip(&self.vectors[b])
            .map(|(x, y)| x - y)
            .collect();
        if normal.iter().all(|x| *x == 0.0) {
            return None;
        }

        let (left, right): (Vec<usize>, Vec<usize>) = items
            .iter()
            .partition(|&&i| dot(&normal, &self.vectors[i]) >= 0.0);
        if left.is_empty() || right.is_empty() {
            return None;
        }
        Some((normal, left, right))
    }

    fn farthest_from(&self, items: &[usize], from: usize) -> usize {
        let origin = &self.vectors[from];
        let mut best = from;
        let mut best_distance = f32::MIN;
        for &i in items {
            let d = angular_distance(origin, &self.vectors[i]);
            if d > best_distance {
                best = i;
                best_distance = d;
            }
        }
        best
    }

    fn push(&mut self, node: Node) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Ids of the (approximately) `k` nearest items, closest first.
    pub fn query(&self, vector: &[f32], k: usize) -> Result<Vec<usize>> {
        Ok(self
            .query_with_distances(vector, k)?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    /// Like [`query`](Self::query), paired with each item's angular
    /// distance `sqrt(2 - 2 cos)`.
    ///
    /// Before [`build`](Self::build) every item is scanned.
    pub fn query_with_distances(
        &self,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<(usize, f32)>> {
        if vector.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        if k == 0 || self.ids.is_empty() {
            return Ok(Vec::new());
        }

        let query = normalized(vector);
        let candidates = if self.roots.is_empty() {
            (0..self.ids.len()).collect()
        } else {
            self.collect_candidates(&query, k * self.roots.len())
        };

        let mut scored: Vec<(usize, f32)> = candidates
            .into_iter()
            .map(|i| (i, angular_distance(&query, &self.vectors[i])))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(i, distance)| (self.ids[i], distance))
            .collect())
    }

    /// Walk all trees best-first until `search_k` items are collected.
    fn collect_candidates(&self, query: &[f32], search_k: usize) -> Vec<usize> {
        let mut heap: BinaryHeap<Pending> = self
            .roots
            .iter()
            .map(|&node| Pending {
                priority: f32::INFINITY,
                node,
            })
            .collect();

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        while candidates.len() < search_k {
            let Some(Pending { priority, node }) = heap.pop() else {
                break;
            };
            match &self.nodes[node] {
                Node::Leaf(items) => {
                    for &i in items {
                        if seen.insert(i) {
                            candidates.push(i);
                        }
                    }
                }
                Node::Split {
                    normal,
                    left,
                    right,
                } => {
                    let margin = dot(normal, query);
                    heap.push(Pending {
                        priority: priority.min(margin),
                        node: *left,
                    });
                    heap.push(Pending {
                        priority: priority.min(-margin),
                        node: *right,
                    });
                }
                Node::Halves { left, right } => {
                    heap.push(Pending {
                        priority,
                        node: *left,
                    });
                    heap.push(Pending {
                        priority,
                        node: *right,
                    });
                }
            }
        }
        candidates
    }
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("dimension", &self.dimension)
            .field("items", &self.ids.len())
            .field("trees", &self.roots.len())
            .finish()
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn normalized(v: &[f32]) -> Vec<f32> {
    let norm = dot(v, v).sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

/// Angular distance between unit vectors.
fn angular_distance(a: &[f32], b: &[f32]) -> f32 {
    (2.0 - 2.0 * dot(a, b)).max(0.0).sqrt()
}

//! Single-link grouping of a batch of article embeddings.
//!
//! Articles are nodes; an edge joins every pair whose cosine similarity is at
//! least the group threshold, and every pair sharing a content hash. The
//! output groups are the connected components of that graph, which is
//! single-linkage agglomerative clustering cut at the threshold.
//!
//! The pairwise pass is O(N²) in the batch size. Members are processed in
//! article-id order and unions always keep the smaller index as root, so the
//! result depends only on the set of inputs, never on their order.

use crate::error::GroupError;
use crate::models::GroupMember;
use crate::vector::{dot, normalized};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, instrument};

/// One connected component of the similarity graph.
///
/// Groups built by [`group_articles`] keep `members` sorted by article id
/// and are never empty. The orchestrator also wraps pinned duplicates in a
/// group, so members need not be similar to one another.
#[derive(Debug, Clone, PartialEq)]
pub struct ArticleGroup {
    pub members: Vec<GroupMember>,
}

impl ArticleGroup {
    /// Member ids in member order.
    pub fn ids(&self) -> Vec<String> {
        self.members.iter().map(|m| m.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

/// Partition `members` into groups at cosine threshold `threshold`.
///
/// Every input appears in exactly one group. Groups come back ordered by
/// their smallest article id.
///
/// # Errors
/// [`GroupError::DimensionMismatch`] when the embeddings do not all share
/// the dimension of the smallest-id member.
#[instrument(level = "debug", skip_all, fields(n = members.len(), threshold = threshold))]
pub fn group_articles(
    members: Vec<GroupMember>,
    threshold: f32,
) -> Result<Vec<ArticleGroup>, GroupError> {
    if members.is_empty() {
        return Ok(Vec::new());
    }

    let mut members = members;
    members.sort_by(|a, b| a.id.cmp(&b.id));

    let dim = members[0].embedding.len();
    if let Some(bad) = members.iter().find(|m| m.embedding.len() != dim) {
        return Err(GroupError::DimensionMismatch {
            id: bad.id.clone(),
            expected: dim,
            found: bad.embedding.len(),
        });
    }

    let units: Vec<Vec<f32>> = members.iter().map(|m| normalized(&m.embedding)).collect();
    let n = members.len();
    let mut set = DisjointSet::new(n);

    let mut by_hash: HashMap<&str, usize> = HashMap::new();
    for (i, m) in members.iter().enumerate() {
        match by_hash.get(m.content_hash.as_str()) {
            Some(&first) => set.union(first, i),
            None => {
                by_hash.insert(m.content_hash.as_str(), i);
            }
        }
    }

    let mut edges = 0usize;
    for i in 0..n {
        for j in (i + 1)..n {
            if dot(&units[i], &units[j]) >= threshold {
                set.union(i, j);
                edges += 1;
            }
        }
    }

    let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..n {
        let root = set.find(i);
        components.entry(root).or_default().push(i);
    }
    debug!(edges, groups = components.len(), "Similarity graph built");

    // Roots are the smallest index of each component, and indices follow id
    // order, so BTreeMap order is smallest-id order.
    let mut slots: Vec<Option<GroupMember>> = members.into_iter().map(Some).collect();
    let groups = components
        .into_values()
        .map(|idx| ArticleGroup {
            members: idx.into_iter().filter_map(|i| slots[i].take()).collect(),
        })
        .collect();
    Ok(groups)
}

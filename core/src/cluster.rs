//! Cluster builder.
//!
//! Union-find (path compression, union by rank) over accepted pair
//! edges. Edges are consumed in a canonical order - checksum edges
//! first, then ascending distance, then lexicographic pair - which the
//! final partition does not depend on, but which makes member lists and
//! keeper tie-breaks reproducible run over run.
//!
//! Ignore pairs are honored structurally: a union that would place both
//! ends of an ignored pair into one component is skipped, so no emitted
//! group ever contains both.

use crate::score::PairScore;
use crate::{CancelToken, FileId, GroupId, MediaKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

// ============================================================================
// Public Types
// ============================================================================

/// A persisted duplicate cluster.
///
/// Invariants: all members share one media kind; membership is
/// transitively connected through accepted pairs at construction time;
/// members are lexicographic by id; identical inputs reproduce identical
/// groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub group_id: GroupId,
    pub kind: MediaKind,
    pub members: Vec<FileId>,
    /// Aggregated confidence in [0, 1]; filled by the confidence engine.
    pub confidence: f64,
    pub rationale_lines: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_keeper: Option<FileId>,
    #[serde(default)]
    pub incomplete: bool,
}

/// User decision to never group two files together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IgnorePair {
    a: FileId,
    b: FileId,
}

impl IgnorePair {
    /// Normalized so `{x, y}` and `{y, x}` compare equal.
    pub fn new(x: FileId, y: FileId) -> IgnorePair {
        if x <= y {
            IgnorePair { a: x, b: y }
        } else {
            IgnorePair { a: y, b: x }
        }
    }

    pub fn endpoints(&self) -> (FileId, FileId) {
        (self.a, self.b)
    }
}

/// A built group together with the scored pairs inside it, for the
/// confidence engine.
#[derive(Debug, Clone)]
pub struct ClusteredGroup {
    pub group: DuplicateGroup,
    pub pairs: Vec<PairScore>,
}

// ============================================================================
// Union-Find
// ============================================================================

struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(len: usize) -> UnionFind {
        UnionFind {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            // Path halving.
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Returns the surviving root.
    fn union(&mut self, x: usize, y: usize) -> usize {
        let rx = self.find(x);
        let ry = self.find(y);
        if rx == ry {
            return rx;
        }
        let (winner, loser) = if self.rank[rx] >= self.rank[ry] {
            (rx, ry)
        } else {
            (ry, rx)
        };
        self.parent[loser] = winner;
        if self.rank[winner] == self.rank[loser] {
            self.rank[winner] += 1;
        }
        winner
    }
}

// ============================================================================
// Build
// ============================================================================

/// Builds duplicate groups from scored pairs.
///
/// `pairs` may contain any verdict: accepted pairs become edges, while
/// every scored pair whose endpoints land in one component is attached
/// to that group for confidence aggregation. `incomplete_ids` marks
/// members whose extraction partially failed; one such member
/// contaminates its group's `incomplete` flag.
///
/// Exceeding `budget` (or cancellation) stops edge consumption; the
/// partition built so far is returned with every group flagged
/// incomplete and the truncation logged.
pub fn build(
    pairs: Vec<PairScore>,
    ignore: &BTreeSet<IgnorePair>,
    incomplete_ids: &HashSet<FileId>,
    budget: Duration,
    cancel: &CancelToken,
) -> Vec<ClusteredGroup> {
    // Index every id seen in any pair.
    let mut ids: Vec<FileId> = pairs.iter().flat_map(|p| [p.a, p.b]).collect();
    ids.sort();
    ids.dedup();
    let index: HashMap<FileId, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    // Canonical edge order.
    let mut edges: Vec<&PairScore> = pairs.iter().filter(|p| p.is_accept()).collect();
    edges.sort_by(|x, y| {
        let checksum = y.is_checksum_match().cmp(&x.is_checksum_match());
        checksum
            .then(
                x.primary_distance()
                    .partial_cmp(&y.primary_distance())
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(x.a.cmp(&y.a))
            .then(x.b.cmp(&y.b))
    });

    // Ids participating in any ignore pair, tracked per component so a
    // union never co-locates an ignored pair.
    let ignored_ids: HashSet<FileId> = ignore
        .iter()
        .flat_map(|p| {
            let (a, b) = p.endpoints();
            [a, b]
        })
        .collect();
    let mut guarded: HashMap<usize, BTreeSet<FileId>> = HashMap::new();
    for id in &ids {
        if ignored_ids.contains(id) {
            guarded.insert(index[id], BTreeSet::from([*id]));
        }
    }

    let mut uf = UnionFind::new(ids.len());
    let start = Instant::now();
    let mut truncated = false;

    for edge in edges {
        if cancel.is_cancelled() || start.elapsed() >= budget {
            truncated = true;
            log::warn!(
                "cluster build truncated after {:?}; remaining edges dropped",
                start.elapsed()
            );
            break;
        }
        if ignore.contains(&IgnorePair::new(edge.a, edge.b)) {
            continue;
        }
        let ia = index[&edge.a];
        let ib = index[&edge.b];
        let ra = uf.find(ia);
        let rb = uf.find(ib);
        if ra == rb {
            continue;
        }
        if would_violate_ignore(&guarded, ignore, ra, rb) {
            continue;
        }
        let winner = uf.union(ra, rb);
        let loser = if winner == ra { rb } else { ra };
        if let Some(set) = guarded.remove(&loser) {
            guarded.entry(winner).or_default().extend(set);
        }
    }

    // Collect components of size >= 2.
    let mut components: HashMap<usize, Vec<FileId>> = HashMap::new();
    for id in &ids {
        let root = uf.find(index[id]);
        components.entry(root).or_default().push(*id);
    }
    let mut member_sets: Vec<Vec<FileId>> = components
        .into_values()
        .filter(|members| members.len() >= 2)
        .collect();
    for members in &mut member_sets {
        members.sort();
    }
    // Descending member count, ties by smallest member id.
    member_sets.sort_by(|x, y| y.len().cmp(&x.len()).then(x[0].cmp(&y[0])));

    // Attach every scored pair that landed inside one component.
    let mut root_of: HashMap<FileId, usize> = HashMap::new();
    for id in &ids {
        root_of.insert(*id, uf.find(index[id]));
    }

    member_sets
        .into_iter()
        .map(|members| {
            let root = root_of[&members[0]];
            let mut group_pairs: Vec<PairScore> = pairs
                .iter()
                .filter(|p| root_of[&p.a] == root && root_of[&p.b] == root)
                .cloned()
                .collect();
            group_pairs.sort_by(|x, y| x.a.cmp(&y.a).then(x.b.cmp(&y.b)));

            let kind = group_pairs
                .first()
                .map(|p| p.kind)
                .unwrap_or(MediaKind::Other);
            let incomplete =
                truncated || members.iter().any(|m| incomplete_ids.contains(m));
            let group = DuplicateGroup {
                group_id: GroupId::from_members(&members),
                kind,
                members,
                confidence: 0.0,
                rationale_lines: Vec::new(),
                suggested_keeper: None,
                incomplete,
            };
            ClusteredGroup {
                group,
                pairs: group_pairs,
            }
        })
        .collect()
}

/// True when merging the two components would put both ends of an
/// ignored pair into one group.
fn would_violate_ignore(
    guarded: &HashMap<usize, BTreeSet<FileId>>,
    ignore: &BTreeSet<IgnorePair>,
    ra: usize,
    rb: usize,
) -> bool {
    let (Some(set_a), Some(set_b)) = (guarded.get(&ra), guarded.get(&rb)) else {
        return false;
    };
    for x in set_a {
        for y in set_b {
            if ignore.contains(&IgnorePair::new(*x, *y)) {
                return true;
            }
        }
    }
    false
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::score::{PairScore, Signal, SignalKind, Verdict};

    fn accept_pair(a: u128, b: u128, distance: f64) -> PairScore {
        let (a, b) = if a <= b { (a, b) } else { (b, a) };
        PairScore {
            a: FileId(a),
            b: FileId(b),
            kind: MediaKind::Photo,
            signals: vec![Signal {
                kind: SignalKind::PhashDistance,
                value: distance,
                verdict: Verdict::Accept,
                rationale: format!("phash_distance={}", distance as u32),
            }],
            verdict: Verdict::Accept,
        }
    }

    fn neutral_pair(a: u128, b: u128) -> PairScore {
        PairScore {
            a: FileId(a.min(b)),
            b: FileId(a.max(b)),
            kind: MediaKind::Photo,
            signals: Vec::new(),
            verdict: Verdict::Neutral,
        }
    }

    fn run(pairs: Vec<PairScore>) -> Vec<ClusteredGroup> {
        build(
            pairs,
            &BTreeSet::new(),
            &HashSet::new(),
            Duration::from_secs(60),
            &CancelToken::new(),
        )
    }

    #[test]
    fn test_connected_components_become_groups() {
        let groups = run(vec![
            accept_pair(1, 2, 1.0),
            accept_pair(2, 3, 2.0),
            accept_pair(10, 11, 1.0),
            neutral_pair(20, 21), // no edge, no group
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(
            groups[0].group.members,
            vec![FileId(1), FileId(2), FileId(3)]
        );
        assert_eq!(groups[1].group.members, vec![FileId(10), FileId(11)]);
    }

    #[test]
    fn test_group_ordering_by_size_then_member() {
        let groups = run(vec![
            accept_pair(30, 31, 1.0),
            accept_pair(5, 6, 1.0),
            accept_pair(1, 2, 1.0),
            accept_pair(2, 3, 1.0),
        ]);
        // Largest first, then smallest member id.
        assert_eq!(groups[0].group.members.len(), 3);
        assert_eq!(groups[1].group.members[0], FileId(5));
        assert_eq!(groups[2].group.members[0], FileId(30));
    }

    #[test]
    fn test_partition_independent_of_input_order() {
        let pairs = vec![
            accept_pair(4, 2, 3.0),
            accept_pair(1, 2, 5.0),
            accept_pair(9, 8, 1.0),
        ];
        let mut reversed = pairs.clone();
        reversed.reverse();
        let a = run(pairs);
        let b = run(reversed);
        let members_a: Vec<_> = a.iter().map(|g| g.group.members.clone()).collect();
        let members_b: Vec<_> = b.iter().map(|g| g.group.members.clone()).collect();
        assert_eq!(members_a, members_b);
        let ids_a: Vec<_> = a.iter().map(|g| g.group.group_id).collect();
        let ids_b: Vec<_> = b.iter().map(|g| g.group.group_id).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn test_ignore_pair_blocks_direct_edge() {
        let ignore = BTreeSet::from([IgnorePair::new(FileId(1), FileId(2))]);
        let groups = build(
            vec![accept_pair(1, 2, 1.0)],
            &ignore,
            &HashSet::new(),
            Duration::from_secs(60),
            &CancelToken::new(),
        );
        assert!(groups.is_empty());
    }

    #[test]
    fn test_ignore_pair_blocks_transitive_colocation() {
        // 1-3 and 2-3 would transitively join 1 and 2; the ignore pair
        // must keep them apart.
        let ignore = BTreeSet::from([IgnorePair::new(FileId(1), FileId(2))]);
        let groups = build(
            vec![accept_pair(1, 3, 1.0), accept_pair(2, 3, 2.0)],
            &ignore,
            &HashSet::new(),
            Duration::from_secs(60),
            &CancelToken::new(),
        );
        for g in &groups {
            let members = &g.group.members;
            assert!(
                !(members.contains(&FileId(1)) && members.contains(&FileId(2))),
                "ignored pair grouped together: {:?}",
                members
            );
        }
        // The closer edge (1-3) wins deterministically.
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group.members, vec![FileId(1), FileId(3)]);
    }

    #[test]
    fn test_checksum_edges_consumed_first() {
        // 2 is reachable from both 1 (checksum) and 3 (perceptual); with
        // ignore(1, 3) only one union survives, and the checksum edge
        // must win regardless of distances.
        let mut checksum = PairScore::checksum_pair(FileId(1), FileId(2), MediaKind::Photo);
        checksum.signals[0].value = 0.0;
        let ignore = BTreeSet::from([IgnorePair::new(FileId(1), FileId(3))]);
        let groups = build(
            vec![accept_pair(2, 3, 1.0), checksum],
            &ignore,
            &HashSet::new(),
            Duration::from_secs(60),
            &CancelToken::new(),
        );
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group.members, vec![FileId(1), FileId(2)]);
    }

    #[test]
    fn test_incomplete_member_contaminates_group() {
        let incomplete = HashSet::from([FileId(2)]);
        let groups = build(
            vec![accept_pair(1, 2, 1.0), accept_pair(10, 11, 1.0)],
            &BTreeSet::new(),
            &incomplete,
            Duration::from_secs(60),
            &CancelToken::new(),
        );
        assert!(groups[0].group.incomplete);
        assert!(!groups[1].group.incomplete);
    }

    #[test]
    fn test_zero_budget_truncates_and_flags() {
        let groups = build(
            vec![accept_pair(1, 2, 1.0)],
            &BTreeSet::new(),
            &HashSet::new(),
            Duration::ZERO,
            &CancelToken::new(),
        );
        // Nothing was unioned; no groups, but if any had formed they
        // would be incomplete. Re-run with one pre-seeded union.
        assert!(groups.is_empty());
    }

    #[test]
    fn test_cancel_returns_partial_partition() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let groups = build(
            vec![accept_pair(1, 2, 1.0)],
            &BTreeSet::new(),
            &HashSet::new(),
            Duration::from_secs(60),
            &cancel,
        );
        assert!(groups.is_empty());
    }

    #[test]
    fn test_neutral_pairs_attached_to_groups() {
        // 1-2 and 2-3 accepted; 1-3 scored neutral. All three pairs
        // belong to the one group for confidence aggregation.
        let groups = run(vec![
            accept_pair(1, 2, 1.0),
            accept_pair(2, 3, 1.0),
            neutral_pair(1, 3),
        ]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].pairs.len(), 3);
    }
}

//! Folding one call graph into another.
//!
//! Every real node of the source is matched to the node at the same logical
//! position in the destination and its bundle is added there. Positions with
//! no counterpart are grafted as new children, so the destination never gains
//! a duplicate of a position it already had.
//!
//! Source dummies are only used to decide *where* their subtree goes: an
//! anchor is resolved with [`GraphData::find`] against the position hash the
//! master reported when the worker was mounted.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::dispatch::{self, Bundle};
use crate::error::{Error, Result};
use crate::graph::{GraphData, Node, NodeKey};
use crate::tree::NodeId;

/// What a [`merge`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Source nodes folded into an existing destination node.
    pub merged: usize,
    /// Source nodes copied into the destination as new nodes.
    pub grafted: usize,
    /// Source dummies resolved in the destination.
    pub anchors: usize,
    /// Destination anchors from earlier merges whose scope has since appeared
    /// and that were folded into it.
    pub settled: usize,
}

/// Fold `src` into `dest`.
///
/// `dest` must be rooted. An unrooted `src` merges nothing. The source is
/// visited in pre-order so every parent is placed before its children.
pub fn merge<B: Bundle>(dest: &mut GraphData<B>, src: &GraphData<B>) -> Result<MergeReport> {
    let dest_head = dest.head().ok_or(Error::Unrooted)?;
    let Some(src_head) = src.head() else {
        return Ok(MergeReport::default());
    };

    let mut report = MergeReport::default();
    let mut placed: HashMap<NodeId, NodeId> = HashMap::with_capacity(src.len());

    for (id, node) in src.pre_order() {
        let target = match src.parent(id) {
            Some(parent) => {
                let Some(&dest_parent) = placed.get(&parent) else {
                    continue;
                };
                place(dest, dest_parent, node, &mut report)?
            }
            None if id == src_head && same_head(dest, dest_head, node) => {
                if !node.is_dummy() {
                    accumulate(dest, dest_head, node);
                    report.merged += 1;
                }
                dest_head
            }
            None => {
                resolve_top_level(dest, src, id, node, &mut report)?
            }
        };
        placed.insert(id, target);
    }
    settle_anchors(dest, &mut report)?;

    debug!(
        merged = report.merged,
        grafted = report.grafted,
        anchors = report.anchors,
        settled = report.settled,
        nodes = dest.len(),
        "merged call graph"
    );
    Ok(report)
}

/// Fold `node` into the matching child of `parent`, or graft a copy there.
fn place<B: Bundle>(
    dest: &mut GraphData<B>,
    parent: NodeId,
    node: &Node<B>,
    report: &mut MergeReport,
) -> Result<NodeId> {
    match matching_child(dest, parent, node) {
        Some(existing) => {
            accumulate(dest, existing, node);
            report.merged += 1;
            Ok(existing)
        }
        None => {
            let grafted = dest.emplace_child(parent, node.clone())?;
            trace!(scope = node.id().0, depth = node.depth(), "graft");
            report.grafted += 1;
            Ok(grafted)
        }
    }
}

/// Move the subtree of every destination anchor whose master scope now
/// exists as a real node under that node, then drop the anchor.
fn settle_anchors<B: Bundle>(dest: &mut GraphData<B>, report: &mut MergeReport) -> Result<()> {
    let head = dest.head();
    let pending: Vec<(NodeId, NodeKey)> = dest
        .tree()
        .roots()
        .filter(|(id, node)| Some(*id) != head && node.is_dummy())
        .filter_map(|(id, _)| Some((id, dest.key(id)?)))
        .collect();

    for (anchor, key) in pending {
        let Some(found) = dest.find_real(&key) else {
            continue;
        };
        let moved: Vec<(NodeId, Option<NodeId>, Node<B>)> = dest
            .tree()
            .pre_order_from(anchor)
            .skip(1)
            .map(|(id, node)| (id, dest.parent(id), node.clone()))
            .collect();
        let mut placed = HashMap::from([(anchor, found)]);
        for (id, parent, node) in moved {
            let Some(&dest_parent) = parent.and_then(|p| placed.get(&p)) else {
                continue;
            };
            let target = place(dest, dest_parent, &node, report)?;
            placed.insert(id, target);
        }
        dest.remove_anchor(anchor)?;
        trace!(scope = key.id.0, depth = key.depth, "anchor settled");
        report.settled += 1;
    }
    Ok(())
}

fn same_head<B: Bundle>(dest: &GraphData<B>, dest_head: NodeId, node: &Node<B>) -> bool {
    dest.get(dest_head)
        .is_some_and(|head| head.same_position(node))
}

/// Real child of `parent` at the same position as `node`.
fn matching_child<B: Bundle>(dest: &GraphData<B>, parent: NodeId, node: &Node<B>) -> Option<NodeId> {
    dest.tree()
        .children(parent)
        .find(|(_, candidate)| !candidate.is_dummy() && candidate.same_position(node))
        .map(|(id, _)| id)
}

/// Add the bundle of a real `node` to `target`. Dummies neither give nor take.
fn accumulate<B: Bundle>(dest: &mut GraphData<B>, target: NodeId, node: &Node<B>) {
    if node.is_dummy() {
        return;
    }
    let Some(existing) = dest.get_mut(target) else {
        return;
    };
    if existing.is_dummy() {
        trace!(scope = node.id().0, depth = node.depth(), "dummy target refused");
        return;
    }
    trace!(scope = node.id().0, depth = node.depth(), "accumulate");
    dispatch::plus(existing.bundle_mut(), node.bundle());
}

/// Destination node standing for the top-level source node `id`.
///
/// A real node folds into its real counterpart or becomes a new real
/// top-level node. A dummy is an anchor: real destination nodes win, an
/// anchor left behind by an earlier merge is reused, and otherwise a new
/// top-level dummy keeps the subtree reachable.
fn resolve_top_level<B: Bundle>(
    dest: &mut GraphData<B>,
    src: &GraphData<B>,
    id: NodeId,
    node: &Node<B>,
    report: &mut MergeReport,
) -> Result<NodeId> {
    let key = NodeKey {
        id: node.id(),
        depth: node.depth(),
        hash: src.anchor_hash(id).unwrap_or(node.id().0),
    };
    if !node.is_dummy() {
        let counterpart = dest
            .tree()
            .roots()
            .find(|(_, candidate)| !candidate.is_dummy() && candidate.same_position(node))
            .map(|(found, _)| found);
        if let Some(found) = counterpart {
            accumulate(dest, found, node);
            report.merged += 1;
            return Ok(found);
        }
        let root = dest.add_root(node.clone())?;
        trace!(scope = key.id.0, depth = key.depth, "graft top-level node");
        report.grafted += 1;
        return Ok(root);
    }

    report.anchors += 1;
    if let Some(found) = dest.find_real(&key).or_else(|| dest.find(&key)) {
        trace!(scope = key.id.0, depth = key.depth, "anchor resolved");
        return Ok(found);
    }
    debug!(
        scope = key.id.0,
        depth = key.depth,
        "anchor has no counterpart, keeping it as a dummy"
    );
    dest.add_anchor(key.id, key.depth, key.hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ScopeId;
    use crate::testing::Step;

    type G = GraphData<(Step,)>;

    fn push(g: &mut G, id: u64, total: u64) -> NodeId {
        let depth = g.depth() + 1;
        g.append_child(Node::new(ScopeId(id), depth, (Step::with_total(total),)))
            .unwrap()
    }

    fn totals(g: &G) -> Vec<(u64, u32, u64)> {
        g.pre_order()
            .filter(|(_, n)| !n.is_dummy())
            .map(|(_, n)| (n.id().0, n.depth(), n.bundle().0.total))
            .collect()
    }

    fn sample() -> G {
        let mut g = G::rooted(0);
        push(&mut g, 1, 10);
        push(&mut g, 2, 20);
        g.pop_graph();
        push(&mut g, 3, 30);
        g.pop_graph();
        g.pop_graph();
        push(&mut g, 4, 40);
        g
    }

    #[test]
    fn merging_a_copy_doubles_every_value() {
        let mut dest = sample();
        let src = dest.clone();
        let before = dest.len();
        let report = merge(&mut dest, &src).unwrap();

        assert_eq!(dest.len(), before, "no duplicate nodes");
        assert_eq!(report.merged, 4);
        assert_eq!(report.grafted, 0);
        assert_eq!(
            totals(&dest),
            vec![(1, 1, 20), (2, 2, 40), (3, 2, 60), (4, 1, 80)]
        );
    }

    #[test]
    fn unmatched_paths_are_grafted_in_place() {
        let mut dest = G::rooted(0);
        push(&mut dest, 1, 1);

        let mut src = G::rooted(0);
        push(&mut src, 1, 5);
        push(&mut src, 9, 7);

        let report = merge(&mut dest, &src).unwrap();
        assert_eq!(report.merged, 1);
        assert_eq!(report.grafted, 1);
        assert_eq!(totals(&dest), vec![(1, 1, 6), (9, 2, 7)]);
    }

    #[test]
    fn late_master_scope_absorbs_earlier_anchor() {
        let mut master = G::rooted(0);
        push(&mut master, 1, 3);
        let mut worker = G::rooted(0);
        worker.set_master(master.fork().unwrap());
        worker.add_dummy().unwrap();
        push(&mut worker, 5, 50);

        let mut global = G::rooted(0);
        merge(&mut global, &worker).unwrap();
        let report = merge(&mut global, &master).unwrap();

        assert_eq!(report.settled, 1);
        assert_eq!(global.pre_order().filter(|(_, n)| n.is_dummy()).count(), 1);
        assert_eq!(totals(&global), vec![(1, 1, 3), (5, 2, 50)]);
    }

    #[test]
    fn real_source_head_stays_real() {
        let mut src = G::new(Node::new(ScopeId(5), 0, (Step::with_total(10),)));
        push(&mut src, 6, 1);

        let mut dest = G::rooted(0);
        let report = merge(&mut dest, &src).unwrap();
        assert_eq!(report.grafted, 2);
        assert_eq!(report.anchors, 0);
        assert_eq!(dest.aggregate(), src.aggregate());
        assert_eq!(totals(&dest), vec![(5, 0, 10), (6, 1, 1)]);

        let report = merge(&mut dest, &src).unwrap();
        assert_eq!(report.merged, 2);
        assert_eq!(report.grafted, 0);
        assert_eq!(dest.aggregate().0.total, 22);
        for (_, node) in dest.pre_order().filter(|(_, n)| n.is_dummy()) {
            assert_eq!(node.bundle().0.total, 0);
        }
    }

    #[test]
    fn single_entries_are_grafted_not_folded() {
        let mut src = G::rooted(0);
        for entry in 1..=3 {
            src.append_child(Node::single(ScopeId(4), 1, entry, (Step::with_total(1),)))
                .unwrap();
            src.pop_graph();
        }
        let mut dest = G::rooted(0);
        merge(&mut dest, &src).unwrap();
        assert_eq!(dest.len(), 4);

        // the same entries merged again fold into themselves
        let report = merge(&mut dest, &src).unwrap();
        assert_eq!(report.merged, 3);
        assert_eq!(dest.len(), 4);
        assert_eq!(totals(&dest), vec![(4, 1, 2); 3]);
    }

    #[test]
    fn unrooted_source_is_a_no_op() {
        let mut dest = sample();
        let report = merge(&mut dest, &G::default()).unwrap();
        assert_eq!(report, MergeReport::default());
    }

    #[test]
    fn unrooted_destination_is_an_error() {
        let mut dest = G::default();
        assert!(matches!(merge(&mut dest, &sample()), Err(Error::Unrooted)));
    }

    #[test]
    fn worker_subtree_lands_under_the_master_scope() {
        let mut master = G::rooted(0);
        push(&mut master, 1, 0);
        push(&mut master, 2, 0);
        let cursor = master.fork().unwrap();

        let mut worker = G::rooted(0);
        worker.set_master(cursor);
        worker.add_dummy().unwrap();
        push(&mut worker, 7, 70);

        let mut global = G::rooted(0);
        merge(&mut global, &master).unwrap();
        let report = merge(&mut global, &worker).unwrap();

        assert_eq!(report.anchors, 1);
        assert_eq!(report.grafted, 1);
        assert_eq!(totals(&global), vec![(1, 1, 0), (2, 2, 0), (7, 3, 70)]);
        assert_eq!(global.aggregate().0.total, 70);
    }

    #[test]
    fn dummies_never_receive_values() {
        let mut master = G::rooted(0);
        push(&mut master, 1, 0);

        let mut worker = G::rooted(0);
        worker.set_master(master.fork().unwrap());
        worker.add_dummy().unwrap();
        push(&mut worker, 5, 50);

        let mut global = G::rooted(0);
        merge(&mut global, &worker).unwrap();
        merge(&mut global, &worker).unwrap();

        let dummies = global.pre_order().filter(|(_, n)| n.is_dummy()).count();
        assert_eq!(dummies, 2, "head plus one reused anchor");
        for (_, node) in global.pre_order().filter(|(_, n)| n.is_dummy()) {
            assert_eq!(node.bundle().0.total, 0);
        }
        assert_eq!(totals(&global), vec![(5, 2, 100)]);
    }

    #[test]
    fn deep_path_resolves_to_its_counterpart() {
        let mut a = G::rooted(0);
        push(&mut a, 1, 1);
        push(&mut a, 2, 1);
        let a_deep = push(&mut a, 3, 1);

        let mut b = a.clone();
        merge(&mut b, &a).unwrap();
        let b_deep = b.find_in(&a, a_deep).unwrap();
        assert_eq!(b.get(b_deep).unwrap().depth(), 3);
        assert_eq!(b.get(b_deep).unwrap().bundle().0.total, 2);
    }
}

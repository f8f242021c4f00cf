//! Per-thread call graph: a tree of measurement bundles plus the cursor that
//! tracks which instrumented scope is currently open.
//!
//! `GraphData` owns a [`Tree`] whose nodes carry a [`ScopeId`], a call depth
//! and a bundle. Entering a scope appends a child under the cursor and moves
//! the cursor down; leaving it moves the cursor back to the parent. The cursor
//! never moves above the head, so unbalanced exits are harmless.
//!
//! Graphs mounted under another thread's open scope start from a *dummy*
//! node that mirrors the master's scope and depth. Dummies carry an empty
//! bundle, are left out of [`GraphData::aggregate`], and serve as anchors
//! when a worker's graph is merged back (see [`crate::merge`]).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::ser::{Serialize, SerializeStruct, Serializer};

use crate::dispatch::{self, Bundle};
use crate::error::{Error, Result};
use crate::tree::{NodeId, PreOrder, Tree};

/// Identity of one instrumented location.
///
/// Derived from a label with a fixed-seed hash, so the same label yields the
/// same id in every thread and every process of a distributed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct ScopeId(pub u64);

impl ScopeId {
    /// Id of the synthetic head every storage-created graph starts from.
    pub const ROOT: ScopeId = ScopeId(0);

    /// FNV-1a over the label bytes. Never returns [`ScopeId::ROOT`].
    pub fn from_label(label: &str) -> Self {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;
        let mut h = OFFSET;
        for &byte in label.as_bytes() {
            h ^= u64::from(byte);
            h = h.wrapping_mul(PRIME);
        }
        if h == 0 { ScopeId(1) } else { ScopeId(h) }
    }
}

/// One position in the call graph.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Node<B> {
    id: ScopeId,
    depth: u32,
    dummy: bool,
    /// Non-zero for a node that stands for one single entry and is never
    /// folded into another entry of the same scope.
    #[serde(skip_serializing_if = "is_shared")]
    entry: u64,
    bundle: B,
}

fn is_shared(entry: &u64) -> bool {
    *entry == 0
}

impl<B: Bundle> Node<B> {
    pub fn new(id: ScopeId, depth: u32, bundle: B) -> Self {
        Self {
            id,
            depth,
            dummy: false,
            entry: 0,
            bundle,
        }
    }

    /// Real node for the single entry `entry`. Entries with different stamps
    /// never share a position, even for the same scope and depth.
    pub fn single(id: ScopeId, depth: u32, entry: u64, bundle: B) -> Self {
        Self {
            entry,
            ..Self::new(id, depth, bundle)
        }
    }

    /// Placeholder carrying a scope identity but no measurements.
    pub fn dummy(id: ScopeId, depth: u32) -> Self {
        Self {
            id,
            depth,
            dummy: true,
            entry: 0,
            bundle: B::default(),
        }
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn is_dummy(&self) -> bool {
        self.dummy
    }

    /// Entry stamp, `0` for a position shared by every entry of its scope.
    pub fn entry(&self) -> u64 {
        self.entry
    }

    pub fn bundle(&self) -> &B {
        &self.bundle
    }

    pub fn bundle_mut(&mut self) -> &mut B {
        &mut self.bundle
    }

    /// Same scope at the same depth and, for single entries, the same stamp.
    /// Bundles are not compared.
    pub fn same_position(&self, other: &Node<B>) -> bool {
        self.id == other.id && self.depth == other.depth && self.entry == other.entry
    }
}

/// What [`GraphData::find`] matches on: identity, depth and rolling hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeKey {
    pub id: ScopeId,
    pub depth: u32,
    pub hash: u64,
}

/// Snapshot of a graph's open scope, handed to worker threads so they can
/// mount their own graph below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterCursor {
    owner: u64,
    pub id: ScopeId,
    pub depth: u32,
    /// Position hash of the open scope, as seen from the top of the master.
    pub hash: u64,
}

static NEXT_GRAPH: AtomicU64 = AtomicU64::new(1);

fn next_token() -> u64 {
    NEXT_GRAPH.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug)]
pub struct GraphData<B: Bundle> {
    token: u64,
    tree: Tree<Node<B>>,
    head: Option<NodeId>,
    current: Option<NodeId>,
    depth: u32,
    sea_level: u32,
    /// Depth → anchor nodes, in insertion order within a depth.
    dummies: BTreeMap<u32, Vec<NodeId>>,
    /// Dummy → position hash of the master scope it mirrors.
    anchors: Vec<(NodeId, u64)>,
    master: Option<MasterCursor>,
}

impl<B: Bundle> Default for GraphData<B> {
    fn default() -> Self {
        Self {
            token: next_token(),
            tree: Tree::new(),
            head: None,
            current: None,
            depth: 0,
            sea_level: 0,
            dummies: BTreeMap::new(),
            anchors: Vec::new(),
            master: None,
        }
    }
}

impl<B: Bundle> Clone for GraphData<B> {
    fn clone(&self) -> Self {
        Self {
            token: next_token(),
            tree: self.tree.clone(),
            head: self.head,
            current: self.current,
            depth: self.depth,
            sea_level: self.sea_level,
            dummies: self.dummies.clone(),
            anchors: self.anchors.clone(),
            master: self.master,
        }
    }
}

impl<B: Bundle> GraphData<B> {
    /// Graph rooted at `root`. The root's depth becomes the starting depth and
    /// sea level, and the root is registered as an anchor.
    pub fn new(root: Node<B>) -> Self {
        let mut data = Self::default();
        data.mount(root);
        data
    }

    /// Graph rooted at a synthetic [`ScopeId::ROOT`] dummy at `depth`.
    pub fn rooted(depth: u32) -> Self {
        Self::new(Node::dummy(ScopeId::ROOT, depth))
    }

    /// Root an unrooted graph. Fails if it already has a head.
    pub fn set_head(&mut self, root: Node<B>) -> Result<NodeId> {
        if self.head.is_some() {
            return Err(Error::HeadAlreadySet);
        }
        Ok(self.mount(root))
    }

    fn mount(&mut self, root: Node<B>) -> NodeId {
        let depth = root.depth;
        self.tree.clear();
        let head = match self.tree.set_head(root) {
            Ok(id) => id,
            Err(_) => unreachable!("cleared tree has no head"),
        };
        self.head = Some(head);
        self.current = Some(head);
        self.depth = depth;
        self.sea_level = depth;
        self.dummies.clear();
        self.dummies.entry(depth).or_default().push(head);
        self.anchors.clear();
        head
    }

    pub fn has_head(&self) -> bool {
        self.head.is_some()
    }

    pub fn head(&self) -> Option<NodeId> {
        self.head
    }

    pub fn current(&self) -> Option<NodeId> {
        self.current
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn sea_level(&self) -> u32 {
        self.sea_level
    }

    pub fn at_sea_level(&self) -> bool {
        self.depth == self.sea_level
    }

    pub fn tree(&self) -> &Tree<Node<B>> {
        &self.tree
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&Node<B>> {
        self.tree.get(id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node<B>> {
        self.tree.get_mut(id)
    }

    pub fn current_node(&self) -> Option<&Node<B>> {
        self.tree.get(self.current?)
    }

    pub fn current_node_mut(&mut self) -> Option<&mut Node<B>> {
        self.tree.get_mut(self.current?)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.tree.parent(id)
    }

    /// Every node, parents before children.
    pub fn pre_order(&self) -> PreOrder<'_, Node<B>> {
        self.tree.pre_order()
    }

    /// Full teardown: back to the unrooted state.
    pub fn clear(&mut self) {
        self.tree.clear();
        self.head = None;
        self.current = None;
        self.depth = 0;
        self.sea_level = 0;
        self.dummies.clear();
        self.anchors.clear();
    }

    /// Drop every node except the head and move the cursor back to it.
    pub fn reset(&mut self) {
        let Some(head) = self.head else { return };
        let erased = self.tree.erase_children(head);
        debug_assert!(erased.is_ok(), "head {head:?} missing from its own tree");
        while let Some(extra) = self.tree.next_sibling(head) {
            let erased = self.tree.erase(extra);
            debug_assert!(erased.is_ok(), "top-level node {extra:?} not erasable");
            if erased.is_err() {
                break;
            }
        }
        let depth = self.tree.get(head).map_or(0, |n| n.depth);
        self.current = Some(head);
        self.depth = depth;
        self.sea_level = depth;
        self.dummies.clear();
        self.dummies.entry(depth).or_default().push(head);
        self.anchors.clear();
    }

    /// Zero every bundle, keeping the structure and the cursor.
    pub fn clear_values(&mut self) {
        let ids: Vec<NodeId> = self.tree.pre_order().map(|(id, _)| id).collect();
        for id in ids {
            if let Some(node) = self.tree.get_mut(id) {
                node.bundle = B::default();
            }
        }
    }

    /// Move the cursor back to the head and forget the master, keeping every
    /// node. Ends an adoption started with [`GraphData::add_dummy`].
    pub fn rewind(&mut self) {
        let Some(head) = self.head else { return };
        let depth = self.tree.get(head).map_or(0, |n| n.depth);
        self.current = Some(head);
        self.depth = depth;
        self.sea_level = depth;
        self.master = None;
    }

    /// Move the cursor onto any live node and forget the master. Own scopes
    /// are measured from the head, so sea level goes back to the head's depth.
    pub fn seek(&mut self, id: NodeId) -> Result<NodeId> {
        let head = self.head.ok_or(Error::Unrooted)?;
        let depth = self.tree.get(id).ok_or(Error::InvalidNode(id))?.depth;
        self.current = Some(id);
        self.depth = depth;
        self.sea_level = self.tree.get(head).map_or(0, |n| n.depth);
        self.master = None;
        Ok(id)
    }

    /// Snapshot of the open scope, for [`GraphData::set_master`] on another graph.
    pub fn fork(&self) -> Option<MasterCursor> {
        let current = self.current?;
        let node = self.tree.get(current)?;
        Some(MasterCursor {
            owner: self.token,
            id: node.id,
            depth: node.depth,
            hash: self.position_hash(current),
        })
    }

    /// Use `cursor` as the master for [`GraphData::add_dummy`]. A graph's own
    /// cursor is ignored.
    pub fn set_master(&mut self, cursor: MasterCursor) {
        if cursor.owner != self.token {
            self.master = Some(cursor);
        }
    }

    pub fn master(&self) -> Option<MasterCursor> {
        self.master
    }

    /// Mount a dummy mirroring the master's open scope and move the cursor onto
    /// it. Returns `Ok(None)` when no master is set.
    pub fn add_dummy(&mut self) -> Result<Option<NodeId>> {
        let Some(master) = self.master else {
            return Ok(None);
        };
        let dummy = self.add_anchor(master.id, master.depth, master.hash)?;
        self.depth = master.depth;
        self.sea_level = master.depth;
        self.current = Some(dummy);
        Ok(Some(dummy))
    }

    /// Append a top-level dummy standing for the scope at `hash` without
    /// moving the cursor.
    pub(crate) fn add_anchor(&mut self, id: ScopeId, depth: u32, hash: u64) -> Result<NodeId> {
        let head = self.head.ok_or(Error::Unrooted)?;
        let last = self.tree.roots().last().map_or(head, |(id, _)| id);
        let dummy = self.tree.insert_after(last, Node::dummy(id, depth))?;
        self.dummies.entry(depth).or_default().push(dummy);
        self.anchors.push((dummy, hash));
        Ok(dummy)
    }

    /// Append a real top-level node after the last one, without moving the
    /// cursor. Used for source heads that have no counterpart here.
    pub(crate) fn add_root(&mut self, node: Node<B>) -> Result<NodeId> {
        let head = self.head.ok_or(Error::Unrooted)?;
        let last = self.tree.roots().last().map_or(head, |(id, _)| id);
        self.tree.insert_after(last, node)
    }

    /// Erase a top-level dummy and its subtree, forgetting it as an anchor.
    pub(crate) fn remove_anchor(&mut self, id: NodeId) -> Result<usize> {
        if self.head == Some(id) || !self.is_dummy(id) || self.tree.parent(id).is_some() {
            return Err(Error::InvalidNode(id));
        }
        let removed = self.tree.erase(id)?;
        for ids in self.dummies.values_mut() {
            ids.retain(|d| *d != id);
        }
        self.dummies.retain(|_, ids| !ids.is_empty());
        self.anchors.retain(|(d, _)| *d != id);
        if self.current.is_some_and(|c| !self.tree.contains(c)) {
            self.rewind();
        }
        Ok(removed)
    }

    /// Position hash of the master scope a dummy mirrors.
    pub fn anchor_hash(&self, id: NodeId) -> Option<u64> {
        self.anchors.iter().find(|(a, _)| *a == id).map(|(_, h)| *h)
    }

    /// Append `node` under the cursor and move the cursor onto it.
    ///
    /// `node.depth()` must be exactly one below the cursor.
    pub fn append_child(&mut self, node: Node<B>) -> Result<NodeId> {
        let current = self.current.ok_or(Error::Unrooted)?;
        let expected = self.depth + 1;
        if node.depth != expected {
            return Err(Error::DepthMismatch {
                expected,
                found: node.depth,
            });
        }
        let child = self.tree.append_child(current, node)?;
        self.depth = expected;
        self.current = Some(child);
        Ok(child)
    }

    /// Append `node` directly under the head without moving the cursor.
    pub fn append_head(&mut self, node: Node<B>) -> Result<NodeId> {
        let head = self.head.ok_or(Error::Unrooted)?;
        self.emplace_child(head, node)
    }

    /// Append `node` under `parent` without moving the cursor.
    pub fn emplace_child(&mut self, parent: NodeId, node: Node<B>) -> Result<NodeId> {
        let parent_depth = self.tree.get(parent).ok_or(Error::InvalidNode(parent))?.depth;
        if node.depth != parent_depth + 1 {
            return Err(Error::DepthMismatch {
                expected: parent_depth + 1,
                found: node.depth,
            });
        }
        self.tree.append_child(parent, node)
    }

    /// Move the cursor to `id`, adopting its depth. Used to re-enter an
    /// existing child instead of appending a duplicate.
    pub fn descend(&mut self, id: NodeId) -> Result<NodeId> {
        let current = self.current.ok_or(Error::Unrooted)?;
        if self.tree.parent(id) != Some(current) {
            return Err(Error::InvalidNode(id));
        }
        let depth = self.tree.get(id).ok_or(Error::InvalidNode(id))?.depth;
        self.depth = depth;
        self.current = Some(id);
        Ok(id)
    }

    /// Move the cursor to the parent of the open scope.
    ///
    /// At depth 0 the cursor is pinned to the head; a top-level node (the
    /// head, or a dummy mounted below a master) is also a fixed point. Never
    /// fails, so unbalanced exits only skew attribution.
    pub fn pop_graph(&mut self) -> Option<NodeId> {
        if self.depth == 0 {
            self.current = self.head;
            return self.current;
        }
        if let Some(parent) = self.current.and_then(|c| self.tree.parent(c)) {
            self.depth -= 1;
            self.current = Some(parent);
        }
        self.current
    }

    pub fn is_dummy(&self, id: NodeId) -> bool {
        self.tree.get(id).is_some_and(|n| n.dummy)
    }

    /// Sum of scope ids from the top level down to `id`, inclusive.
    ///
    /// A cheap fingerprint of the call path: identical paths always agree, but
    /// paths made of different ids with equal sums collide.
    pub fn rolling_hash(&self, id: NodeId) -> u64 {
        let mut hash = 0u64;
        let mut cursor = Some(id);
        while let Some(c) = cursor {
            let Some(node) = self.tree.get(c) else { break };
            hash = hash.wrapping_add(node.id.0);
            cursor = self.tree.parent(c);
        }
        hash
    }

    /// Rolling hash as seen from the top of the master graph.
    ///
    /// Below a dummy the path continues in the master, so the dummy's own id
    /// is swapped for the master's position hash. Elsewhere this is
    /// [`GraphData::rolling_hash`].
    pub fn position_hash(&self, id: NodeId) -> u64 {
        let raw = self.rolling_hash(id);
        let mut top = id;
        while let Some(p) = self.tree.parent(top) {
            top = p;
        }
        match (self.anchor_hash(top), self.tree.get(top)) {
            (Some(hash), Some(node)) => raw.wrapping_sub(node.id.0).wrapping_add(hash),
            _ => raw,
        }
    }

    pub fn key(&self, id: NodeId) -> Option<NodeKey> {
        let node = self.tree.get(id)?;
        Some(NodeKey {
            id: node.id,
            depth: node.depth,
            hash: self.position_hash(id),
        })
    }

    /// First node, in pre-order, matching `key`'s scope, depth and position hash.
    ///
    /// Each visited node is tested before its children.
    pub fn find(&self, key: &NodeKey) -> Option<NodeId> {
        self.find_where(key, |_| true)
    }

    /// Like [`GraphData::find`], skipping dummies.
    pub fn find_real(&self, key: &NodeKey) -> Option<NodeId> {
        self.find_where(key, |n| !n.dummy)
    }

    /// Locate the node of `source` that sits at the same position in this graph.
    pub fn find_in(&self, source: &GraphData<B>, id: NodeId) -> Option<NodeId> {
        self.find(&source.key(id)?)
    }

    fn find_where(&self, key: &NodeKey, accept: impl Fn(&Node<B>) -> bool) -> Option<NodeId> {
        let matches = |id: NodeId, node: &Node<B>| {
            node.id == key.id
                && node.depth == key.depth
                && accept(node)
                && self.position_hash(id) == key.hash
        };
        for (id, node) in self.tree.pre_order() {
            if matches(id, node) {
                return Some(id);
            }
            for (child, cnode) in self.tree.children(id) {
                if matches(child, cnode) {
                    return Some(child);
                }
            }
        }
        None
    }

    /// Anchors (the head and every dummy) as `(depth, node)`, deepest first.
    pub fn inverse_insert(&self) -> Vec<(u32, NodeId)> {
        let mut ret: Vec<(u32, NodeId)> = self
            .dummies
            .iter()
            .flat_map(|(depth, ids)| ids.iter().map(move |id| (*depth, *id)))
            .collect();
        ret.reverse();
        ret
    }

    /// Sum of every real node's bundle. Dummies contribute nothing.
    pub fn aggregate(&self) -> B {
        let mut total = B::default();
        for (_, node) in self.tree.pre_order() {
            if !node.dummy {
                dispatch::plus(&mut total, &node.bundle);
            }
        }
        total
    }
}

impl<B: Bundle> Serialize for GraphData<B> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut st = serializer.serialize_struct("GraphData", 2)?;
        st.serialize_field("sea_level", &self.sea_level)?;
        st.serialize_field("graph", &self.tree)?;
        st.end()
    }
}

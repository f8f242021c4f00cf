//! Ordered, multi-child tree stored in an arena.
//!
//! Nodes live in a `Vec` of slots and are addressed by [`NodeId`], an index
//! plus a generation counter. Parent, child and sibling links are ids, never
//! references, so erasing a subtree cannot leave dangling pointers: a stale id
//! simply fails the generation check. Freed slots are reused through a free
//! list.
//!
//! The top level is a sibling chain starting at the head. Most trees have a
//! single top-level node; [`Tree::insert_after`] on the head adds more.

use std::fmt;

use serde::ser::{Serialize, SerializeSeq, SerializeStruct, Serializer};

use crate::error::{Error, Result};

/// Stable handle to a node in a [`Tree`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}:{})", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Links {
    parent: Option<NodeId>,
    first_child: Option<NodeId>,
    last_child: Option<NodeId>,
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

#[derive(Debug, Clone)]
enum Slot<T> {
    Occupied {
        value: T,
        links: Links,
        generation: u32,
    },
    Vacant {
        next_free: Option<u32>,
        generation: u32,
    },
}

#[derive(Debug, Clone)]
pub struct Tree<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
    head: Option<NodeId>,
}

impl<T> Default for Tree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Tree<T> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
            head: None,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free_head: None,
            len: 0,
            head: None,
        }
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn head(&self) -> Option<NodeId> {
        self.head
    }

    pub fn is_head(&self, id: NodeId) -> bool {
        self.head == Some(id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.links(id).is_some()
    }

    pub fn get(&self, id: NodeId) -> Option<&T> {
        match self.slots.get(id.index as usize)? {
            Slot::Occupied {
                value, generation, ..
            } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        match self.slots.get_mut(id.index as usize)? {
            Slot::Occupied {
                value, generation, ..
            } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    /// Structural parent, or `None` for a top-level node (or a stale id).
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.links(id)?.parent
    }

    pub fn first_child(&self, id: NodeId) -> Option<NodeId> {
        self.links(id)?.first_child
    }

    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        self.links(id)?.next
    }

    pub fn prev_sibling(&self, id: NodeId) -> Option<NodeId> {
        self.links(id)?.prev
    }

    /// Establish the root. A tree has exactly one head; setting it twice is an error.
    pub fn set_head(&mut self, value: T) -> Result<NodeId> {
        if self.head.is_some() {
            return Err(Error::HeadAlreadySet);
        }
        let id = self.alloc(value, Links::default());
        self.head = Some(id);
        Ok(id)
    }

    /// Insert `value` as the last child of `parent`.
    pub fn append_child(&mut self, parent: NodeId, value: T) -> Result<NodeId> {
        let prev = self.links(parent).ok_or(Error::InvalidNode(parent))?.last_child;
        let id = self.alloc(
            value,
            Links {
                parent: Some(parent),
                prev,
                ..Links::default()
            },
        );
        match prev {
            Some(prev) => self.links_mut(prev).next = Some(id),
            None => self.links_mut(parent).first_child = Some(id),
        }
        self.links_mut(parent).last_child = Some(id);
        Ok(id)
    }

    /// Insert `value` as the sibling immediately following `node`.
    pub fn insert_after(&mut self, node: NodeId, value: T) -> Result<NodeId> {
        let links = *self.links(node).ok_or(Error::InvalidNode(node))?;
        let id = self.alloc(
            value,
            Links {
                parent: links.parent,
                prev: Some(node),
                next: links.next,
                ..Links::default()
            },
        );
        self.links_mut(node).next = Some(id);
        match links.next {
            Some(next) => self.links_mut(next).prev = Some(id),
            None => {
                if let Some(parent) = links.parent {
                    self.links_mut(parent).last_child = Some(id);
                }
            }
        }
        Ok(id)
    }

    /// Remove every descendant of `node`, keeping `node` itself. Returns the
    /// number of nodes removed.
    pub fn erase_children(&mut self, node: NodeId) -> Result<usize> {
        let first = self.links(node).ok_or(Error::InvalidNode(node))?.first_child;
        let mut doomed = Vec::new();
        let mut child = first;
        while let Some(c) = child {
            doomed.extend(self.pre_order_from(c).map(|(id, _)| id));
            child = self.links(c).and_then(|l| l.next);
        }
        for id in &doomed {
            self.release(*id);
        }
        let links = self.links_mut(node);
        links.first_child = None;
        links.last_child = None;
        Ok(doomed.len())
    }

    /// Remove `node` and its whole subtree. Returns the number of nodes removed.
    pub fn erase(&mut self, node: NodeId) -> Result<usize> {
        let links = *self.links(node).ok_or(Error::InvalidNode(node))?;
        let doomed: Vec<NodeId> = self.pre_order_from(node).map(|(id, _)| id).collect();

        match links.prev {
            Some(prev) => self.links_mut(prev).next = links.next,
            None => match links.parent {
                Some(parent) => self.links_mut(parent).first_child = links.next,
                None => {
                    if self.head == Some(node) {
                        self.head = links.next;
                    }
                }
            },
        }
        match links.next {
            Some(next) => self.links_mut(next).prev = links.prev,
            None => {
                if let Some(parent) = links.parent {
                    self.links_mut(parent).last_child = links.prev;
                }
            }
        }

        for id in &doomed {
            self.release(*id);
        }
        Ok(doomed.len())
    }

    /// Drop every node, including the head.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free_head = None;
        self.len = 0;
        self.head = None;
    }

    /// Direct children of `id`, in insertion order.
    pub fn children(&self, id: NodeId) -> Siblings<'_, T> {
        Siblings {
            tree: self,
            next: self.first_child(id),
        }
    }

    /// `id` followed by every later sibling.
    pub fn siblings(&self, id: NodeId) -> Siblings<'_, T> {
        Siblings {
            tree: self,
            next: self.contains(id).then_some(id),
        }
    }

    /// The head and every other top-level node.
    pub fn roots(&self) -> Siblings<'_, T> {
        Siblings {
            tree: self,
            next: self.head,
        }
    }

    /// Depth-first traversal of the whole tree, parents before children.
    pub fn pre_order(&self) -> PreOrder<'_, T> {
        PreOrder {
            tree: self,
            next: self.head,
            stop: None,
        }
    }

    /// Depth-first traversal of the subtree rooted at `id`.
    pub fn pre_order_from(&self, id: NodeId) -> PreOrder<'_, T> {
        let next = self.contains(id).then_some(id);
        PreOrder {
            tree: self,
            next,
            stop: next,
        }
    }

    /// Number of ancestors between `id` and the top level.
    pub fn level(&self, id: NodeId) -> usize {
        let mut level = 0;
        let mut cursor = self.parent(id);
        while let Some(p) = cursor {
            level += 1;
            cursor = self.parent(p);
        }
        level
    }

    fn links(&self, id: NodeId) -> Option<&Links> {
        match self.slots.get(id.index as usize)? {
            Slot::Occupied {
                links, generation, ..
            } if *generation == id.generation => Some(links),
            _ => None,
        }
    }

    /// Only called with ids already validated by the caller.
    fn links_mut(&mut self, id: NodeId) -> &mut Links {
        match &mut self.slots[id.index as usize] {
            Slot::Occupied { links, .. } => links,
            Slot::Vacant { .. } => unreachable!("link update on vacant slot {id:?}"),
        }
    }

    fn alloc(&mut self, value: T, links: Links) -> NodeId {
        self.len += 1;
        if let Some(free_index) = self.free_head {
            let slot = &mut self.slots[free_index as usize];
            let generation = match slot {
                Slot::Vacant {
                    next_free,
                    generation,
                } => {
                    self.free_head = *next_free;
                    *generation
                }
                Slot::Occupied { .. } => unreachable!("free list pointed to occupied slot"),
            };
            *slot = Slot::Occupied {
                value,
                links,
                generation,
            };
            NodeId {
                index: free_index,
                generation,
            }
        } else {
            let index = u32::try_from(self.slots.len()).expect("tree arena overflow");
            self.slots.push(Slot::Occupied {
                value,
                links,
                generation: 0,
            });
            NodeId {
                index,
                generation: 0,
            }
        }
    }

    fn release(&mut self, id: NodeId) {
        let slot = &mut self.slots[id.index as usize];
        if let Slot::Occupied { generation, .. } = slot {
            let next_generation = generation.wrapping_add(1);
            *slot = Slot::Vacant {
                next_free: self.free_head,
                generation: next_generation,
            };
            self.free_head = Some(id.index);
            self.len -= 1;
        }
    }
}

/// Sibling-chain iterator.
pub struct Siblings<'a, T> {
    tree: &'a Tree<T>,
    next: Option<NodeId>,
}

impl<'a, T> Iterator for Siblings<'a, T> {
    type Item = (NodeId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        self.next = self.tree.next_sibling(id);
        Some((id, self.tree.get(id)?))
    }
}

/// Pre-order iterator; optionally bounded to one subtree.
pub struct PreOrder<'a, T> {
    tree: &'a Tree<T>,
    next: Option<NodeId>,
    stop: Option<NodeId>,
}

impl<'a, T> Iterator for PreOrder<'a, T> {
    type Item = (NodeId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        self.next = self.advance(id);
        Some((id, self.tree.get(id)?))
    }
}

impl<T> PreOrder<'_, T> {
    fn advance(&self, id: NodeId) -> Option<NodeId> {
        if let Some(child) = self.tree.first_child(id) {
            return Some(child);
        }
        let mut cursor = id;
        loop {
            if self.stop == Some(cursor) {
                return None;
            }
            if let Some(next) = self.tree.next_sibling(cursor) {
                return Some(next);
            }
            cursor = self.tree.parent(cursor)?;
        }
    }
}

/// Serializes as a list of top-level nodes, each `{ "value": .., "children": [..] }`.
impl<T: Serialize> Serialize for Tree<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let roots: Vec<NodeId> = self.roots().map(|(id, _)| id).collect();
        let mut seq = serializer.serialize_seq(Some(roots.len()))?;
        for id in roots {
            seq.serialize_element(&Subtree { tree: self, id })?;
        }
        seq.end()
    }
}

struct Subtree<'a, T> {
    tree: &'a Tree<T>,
    id: NodeId,
}

impl<T: Serialize> Serialize for Subtree<'_, T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let children: Vec<Subtree<'_, T>> = self
            .tree
            .children(self.id)
            .map(|(id, _)| Subtree {
                tree: self.tree,
                id,
            })
            .collect();
        let mut st = serializer.serialize_struct("Node", 2)?;
        st.serialize_field("value", &self.tree.get(self.id))?;
        st.serialize_field("children", &children)?;
        st.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values<'a>(iter: impl Iterator<Item = (NodeId, &'a &'static str)>) -> Vec<&'static str> {
        iter.map(|(_, v)| *v).collect()
    }

    /// root -> (a -> (a1, a2), b)
    fn sample() -> (Tree<&'static str>, [NodeId; 5]) {
        let mut tree = Tree::new();
        let root = tree.set_head("root").unwrap();
        let a = tree.append_child(root, "a").unwrap();
        let a1 = tree.append_child(a, "a1").unwrap();
        let a2 = tree.append_child(a, "a2").unwrap();
        let b = tree.append_child(root, "b").unwrap();
        (tree, [root, a, a1, a2, b])
    }

    #[test]
    fn pre_order_visits_parents_before_children() {
        let (tree, _) = sample();
        assert_eq!(values(tree.pre_order()), vec!["root", "a", "a1", "a2", "b"]);
    }

    #[test]
    fn children_keep_insertion_order() {
        let (tree, [root, a, ..]) = sample();
        assert_eq!(values(tree.children(root)), vec!["a", "b"]);
        assert_eq!(values(tree.children(a)), vec!["a1", "a2"]);
    }

    #[test]
    fn set_head_twice_is_rejected() {
        let (mut tree, _) = sample();
        assert!(matches!(tree.set_head("again"), Err(Error::HeadAlreadySet)));
    }

    #[test]
    fn parent_links() {
        let (tree, [root, a, a1, _, b]) = sample();
        assert_eq!(tree.parent(a1), Some(a));
        assert_eq!(tree.parent(b), Some(root));
        assert_eq!(tree.parent(root), None);
        assert_eq!(tree.level(a1), 2);
    }

    #[test]
    fn insert_after_places_sibling_in_the_middle() {
        let (mut tree, [root, a, ..]) = sample();
        let mid = tree.insert_after(a, "mid").unwrap();
        assert_eq!(values(tree.children(root)), vec!["a", "mid", "b"]);
        assert_eq!(tree.parent(mid), Some(root));
    }

    #[test]
    fn insert_after_last_child_updates_tail() {
        let (mut tree, [root, _, _, _, b]) = sample();
        tree.insert_after(b, "c").unwrap();
        tree.append_child(root, "d").unwrap();
        assert_eq!(values(tree.children(root)), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn insert_after_head_adds_a_top_level_node() {
        let (mut tree, [root, ..]) = sample();
        let extra = tree.insert_after(root, "extra").unwrap();
        assert_eq!(tree.parent(extra), None);
        assert_eq!(values(tree.roots()), vec!["root", "extra"]);
        assert_eq!(
            values(tree.pre_order()),
            vec!["root", "a", "a1", "a2", "b", "extra"]
        );
    }

    #[test]
    fn erase_children_keeps_the_node() {
        let (mut tree, [root, a, a1, ..]) = sample();
        assert_eq!(tree.erase_children(a).unwrap(), 2);
        assert!(tree.contains(a));
        assert!(!tree.contains(a1), "erased id must be stale");
        assert_eq!(tree.len(), 3);
        assert_eq!(values(tree.pre_order_from(root)), vec!["root", "a", "b"]);
    }

    #[test]
    fn erase_unlinks_subtree() {
        let (mut tree, [root, a, ..]) = sample();
        assert_eq!(tree.erase(a).unwrap(), 3);
        assert_eq!(values(tree.children(root)), vec!["b"]);
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn reused_slots_do_not_revive_stale_ids() {
        let (mut tree, [root, a, a1, ..]) = sample();
        tree.erase_children(a).unwrap();
        let fresh = tree.append_child(root, "fresh").unwrap();
        assert_eq!(fresh.generation(), 1, "slot came from the free list");
        assert!(tree.get(a1).is_none());
        assert_eq!(tree.get(fresh), Some(&"fresh"));
    }

    #[test]
    fn append_under_stale_id_fails_fast() {
        let (mut tree, [_, a, a1, ..]) = sample();
        tree.erase_children(a).unwrap();
        assert!(matches!(
            tree.append_child(a1, "orphan"),
            Err(Error::InvalidNode(id)) if id == a1
        ));
        assert!(tree.insert_after(a1, "orphan").is_err());
        assert!(tree.erase_children(a1).is_err());
    }

    #[test]
    fn pre_order_from_stays_inside_subtree() {
        let (tree, [_, a, ..]) = sample();
        assert_eq!(values(tree.pre_order_from(a)), vec!["a", "a1", "a2"]);
    }

    #[test]
    fn siblings_start_at_the_given_node() {
        let (tree, [_, _, _, a2, b]) = sample();
        assert_eq!(values(tree.siblings(a2)), vec!["a2"]);
        assert_eq!(values(tree.siblings(b)), vec!["b"]);
    }

    #[test]
    fn clear_drops_head() {
        let (mut tree, _) = sample();
        tree.clear();
        assert!(tree.is_empty());
        assert!(tree.head().is_none());
        assert!(tree.set_head("new").is_ok());
    }

    #[test]
    fn serializes_nested() {
        let mut tree = Tree::new();
        let root = tree.set_head(1u32).unwrap();
        tree.append_child(root, 2).unwrap();
        let json = serde_json::to_string(&tree).unwrap();
        assert_eq!(
            json,
            r#"[{"value":1,"children":[{"value":2,"children":[]}]}]"#
        );
    }
}

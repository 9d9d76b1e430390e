//! Index-based intrusive doubly linked list
//!
//! Nodes live in an [`Arena`] and carry their own [`Link`]. The list holds
//! only head, tail and length, so pushing and unlinking a node by handle are
//! O(1) and restarting a node never allocates.

use crate::arena::{Arena, Handle};

/// Previous/next pointers embedded in a list node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Link {
    prev: Option<Handle>,
    next: Option<Handle>,
    linked: bool,
}

impl Link {
    pub fn is_linked(&self) -> bool {
        self.linked
    }
}

/// Values that can sit on an [`IndexList`].
pub trait Linked {
    fn link(&self) -> &Link;
    fn link_mut(&mut self) -> &mut Link;
}

/// Head/tail of an intrusive list whose nodes live in an arena.
///
/// A node may be on at most one list at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexList {
    head: Option<Handle>,
    tail: Option<Handle>,
    len: usize,
}

impl IndexList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn front(&self) -> Option<Handle> {
        self.head
    }

    /// Append `handle`. Returns false if it is missing or already linked.
    pub fn push_back<T: Linked>(&mut self, arena: &mut Arena<T>, handle: Handle) -> bool {
        match arena.get(handle) {
            Some(node) if !node.link().linked => {}
            _ => return false,
        }

        let old_tail = self.tail;
        if let Some(tail) = old_tail.and_then(|t| arena.get_mut(t)) {
            tail.link_mut().next = Some(handle);
        }
        if let Some(node) = arena.get_mut(handle) {
            *node.link_mut() = Link {
                prev: old_tail,
                next: None,
                linked: true,
            };
        }

        if self.head.is_none() {
            self.head = Some(handle);
        }
        self.tail = Some(handle);
        self.len += 1;
        true
    }

    /// Unlink `handle`. Returns false if it was not linked.
    pub fn remove<T: Linked>(&mut self, arena: &mut Arena<T>, handle: Handle) -> bool {
        let link = match arena.get(handle) {
            Some(node) if node.link().linked => *node.link(),
            _ => return false,
        };

        match link.prev.and_then(|p| arena.get_mut(p)) {
            Some(prev) => prev.link_mut().next = link.next,
            None => self.head = link.next,
        }
        match link.next.and_then(|n| arena.get_mut(n)) {
            Some(next) => next.link_mut().prev = link.prev,
            None => self.tail = link.prev,
        }
        if let Some(node) = arena.get_mut(handle) {
            *node.link_mut() = Link::default();
        }

        self.len -= 1;
        true
    }

    pub fn pop_front<T: Linked>(&mut self, arena: &mut Arena<T>) -> Option<Handle> {
        let head = self.head?;
        self.remove(arena, head);
        Some(head)
    }

    /// Handles in list order.
    pub fn to_vec<T: Linked>(&self, arena: &Arena<T>) -> Vec<Handle> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(handle) = cursor {
            out.push(handle);
            cursor = arena.get(handle).and_then(|node| node.link().next);
        }
        out
    }
}

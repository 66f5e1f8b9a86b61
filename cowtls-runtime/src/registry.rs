//! # Region Registry
//!
//! Directory from thread identity to [`Region`].
//!
//! Regions live in an arena and are threaded onto a doubly linked list in
//! insertion order. The list is authoritative: a region exists exactly when
//! it is on the list. Alongside it sits a fixed-size open-addressed index
//! with quadratic probing. The index is an accelerator only. A lookup
//! checks the key's home slot and accepts the occupant only if it belongs to
//! the requested thread; anything else (collision, probed placement, empty
//! slot) falls back to the tail, the head, and finally a scan of the list.
//!
//! The registry has no internal locking; [`TlsSpace`](crate::TlsSpace)
//! keeps it behind a mutex.

use std::fmt;

use crate::region::Region;
use crate::thread::ThreadKey;

/// Arena handle of a registered region.
type NodeId = usize;

#[derive(Debug)]
struct Node {
    region: Region,
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

/// Counters describing registry occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryStats {
    /// Regions currently registered.
    pub live_regions: usize,
    /// Index slots currently occupied.
    pub occupied_slots: usize,
    /// Regions that could not be placed in the index.
    pub unindexed: usize,
    /// Number of index slots.
    pub capacity: usize,
}

/// Thread → region directory.
pub struct Registry {
    nodes: Vec<Option<Node>>,
    free: Vec<NodeId>,
    head: Option<NodeId>,
    tail: Option<NodeId>,
    index: Box<[Option<NodeId>]>,
    count: usize,
}

impl Registry {
    /// Create an empty registry with `capacity` index slots.
    ///
    /// A capacity of zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            index: vec![None; capacity.max(1)].into_boxed_slice(),
            count: 0,
        }
    }

    /// Number of registered regions.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether no region is registered.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of index slots.
    pub fn capacity(&self) -> usize {
        self.index.len()
    }

    /// Number of occupied index slots.
    pub fn occupied_slots(&self) -> usize {
        self.index.iter().filter(|slot| slot.is_some()).count()
    }

    /// Occupancy counters.
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            live_regions: self.count,
            occupied_slots: self.occupied_slots(),
            unindexed: self.iter().filter(|region| region.slot().is_none()).count(),
            capacity: self.capacity(),
        }
    }

    /// Whether `owner` has a region.
    pub fn contains(&self, owner: ThreadKey) -> bool {
        self.locate(owner).is_some()
    }

    /// Register `region` under its owner.
    ///
    /// The caller guarantees the owner has no region yet. Returns the index
    /// slot the region landed in, or `None` if the probe sequence found no
    /// free slot.
    pub fn insert(&mut self, mut region: Region) -> Option<usize> {
        debug_assert!(!self.contains(region.owner()));
        let slot = self.probe(region.owner().slot(self.capacity()));
        region.set_slot(slot);

        let node = Node { region, prev: self.tail, next: None };
        let id = match self.free.pop() {
            Some(id) => {
                self.nodes[id] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };

        match self.tail {
            Some(tail) => self.node_mut(tail).next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);

        if let Some(slot) = slot {
            self.index[slot] = Some(id);
        }
        self.count += 1;
        slot
    }

    /// Region owned by `owner`.
    pub fn find(&self, owner: ThreadKey) -> Option<&Region> {
        self.locate(owner).map(|id| &self.node(id).region)
    }

    /// Mutable region owned by `owner`.
    pub fn find_mut(&mut self, owner: ThreadKey) -> Option<&mut Region> {
        let id = self.locate(owner)?;
        Some(&mut self.node_mut(id).region)
    }

    /// Unregister and return the region owned by `owner`.
    pub fn remove(&mut self, owner: ThreadKey) -> Option<Region> {
        let id = self.locate(owner)?;
        let node = self.nodes[id].take()?;

        match node.prev {
            Some(prev) => self.node_mut(prev).next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.node_mut(next).prev = node.prev,
            None => self.tail = node.prev,
        }

        if let Some(slot) = node.region.slot() {
            debug_assert_eq!(self.index[slot], Some(id));
            self.index[slot] = None;
        }
        self.free.push(id);
        self.count -= 1;
        Some(node.region)
    }

    /// Regions in insertion order.
    pub fn iter(&self) -> Iter<'_> {
        Iter { registry: self, cursor: self.head }
    }

    /// Quadratic probe starting at `home`: `key = (i² + key) mod capacity`.
    fn probe(&self, home: usize) -> Option<usize> {
        let capacity = self.capacity();
        let mut key = home;
        for i in 0..capacity {
            if i > 0 {
                key = (i * i + key) % capacity;
            }
            if self.index[key].is_none() {
                return Some(key);
            }
        }
        None
    }

    fn locate(&self, owner: ThreadKey) -> Option<NodeId> {
        let owned_by = |id: NodeId| self.node(id).region.owner() == owner;

        if let Some(id) = self.index[owner.slot(self.capacity())] {
            if owned_by(id) {
                return Some(id);
            }
        }
        if let Some(tail) = self.tail.filter(|&id| owned_by(id)) {
            return Some(tail);
        }
        if let Some(head) = self.head.filter(|&id| owned_by(id)) {
            return Some(head);
        }

        let mut cursor = self.head;
        while let Some(id) = cursor {
            if owned_by(id) {
                return Some(id);
            }
            cursor = self.node(id).next;
        }
        None
    }

    fn node(&self, id: NodeId) -> &Node {
        self.nodes[id].as_ref().expect("registry link points at a vacant node")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id].as_mut().expect("registry link points at a vacant node")
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("live_regions", &self.count)
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Iterator over registered regions in insertion order.
pub struct Iter<'a> {
    registry: &'a Registry,
    cursor: Option<NodeId>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Region;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.registry.node(self.cursor?);
        self.cursor = node.next;
        Some(&node.region)
    }
}

//! Arena-backed doubly linked list with stable handles.
//!
//! Both lock engines keep their per-lock state as an ordered chain of entries
//! that is scanned head to tail and edited in the middle while scanning. A
//! [`Chain`] stores entries in a slot arena so that a [`Handle`] stays valid
//! while other entries come and go, and removal is O(1). Handles carry a
//! generation, so a handle to a removed entry never aliases a newer one.

use std::fmt;

/// Stable reference to an entry of a [`Chain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: usize,
    generation: u64,
}

struct Slot<T> {
    value: Option<T>,
    generation: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Ordered collection with O(1) insertion and removal anywhere.
pub struct Chain<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<T> Default for Chain<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Chain<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_front(&mut self, value: T) -> Handle {
        let index = self.allocate(value);
        self.link(index, None, self.head);
        self.handle(index)
    }

    pub fn push_back(&mut self, value: T) -> Handle {
        let index = self.allocate(value);
        self.link(index, self.tail, None);
        self.handle(index)
    }

    /// Insert immediately before `at`, or at the back if `at` is stale.
    pub fn insert_before(&mut self, at: Handle, value: T) -> Handle {
        if !self.contains(at) {
            return self.push_back(value);
        }
        let prev = self.slots[at.index].prev;
        let index = self.allocate(value);
        self.link(index, prev, Some(at.index));
        self.handle(index)
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        if !self.contains(handle) {
            return None;
        }
        let slot = &mut self.slots[handle.index];
        let value = slot.value.take();
        let (prev, next) = (slot.prev.take(), slot.next.take());
        slot.generation += 1;

        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }

        self.free.push(handle.index);
        self.len -= 1;
        value
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.slots
            .get(handle.index)
            .map_or(false, |s| s.generation == handle.generation && s.value.is_some())
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slots
            .get(handle.index)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_mut())
    }

    pub fn first(&self) -> Option<Handle> {
        self.head.map(|i| self.handle(i))
    }

    pub fn last(&self) -> Option<Handle> {
        self.tail.map(|i| self.handle(i))
    }

    /// Entry following `handle`, if `handle` is still live.
    pub fn next(&self, handle: Handle) -> Option<Handle> {
        if !self.contains(handle) {
            return None;
        }
        self.slots[handle.index].next.map(|i| self.handle(i))
    }

    /// First entry matching `pred`, scanning from the head.
    pub fn find<F>(&self, mut pred: F) -> Option<Handle>
    where
        F: FnMut(&T) -> bool,
    {
        self.iter().find(|(_, v)| pred(v)).map(|(h, _)| h)
    }

    /// Remove every entry matching `pred`, returning them in chain order.
    pub fn remove_where<F>(&mut self, mut pred: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut removed = Vec::new();
        let mut cursor = self.first();
        while let Some(handle) = cursor {
            cursor = self.next(handle);
            let matches = self.get(handle).map_or(false, &mut pred);
            if matches {
                if let Some(value) = self.remove(handle) {
                    removed.push(value);
                }
            }
        }
        removed
    }

    /// Apply `f` to every entry in chain order.
    pub fn for_each_mut<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut T),
    {
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let slot = &mut self.slots[index];
            cursor = slot.next;
            if let Some(value) = slot.value.as_mut() {
                f(value);
            }
        }
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            chain: self,
            cursor: self.head,
        }
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.len = 0;
    }

    fn allocate(&mut self, value: T) -> usize {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            self.slots[index].value = Some(value);
            index
        } else {
            self.slots.push(Slot {
                value: Some(value),
                generation: 0,
                prev: None,
                next: None,
            });
            self.slots.len() - 1
        }
    }

    fn link(&mut self, index: usize, prev: Option<usize>, next: Option<usize>) {
        self.slots[index].prev = prev;
        self.slots[index].next = next;
        match prev {
            Some(p) => self.slots[p].next = Some(index),
            None => self.head = Some(index),
        }
        match next {
            Some(n) => self.slots[n].prev = Some(index),
            None => self.tail = Some(index),
        }
    }

    fn handle(&self, index: usize) -> Handle {
        Handle {
            index,
            generation: self.slots[index].generation,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Chain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter().map(|(_, v)| v)).finish()
    }
}

/// Head-to-tail iterator over a [`Chain`].
pub struct Iter<'a, T> {
    chain: &'a Chain<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (Handle, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let slot = &self.chain.slots[index];
        self.cursor = slot.next;
        let value = slot.value.as_ref()?;
        Some((
            Handle {
                index,
                generation: slot.generation,
            },
            value,
        ))
    }
}

//! Circular doubly-linked list threaded through buffer pool slots.
//!
//! The links live next to the slot index instead of inside the entry,
//! so the pool mutex is the only thing protecting them. The head is
//! the most recently used slot, the tail (`head.prev`) the eviction
//! candidate.

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: usize,
    next: usize,
    linked: bool,
}

#[derive(Debug, Default)]
pub(crate) struct IntrusiveList {
    links: Vec<Link>,
    head: Option<usize>,
    len: usize,
}

impl IntrusiveList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn ensure(&mut self, slot: usize) {
        if slot >= self.links.len() {
            self.links.resize(slot + 1, Link::default());
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn contains(&self, slot: usize) -> bool {
        self.links.get(slot).map_or(false, |l| l.linked)
    }

    pub(crate) fn head(&self) -> Option<usize> {
        self.head
    }

    pub(crate) fn tail(&self) -> Option<usize> {
        self.head.map(|h| self.links[h].prev)
    }

    pub(crate) fn push_front(&mut self, slot: usize) {
        self.ensure(slot);
        if self.links[slot].linked {
            self.remove(slot);
        }

        match self.head {
            None => {
                self.links[slot] = Link {
                    prev: slot,
                    next: slot,
                    linked: true,
                };
            }
            Some(head) => {
                let tail = self.links[head].prev;
                self.links[slot] = Link {
                    prev: tail,
                    next: head,
                    linked: true,
                };
                self.links[tail].next = slot;
                self.links[head].prev = slot;
            }
        }
        self.head = Some(slot);
        self.len += 1;
    }

    pub(crate) fn push_back(&mut self, slot: usize) {
        self.push_front(slot);
        // rotate: the old head becomes the head again, the new slot
        // sits right before it, i.e. at the tail
        self.head = Some(self.links[slot].next);
    }

    pub(crate) fn remove(&mut self, slot: usize) {
        if !self.contains(slot) {
            return;
        }

        let Link { prev, next, .. } = self.links[slot];
        if self.len == 1 {
            self.head = None;
        } else {
            self.links[prev].next = next;
            self.links[next].prev = prev;
            if self.head == Some(slot) {
                self.head = Some(next);
            }
        }
        self.links[slot] = Link::default();
        self.len -= 1;
    }

    pub(crate) fn move_to_front(&mut self, slot: usize) {
        if self.head == Some(slot) {
            return;
        }
        self.remove(slot);
        self.push_front(slot);
    }

    /// Slots from the tail (least recently used) towards the head.
    pub(crate) fn iter_from_tail(&self) -> Vec<usize> {
        let mut slots = Vec::with_capacity(self.len);
        if let Some(tail) = self.tail() {
            let mut cursor = tail;
            for _ in 0..self.len {
                slots.push(cursor);
                cursor = self.links[cursor].prev;
            }
        }
        slots
    }

    /// Slots from the head (most recently used) towards the tail.
    pub(crate) fn iter_from_head(&self) -> Vec<usize> {
        let mut slots = Vec::with_capacity(self.len);
        if let Some(head) = self.head {
            let mut cursor = head;
            for _ in 0..self.len {
                slots.push(cursor);
                cursor = self.links[cursor].next;
            }
        }
        slots
    }
}

#[cfg(test)]
mod tests {
    use super::IntrusiveList;

    #[test]
    fn test_order() {
        let mut list = IntrusiveList::new();
        list.push_front(0);
        list.push_front(1);
        list.push_front(2);
        assert_eq!(list.iter_from_head(), vec![2, 1, 0]);
        assert_eq!(list.tail(), Some(0));

        list.move_to_front(0);
        assert_eq!(list.iter_from_head(), vec![0, 2, 1]);
        assert_eq!(list.iter_from_tail(), vec![1, 2, 0]);

        list.push_back(5);
        assert_eq!(list.tail(), Some(5));
        assert_eq!(list.head(), Some(0));

        list.remove(2);
        list.remove(0);
        assert_eq!(list.iter_from_head(), vec![1, 5]);
        assert_eq!(list.len(), 2);

        list.remove(1);
        list.remove(5);
        assert_eq!(list.head(), None);
        assert!(list.iter_from_tail().is_empty());
    }
}

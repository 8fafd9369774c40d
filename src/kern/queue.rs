//! Linked queues addressed by index
//!
//! A [`ListArena`] holds many doubly-linked FIFO lists in one slab of nodes.
//! Each list is named by a key (an object id for wait lists) and each node by
//! its slab index, so an element that sits on several lists at once keeps one
//! index per membership and can leave any of them in O(1) without searching.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

/// Slab index of a queued node
pub type LinkIndex = usize;

#[derive(Debug, Clone, Copy)]
struct Node<K, T> {
    list: K,
    value: T,
    prev: Option<LinkIndex>,
    next: Option<LinkIndex>,
}

#[derive(Debug, Clone, Copy)]
struct QueueHead {
    first: LinkIndex,
    last: LinkIndex,
    len: usize,
}

/// Slab of nodes forming any number of keyed FIFO lists
#[derive(Debug)]
pub struct ListArena<K, T> {
    nodes: Vec<Option<Node<K, T>>>,
    free: Vec<LinkIndex>,
    heads: BTreeMap<K, QueueHead>,
}

impl<K: Ord + Copy, T: Copy> ListArena<K, T> {
    pub const fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            heads: BTreeMap::new(),
        }
    }

    /// Append `value` to the tail of `list`
    pub fn enqueue_tail(&mut self, list: K, value: T) -> LinkIndex {
        let prev = self.heads.get(&list).map(|head| head.last);
        let node = Node {
            list,
            value,
            prev,
            next: None,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.nodes[index] = Some(node);
                index
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };

        match self.heads.get_mut(&list) {
            Some(head) => {
                if let Some(Some(last)) = self.nodes.get_mut(head.last) {
                    last.next = Some(index);
                }
                head.last = index;
                head.len += 1;
            }
            None => {
                self.heads.insert(
                    list,
                    QueueHead {
                        first: index,
                        last: index,
                        len: 1,
                    },
                );
            }
        }
        index
    }

    /// Unlink the node at `index` from whichever list holds it
    ///
    /// Panics if the index is not linked; a double unlink means the caller's
    /// bookkeeping is corrupt.
    pub fn remove(&mut self, index: LinkIndex) -> T {
        let node = match self.nodes.get_mut(index).and_then(Option::take) {
            Some(node) => node,
            None => panic!("unlinking free queue node {}", index),
        };
        self.free.push(index);

        if let Some(prev) = node.prev {
            if let Some(Some(prev)) = self.nodes.get_mut(prev) {
                prev.next = node.next;
            }
        }
        if let Some(next) = node.next {
            if let Some(Some(next)) = self.nodes.get_mut(next) {
                next.prev = node.prev;
            }
        }

        let empty = match self.heads.get_mut(&node.list) {
            Some(head) => {
                if head.first == index {
                    if let Some(next) = node.next {
                        head.first = next;
                    }
                }
                if head.last == index {
                    if let Some(prev) = node.prev {
                        head.last = prev;
                    }
                }
                head.len -= 1;
                head.len == 0
            }
            None => false,
        };
        if empty {
            self.heads.remove(&node.list);
        }
        node.value
    }

    /// First value in `list`
    pub fn first(&self, list: K) -> Option<T> {
        let head = self.heads.get(&list)?;
        self.nodes[head.first].map(|node| node.value)
    }

    pub fn len(&self, list: K) -> usize {
        self.heads.get(&list).map(|head| head.len).unwrap_or(0)
    }

    pub fn is_empty(&self, list: K) -> bool {
        !self.heads.contains_key(&list)
    }

    /// Values of `list` in FIFO order
    pub fn iter(&self, list: K) -> QueueIter<'_, K, T> {
        QueueIter {
            arena: self,
            cursor: self.heads.get(&list).map(|head| head.first),
        }
    }

    /// Snapshot of `list`, for walks that modify the arena
    pub fn to_vec(&self, list: K) -> Vec<T> {
        self.iter(list).collect()
    }

    /// Number of linked nodes across all lists
    pub fn total_len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }
}

impl<K: Ord + Copy, T: Copy> Default for ListArena<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over one list of a [`ListArena`]
pub struct QueueIter<'a, K, T> {
    arena: &'a ListArena<K, T>,
    cursor: Option<LinkIndex>,
}

impl<'a, K: Ord + Copy, T: Copy> Iterator for QueueIter<'a, K, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let index = self.cursor?;
        let node = self.arena.nodes.get(index).copied().flatten()?;
        self.cursor = node.next;
        Some(node.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_queue_fifo_order() {
        let mut arena = ListArena::new();
        arena.enqueue_tail(1u32, 'a');
        arena.enqueue_tail(1u32, 'b');
        arena.enqueue_tail(2u32, 'x');
        arena.enqueue_tail(1u32, 'c');

        assert_eq!(arena.to_vec(1), vec!['a', 'b', 'c']);
        assert_eq!(arena.to_vec(2), vec!['x']);
        assert_eq!(arena.first(1), Some('a'));
        assert_eq!(arena.len(1), 3);
        assert!(arena.is_empty(3));
    }

    #[test]
    fn test_queue_remove_anywhere() {
        let mut arena = ListArena::new();
        let a = arena.enqueue_tail(0u32, 1);
        let b = arena.enqueue_tail(0u32, 2);
        let c = arena.enqueue_tail(0u32, 3);

        assert_eq!(arena.remove(b), 2);
        assert_eq!(arena.to_vec(0), vec![1, 3]);
        assert_eq!(arena.remove(a), 1);
        assert_eq!(arena.first(0), Some(3));
        assert_eq!(arena.remove(c), 3);
        assert!(arena.is_empty(0));
        assert_eq!(arena.total_len(), 0);
    }

    #[test]
    fn test_queue_reuses_nodes() {
        let mut arena = ListArena::new();
        let a = arena.enqueue_tail(0u32, 1);
        arena.remove(a);
        let b = arena.enqueue_tail(5u32, 2);
        assert_eq!(a, b);
        assert_eq!(arena.to_vec(5), vec![2]);
        // The tail of a list that emptied and refilled is the new node
        let c = arena.enqueue_tail(5u32, 3);
        assert_eq!(arena.to_vec(5), vec![2, 3]);
        arena.remove(c);
        arena.enqueue_tail(5u32, 4);
        assert_eq!(arena.to_vec(5), vec![2, 4]);
    }

    #[test]
    #[should_panic(expected = "unlinking free queue node")]
    fn test_queue_double_remove_panics() {
        let mut arena = ListArena::new();
        let a = arena.enqueue_tail(0u32, 1);
        arena.remove(a);
        arena.remove(a);
    }
}

//! 以缓冲区下标为节点的双向链表
//!
//! 节点就是缓冲区在所属大小类中的下标，链接关系存放在并行数组里，
//! 支持 O(1) 的尾部插入、头部取出和按下标删除。

use alloc::vec::Vec;

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<usize>,
    next: Option<usize>,
    linked: bool,
}

/// 闲置缓冲区链表，头部是最早闲置的缓冲区
#[derive(Debug, Default)]
pub(crate) struct IdleList {
    links: Vec<Link>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl IdleList {
    pub(crate) const fn new() -> Self {
        IdleList {
            links: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// 为新增的缓冲区预留节点
    pub(crate) fn grow(&mut self, nodes: usize) {
        self.links.resize(nodes, Link::default());
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn contains(&self, idx: usize) -> bool {
        self.links.get(idx).is_some_and(|l| l.linked)
    }

    pub(crate) fn push_back(&mut self, idx: usize) {
        assert!(!self.links[idx].linked, "buffer {} already idle", idx);
        self.links[idx] = Link {
            prev: self.tail,
            next: None,
            linked: true,
        };
        match self.tail {
            Some(tail) => self.links[tail].next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
    }

    pub(crate) fn pop_front(&mut self) -> Option<usize> {
        let idx = self.head?;
        self.remove(idx);
        Some(idx)
    }

    /// 从链表中摘下 `idx`，返回它原先是否在链表中
    pub(crate) fn remove(&mut self, idx: usize) -> bool {
        if !self.contains(idx) {
            return false;
        }
        let Link { prev, next, .. } = self.links[idx];
        match prev {
            Some(p) => self.links[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.links[n].prev = prev,
            None => self.tail = prev,
        }
        self.links[idx] = Link::default();
        self.len -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_with_removal_in_the_middle() {
        let mut list = IdleList::new();
        list.grow(4);
        for idx in [2, 0, 3, 1] {
            list.push_back(idx);
        }
        assert!(list.remove(3));
        assert!(!list.remove(3));
        assert_eq!(list.len(), 3);
        assert_eq!(list.pop_front(), Some(2));
        assert_eq!(list.pop_front(), Some(0));
        list.push_back(3);
        assert_eq!(list.pop_front(), Some(1));
        assert_eq!(list.pop_front(), Some(3));
        assert_eq!(list.pop_front(), None);
        assert_eq!(list.len(), 0);
    }

    #[test]
    #[should_panic(expected = "already idle")]
    fn test_double_push_panics() {
        let mut list = IdleList::new();
        list.grow(1);
        list.push_back(0);
        list.push_back(0);
    }
}

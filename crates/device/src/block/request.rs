//! 块设备请求队列
//!
//! 每个磁盘一条按起始扇区排序的待处理队列和一个扫描方向（电梯算法）：
//! 当前请求完成后，沿当前方向取相邻的请求；已经位于队列该方向的尽头时
//! 先掉转方向再取。队列为空时到达的请求直接执行，否则它的提交者阻塞，
//! 直到被选中。
//!
//! 本结构不带锁，由设备表在自旋锁内操作。

use alloc::vec::Vec;

use sync::TaskId;

/// 扫描方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// 扇区号递增
    Up,
    /// 扇区号递减
    Down,
}

/// 队列内请求的标识
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestId(u64);

#[derive(Debug)]
struct Request {
    id: RequestId,
    sector: usize,
    waiter: Option<TaskId>,
    /// 轮到它执行
    selected: bool,
}

/// 单个磁盘的待处理请求
#[derive(Debug)]
pub struct RequestQueue {
    pending: Vec<Request>,
    direction: Direction,
    next_id: u64,
}

impl RequestQueue {
    /// 空队列，初始方向向上
    pub const fn new() -> Self {
        RequestQueue {
            pending: Vec::new(),
            direction: Direction::Up,
            next_id: 0,
        }
    }

    /// 当前扫描方向
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// 待处理（含正在执行的）请求数
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// 按起始扇区排序插入，扇区相同的排在已有请求之后。
    ///
    /// 返回请求标识，以及插入前队列是否为空；为空时请求立即被选中。
    pub fn insert(&mut self, sector: usize, waiter: Option<TaskId>) -> (RequestId, bool) {
        let id = RequestId(self.next_id);
        self.next_id += 1;
        let was_empty = self.pending.is_empty();
        let pos = self.pending.partition_point(|r| r.sector <= sector);
        self.pending.insert(
            pos,
            Request {
                id,
                sector,
                waiter,
                selected: was_empty,
            },
        );
        (id, was_empty)
    }

    /// 请求是否已被选中执行
    pub fn is_selected(&self, id: RequestId) -> bool {
        self.pending.iter().any(|r| r.id == id && r.selected)
    }

    fn index_of(&self, id: RequestId) -> usize {
        match self.pending.iter().position(|r| r.id == id) {
            Some(idx) => idx,
            None => panic!("request {:?} not queued", id),
        }
    }

    /// 请求执行完毕：移出队列，选出下一个请求，返回它的等待任务。
    ///
    /// # Panics
    /// `id` 不在队列中时 panic。
    pub fn complete(&mut self, id: RequestId) -> Option<TaskId> {
        let idx = self.index_of(id);
        let at_end = match self.direction {
            Direction::Up => idx + 1 == self.pending.len(),
            Direction::Down => idx == 0,
        };
        if at_end {
            self.direction = match self.direction {
                Direction::Up => Direction::Down,
                Direction::Down => Direction::Up,
            };
        }
        let next = match self.direction {
            Direction::Up => Some(idx + 1).filter(|&n| n < self.pending.len()),
            Direction::Down => idx.checked_sub(1),
        };
        self.pending.remove(idx);

        let next = next.map(|n| if n > idx { n - 1 } else { n })?;
        let req = &mut self.pending[next];
        req.selected = true;
        log::trace!("next request at sector {}", req.sector);
        req.waiter
    }

    /// 撤销尚未执行的请求。若它已被选中，则把设备交给下一个请求，
    /// 返回下一个请求的等待任务。
    pub fn abort(&mut self, id: RequestId) -> Option<TaskId> {
        let idx = self.index_of(id);
        if self.pending[idx].selected {
            self.complete(id)
        } else {
            self.pending.remove(idx);
            None
        }
    }

    /// 按队列顺序列出起始扇区
    pub fn sectors(&self) -> impl Iterator<Item = usize> + '_ {
        self.pending.iter().map(|r| r.sector)
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn task(n: usize) -> Option<TaskId> {
        Some(TaskId(n))
    }

    #[test]
    fn test_scan_reverses_at_list_end() {
        let mut q = RequestQueue::new();
        let (r50, empty) = q.insert(50, task(50));
        assert!(empty);
        assert!(q.is_selected(r50));
        let (r10, empty) = q.insert(10, task(10));
        assert!(!empty);
        let (r30, _) = q.insert(30, task(30));
        assert_eq!(q.sectors().collect::<Vec<_>>(), vec![10, 30, 50]);

        // 50 在最高端，向上无请求，掉头
        assert_eq!(q.complete(r50), task(30));
        assert_eq!(q.direction(), Direction::Down);
        assert!(q.is_selected(r30));
        assert!(!q.is_selected(r10));

        assert_eq!(q.complete(r30), task(10));
        assert_eq!(q.direction(), Direction::Down);

        // 10 在最低端，再次掉头，没有后续
        assert_eq!(q.complete(r10), None);
        assert_eq!(q.direction(), Direction::Up);
        assert!(q.is_empty());
    }

    #[test]
    fn test_no_reversal_mid_list() {
        let mut q = RequestQueue::new();
        let (r20, _) = q.insert(20, None);
        q.insert(40, task(40));
        q.insert(5, task(5));
        // 向上还有 40，不掉头
        assert_eq!(q.complete(r20), task(40));
        assert_eq!(q.direction(), Direction::Up);
    }

    #[test]
    fn test_equal_sectors_keep_arrival_order() {
        let mut q = RequestQueue::new();
        let (first, _) = q.insert(7, task(1));
        q.insert(7, task(2));
        q.insert(7, task(3));
        assert_eq!(q.complete(first), task(2));
    }

    #[test]
    fn test_abort_unselected_and_selected() {
        let mut q = RequestQueue::new();
        let (head, _) = q.insert(10, task(1));
        let (mid, _) = q.insert(20, task(2));
        let (r30, _) = q.insert(30, task(3));

        assert_eq!(q.abort(mid), None);
        assert_eq!(q.sectors().collect::<Vec<_>>(), vec![10, 30]);

        let next = q.complete(head);
        assert_eq!(next, task(3));
        // 被选中的请求放弃时，设备交给下一个
        let (r40, _) = q.insert(40, task(4));
        assert!(q.is_selected(r30));
        assert_eq!(q.abort(r30), task(4));
        assert!(q.is_selected(r40));
    }

    #[test]
    #[should_panic(expected = "not queued")]
    fn test_complete_unknown_request_panics() {
        let mut q = RequestQueue::new();
        let (id, _) = q.insert(1, None);
        q.complete(id);
        q.complete(id);
    }
}

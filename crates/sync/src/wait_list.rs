//! 等待队列

use alloc::collections::VecDeque;

use crate::sched::TaskId;

/// 阻塞任务的先进先出队列。
///
/// 本身不带锁，总是嵌在某个 [`SpinLock`](crate::SpinLock) 保护的状态里，
/// 与它所等待的条件在同一把锁下检查和登记，避免丢失唤醒。
#[derive(Debug, Default)]
pub struct WaitList {
    tasks: VecDeque<TaskId>,
}

impl WaitList {
    /// 空队列
    pub const fn new() -> Self {
        Self {
            tasks: VecDeque::new(),
        }
    }

    /// 登记一个等待者
    pub fn push(&mut self, task: TaskId) {
        debug_assert!(!self.tasks.contains(&task), "{} already waiting", task);
        self.tasks.push_back(task);
    }

    /// 取出等待最久的任务
    pub fn pop(&mut self) -> Option<TaskId> {
        self.tasks.pop_front()
    }

    /// 移除指定任务（被打断的等待者自行退出时使用），返回它是否在队列中
    pub fn remove(&mut self, task: TaskId) -> bool {
        match self.tasks.iter().position(|&t| t == task) {
            Some(idx) => {
                self.tasks.remove(idx);
                true
            }
            None => false,
        }
    }

    /// 任务是否在队列中
    pub fn contains(&self, task: TaskId) -> bool {
        self.tasks.contains(&task)
    }

    /// 等待者数量
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// 队列是否为空
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

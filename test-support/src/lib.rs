//! 测试支持 crate
//!
//! 在宿主机上为各内核 crate 的测试提供 Mock 实现：中断状态、
//! 模拟物理内存和基于线程的调度器。
//!
//! 这里不依赖任何内核 crate（避免循环依赖），各 crate 在测试中
//! 为这些 Mock 实现自己的 trait。

pub mod mock;

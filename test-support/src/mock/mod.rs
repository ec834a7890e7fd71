//! Mock 实现模块

pub mod arch;
pub mod mm;
pub mod sched;

pub use arch::MOCK_ARCH_OPS;
pub use mm::MOCK_MM_OPS;
pub use sched::MOCK_SCHEDULER;

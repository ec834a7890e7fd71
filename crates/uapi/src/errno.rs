//! 错误码
//!
//! 与 Linux 数值保持一致；系统调用以负值返回。

pub const EPERM: isize = 1;
pub const EINTR: isize = 4;
pub const EIO: isize = 5;
pub const ENOMEM: isize = 12;
pub const EFAULT: isize = 14;
pub const ENODEV: isize = 19;
pub const EINVAL: isize = 22;

/// 成功
pub const EOK: isize = 0;

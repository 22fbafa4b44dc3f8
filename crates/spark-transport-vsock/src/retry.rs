//! 重试策略数据化。
//!
//! # 教案级说明
//! - **Why**：`accept` 系统调用的瞬时失败与 `accept_with_timeout` 的暂时性错误都需要重试，
//!   但两者的节奏不同；把判定写成数据后，循环体只负责执行，策略可以脱离 IO 单独审计与测试。
//! - **What**：[`RetryClass`] 三分法：立即重试、延迟后重试、终止。
//! - **How**：每个重试循环都先调用本模块的分类函数，再按返回值行动，不在循环内散落判断。

use std::{io, time::Duration};

use crate::error::VsockError;

/// `accept_with_timeout` 遇到暂时性错误时的默认等待间隔。
pub const DEFAULT_ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// 重试分类。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryClass {
    /// 瞬时条件，不计为失败，立即再次尝试（必要时先等待就绪）。
    Immediately,
    /// 暂时性错误，等待给定间隔后重试。
    AfterDelay(Duration),
    /// 终止性错误，立即交给调用方。
    Terminal,
}

impl RetryClass {
    /// 是否应当重试。
    pub fn should_retry(self) -> bool {
        !matches!(self, RetryClass::Terminal)
    }
}

/// 对 `accept4` 系统调用失败进行分类。
///
/// - 暂无待接受连接（`EAGAIN`/`EWOULDBLOCK`）、连接在接受前被中止（`ECONNABORTED`）
///   与信号中断都不是真正的失败，立即重试；
/// - 其余错误终止。
pub fn accept_syscall_class(err: &io::Error) -> RetryClass {
    match err.kind() {
        io::ErrorKind::WouldBlock
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::Interrupted => RetryClass::Immediately,
        _ => RetryClass::Terminal,
    }
}

/// 对 `accept_with_timeout` 观察到的规范错误进行分类。
///
/// 暂时性错误在 `delay` 之后重试，其余错误（包括监听器被关闭）终止。
pub fn accept_helper_class(err: &VsockError, delay: Duration) -> RetryClass {
    if err.is_temporary() {
        RetryClass::AfterDelay(delay)
    } else {
        RetryClass::Terminal
    }
}

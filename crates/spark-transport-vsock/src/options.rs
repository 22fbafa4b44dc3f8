use std::time::Duration;

use crate::retry::DEFAULT_ACCEPT_RETRY_DELAY;

/// 监听器的可选参数集合。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将“绑定到哪个上下文 ID”“监听队列多长”显式建模，避免在 `bind` 签名上堆叠参数；
/// - 测试与特殊宿主可以绕过上下文 ID 探测，直接指定绑定目标（例如 [`CID_ANY`](crate::CID_ANY)）。
///
/// ## 契约（What）
/// - `context_id`：`None` 表示通过上下文 ID 探测协作者获取本机 ID；
/// - `backlog`：`None` 表示使用平台最大值 `SOMAXCONN`；
/// - 所有字段在绑定前应用，绑定成功后不可修改。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    context_id: Option<u32>,
    backlog: Option<i32>,
}

impl ListenOptions {
    /// 指定绑定的上下文 ID，跳过探测。
    pub fn with_context_id(mut self, context_id: u32) -> Self {
        self.context_id = Some(context_id);
        self
    }

    /// 覆盖监听队列长度。
    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    /// 显式指定的上下文 ID。
    pub fn context_id(&self) -> Option<u32> {
        self.context_id
    }

    /// 显式指定的监听队列长度。
    pub fn backlog(&self) -> Option<i32> {
        self.backlog
    }
}

/// `accept_with_timeout` 的重试节奏。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcceptRetry {
    delay: Duration,
}

impl AcceptRetry {
    /// 以给定间隔构造。
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// 暂时性错误后的等待间隔。
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for AcceptRetry {
    fn default() -> Self {
        Self::new(DEFAULT_ACCEPT_RETRY_DELAY)
    }
}

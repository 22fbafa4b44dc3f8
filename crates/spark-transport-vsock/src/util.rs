//! 监听器辅助函数。
//!
//! # 教案级说明
//! - **Why**：并非所有集成层都支持逐次设置 `accept` 截止时间；以“到时关闭监听器”的方式
//!   提供超时语义，适用于任何实现了 [`Acceptor`] 的监听器。
//! - **How**：定时器与接受循环在同一个 `select!` 中竞争；定时器先到则关闭监听器，
//!   接受循环随后以关闭错误结束；接受成功则丢弃定时器，相当于撤销。
//! - **What**：暂时性错误（[`VsockError::is_temporary`]）按 [`AcceptRetry`] 的间隔重试，
//!   其余错误立即返回；重试判定全部交给 [`accept_helper_class`]。

use std::{future::Future, time::Duration};

use tokio::time;
use tracing::{debug, trace};

use crate::{
    error::VsockError,
    options::AcceptRetry,
    retry::{RetryClass, accept_helper_class},
};

/// 可被关闭打断的监听器抽象。
pub trait Acceptor {
    /// 接受得到的连接类型。
    type Conn;

    /// 接受一个连接。
    fn accept(&self) -> impl Future<Output = Result<Self::Conn, VsockError>> + Send;

    /// 关闭监听器；阻塞中的 `accept` 必须随之返回错误。
    fn close(&self) -> Result<(), VsockError>;
}

/// 在 `timeout` 内接受一个连接；`timeout` 为零表示不设上限。
///
/// 超时后监听器被关闭，不可再用。
pub async fn accept_with_timeout<A>(listener: &A, timeout: Duration) -> Result<A::Conn, VsockError>
where
    A: Acceptor + ?Sized,
{
    accept_with_timeout_and_retry(listener, timeout, AcceptRetry::default()).await
}

/// 与 [`accept_with_timeout`] 相同，但使用自定义重试节奏。
pub async fn accept_with_timeout_and_retry<A>(
    listener: &A,
    timeout: Duration,
    retry: AcceptRetry,
) -> Result<A::Conn, VsockError>
where
    A: Acceptor + ?Sized,
{
    let accepting = accept_retrying(listener, retry);
    tokio::pin!(accepting);
    if timeout.is_zero() {
        return accepting.await;
    }

    let timer = time::sleep(timeout);
    tokio::pin!(timer);
    tokio::select! {
        biased;
        result = &mut accepting => return result,
        () = &mut timer => {
            debug!(?timeout, "accept timeout elapsed, closing listener");
            if let Err(err) = listener.close() {
                debug!(error = %err, "closing listener on accept timeout failed");
            }
        }
    }
    accepting.await
}

async fn accept_retrying<A>(listener: &A, retry: AcceptRetry) -> Result<A::Conn, VsockError>
where
    A: Acceptor + ?Sized,
{
    loop {
        let err = match listener.accept().await {
            Ok(conn) => return Ok(conn),
            Err(err) => err,
        };
        match accept_helper_class(&err, retry.delay()) {
            RetryClass::AfterDelay(delay) => {
                trace!(error = %err, ?delay, "temporary accept error, retrying after delay");
                time::sleep(delay).await;
            }
            RetryClass::Immediately => {
                trace!(error = %err, "transient accept error, retrying");
            }
            RetryClass::Terminal => return Err(err),
        }
    }
}

use std::os::fd::RawFd;

use crate::{conn::VsockStream, error::{Op, VsockError}, fd::Direction};

/// 连接底层描述符的受控访问句柄。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 允许调用方执行本 crate 未封装的套接字选项或系统调用，同时不破坏托管阶段的不变量；
/// - 与连接共享描述符：连接关闭后句柄上的所有操作返回关闭错误。
///
/// ## 契约（What）
/// - [`control`](Self::control)：把描述符交给同步回调，不等待就绪；
/// - [`read`](Self::read)/[`write`](Self::write)：回调返回 `false` 表示尚未完成，
///   句柄等待对应方向就绪后再次调用，直到返回 `true`；遵循连接的截止时间与关闭；
/// - 回调不得关闭或转移描述符的所有权。
#[derive(Clone, Debug)]
pub struct RawConn {
    stream: VsockStream,
}

impl RawConn {
    pub(crate) fn new(stream: VsockStream) -> Self {
        Self { stream }
    }

    /// 以描述符调用 `f`。
    pub fn control<R>(&self, f: impl FnOnce(RawFd) -> R) -> Result<R, VsockError> {
        self.stream
            .socket()
            .control(f)
            .map_err(|err| self.stream.error(Op::RawControl, err))
    }

    /// 读就绪驱动的回调循环。
    pub async fn read(&self, f: impl FnMut(RawFd) -> bool) -> Result<(), VsockError> {
        self.stream
            .socket()
            .raw_io(Direction::Read, f)
            .await
            .map_err(|err| self.stream.error(Op::RawRead, err))
    }

    /// 写就绪驱动的回调循环。
    pub async fn write(&self, f: impl FnMut(RawFd) -> bool) -> Result<(), VsockError> {
        self.stream
            .socket()
            .raw_io(Direction::Write, f)
            .await
            .map_err(|err| self.stream.error(Op::RawWrite, err))
    }
}

#[cfg(test)]
mod tests {
    use crate::conn::tests::{GUEST, HOST_SERVICE, stream_pair};
    use crate::error::Op;
    use nix::libc;
    use std::time::{Duration, Instant};

    #[tokio::test(flavor = "multi_thread")]
    async fn raw_read_retries_until_the_callback_consumes_data() {
        let (guest, host) = stream_pair();
        let raw = guest.syscall_conn().expect("raw conn");

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            host.write_all(b"raw").await.expect("write");
            host
        });

        let mut buf = [0u8; 8];
        let mut received = 0;
        raw.read(|fd| {
            // SAFETY: 缓冲区在回调期间有效。
            let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
            if n <= 0 {
                return false;
            }
            received = n as usize;
            true
        })
        .await
        .expect("raw read");
        assert_eq!(&buf[..received], b"raw");
        writer.await.expect("join");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn raw_handle_follows_connection_state() {
        let (guest, _host) = stream_pair();
        let raw = guest.syscall_conn().expect("raw conn");
        assert!(raw.control(|fd| fd >= 0).expect("control"));

        guest
            .set_read_deadline(Some(Instant::now() - Duration::from_millis(1)))
            .expect("set");
        let err = raw.read(|_| true).await.expect_err("deadline passed");
        assert!(err.is_timeout());
        assert_eq!(err.op(), Op::RawRead);
        assert_eq!(err.source_addr(), Some(GUEST));
        assert_eq!(err.addr(), Some(HOST_SERVICE));

        guest.close().expect("close");
        let err = raw.control(|_| ()).expect_err("closed");
        assert!(err.is_closed());
        assert_eq!(err.op(), Op::RawControl);
        assert_eq!(err.source_addr(), None);
        assert_eq!(err.addr(), Some(GUEST));

        let err = raw.write(|_| true).await.expect_err("closed");
        assert_eq!(err.op(), Op::RawWrite);
    }
}

use std::{io, sync::Arc, time::Instant};

use tracing::debug;

use crate::{
    addr::VsockAddr,
    error::{Classified, Op, VsockError, classify, op_error},
    fd::{DeadlineKind, ManagedSocket, RawSocket},
    raw::RawConn,
};

#[derive(Debug)]
struct VsockStreamInner {
    socket: ManagedSocket,
    local_addr: VsockAddr,
    peer_addr: VsockAddr,
}

/// 已建立的 vsock 流连接。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 以字节流语义承载宿主机与虚拟机之间的通信，同时给出与 IP 传输一致的
///   截止时间、半关闭与规范错误；
/// - 克隆共享同一个描述符：一个任务阻塞在 `read` 时，另一个任务可以调整截止时间或 `close`。
///
/// ## 逻辑 (How)
/// - 建连（[`connect`](Self::connect)）在阻塞线程池上完成原始阶段的 `connect` 与
///   `getsockname`，随后一次性切换到托管阶段；任何一步失败都会提前释放描述符；
/// - 读写直接委托托管描述符，失败时经分类器整形为 [`VsockError`]。
///
/// ## 契约 (What)
/// - `read` 在对端关闭写方向后返回 `Ok(0)`，其余操作把流结束作为 `EOF` 错误返回；
/// - 关闭后的任何操作都返回 `use of closed network connection`；
/// - 截止时间参数为 `None` 时清除限制，过去的时刻使下一次阻塞操作立即超时。
#[derive(Clone, Debug)]
pub struct VsockStream {
    inner: Arc<VsockStreamInner>,
}

impl VsockStream {
    /// 以阻塞阶段描述符与已知地址构造连接，完成托管阶段切换。
    pub(crate) fn from_raw(
        raw: RawSocket,
        local_addr: VsockAddr,
        peer_addr: VsockAddr,
    ) -> io::Result<Self> {
        let socket = raw.into_managed(local_addr.file_name())?;
        Ok(Self {
            inner: Arc::new(VsockStreamInner {
                socket,
                local_addr,
                peer_addr,
            }),
        })
    }

    /// 连接到 `{context_id, port}`。
    ///
    /// 错误只携带目标地址。
    pub async fn connect(context_id: u32, port: u32) -> Result<Self, VsockError> {
        let remote = VsockAddr::new(context_id, port);
        let dial_error = |err| op_error(Op::Dial, err, None, Some(remote));

        let (raw, local) = tokio::task::spawn_blocking(move || {
            let raw = RawSocket::new()?;
            match raw.connect(remote).and_then(|()| raw.local_addr()) {
                Ok(local) => Ok((raw, local)),
                Err(err) => {
                    let _ = raw.early_close();
                    Err(err)
                }
            }
        })
        .await
        .map_err(io::Error::other)
        .and_then(|result| result)
        .map_err(dial_error)?;

        let stream = Self::from_raw(raw, local, remote).map_err(dial_error)?;
        debug!(op = %Op::Dial, local = %local, remote = %remote, "vsock connection established");
        Ok(stream)
    }

    /// 读取数据到缓冲区；对端关闭写方向后返回 `Ok(0)`。
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, VsockError> {
        match self.inner.socket.read(buf).await {
            Ok(n) => Ok(n),
            Err(err) => match classify(Op::Read, err, self.local(), self.peer()) {
                Classified::EndOfStream => Ok(0),
                Classified::Error(err) => Err(err),
            },
        }
    }

    /// 执行一次写入，返回实际写入的字节数。
    pub async fn write(&self, buf: &[u8]) -> Result<usize, VsockError> {
        self.inner
            .socket
            .write(buf)
            .await
            .map_err(|err| self.error(Op::Write, err))
    }

    /// 循环写入直到整个缓冲区被接受。
    pub async fn write_all(&self, mut buf: &[u8]) -> Result<(), VsockError> {
        while !buf.is_empty() {
            match self.write(buf).await? {
                0 => {
                    return Err(self.error(Op::Write, io::ErrorKind::WriteZero.into()));
                }
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }

    /// 关闭读方向。
    pub fn close_read(&self) -> Result<(), VsockError> {
        self.inner
            .socket
            .shutdown(std::net::Shutdown::Read)
            .map_err(|err| self.error(Op::Close, err))
    }

    /// 关闭写方向，对端随后读到流结束。
    pub fn close_write(&self) -> Result<(), VsockError> {
        self.inner
            .socket
            .shutdown(std::net::Shutdown::Write)
            .map_err(|err| self.error(Op::Close, err))
    }

    /// 关闭连接并唤醒所有阻塞中的操作；重复关闭返回关闭错误。
    pub fn close(&self) -> Result<(), VsockError> {
        self.inner
            .socket
            .close()
            .map_err(|err| self.error(Op::Close, err))
    }

    /// 同时设置读写截止时间。
    pub fn set_deadline(&self, deadline: Option<Instant>) -> Result<(), VsockError> {
        self.set(DeadlineKind::Both, deadline)
    }

    /// 设置读截止时间。
    pub fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<(), VsockError> {
        self.set(DeadlineKind::Read, deadline)
    }

    /// 设置写截止时间。
    pub fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<(), VsockError> {
        self.set(DeadlineKind::Write, deadline)
    }

    /// 本地地址。
    pub fn local_addr(&self) -> VsockAddr {
        self.inner.local_addr
    }

    /// 对端地址。
    pub fn peer_addr(&self) -> VsockAddr {
        self.inner.peer_addr
    }

    /// 获取底层描述符的受控访问句柄。
    pub fn syscall_conn(&self) -> Result<RawConn, VsockError> {
        self.inner
            .socket
            .control(|_| ())
            .map_err(|err| self.error(Op::SyscallConn, err))?;
        Ok(RawConn::new(self.clone()))
    }

    pub(crate) fn socket(&self) -> &ManagedSocket {
        &self.inner.socket
    }

    /// 以本连接的地址对整形错误。
    pub(crate) fn error(&self, op: Op, err: io::Error) -> VsockError {
        op_error(op, err, self.local(), self.peer())
    }

    fn set(&self, kind: DeadlineKind, deadline: Option<Instant>) -> Result<(), VsockError> {
        self.inner
            .socket
            .set_deadline(kind, deadline)
            .map_err(|err| self.error(Op::Set, err))
    }

    fn local(&self) -> Option<VsockAddr> {
        Some(self.inner.local_addr)
    }

    fn peer(&self) -> Option<VsockAddr> {
        Some(self.inner.peer_addr)
    }
}

//! vsock 错误分类器。
//!
//! # 教案级说明
//! - **Why**：系统调用返回的裸 errno 对调用方几乎没有诊断价值；本模块把它们与“哪个操作、
//!   哪对地址”合流为稳定的 [`VsockError`]，并把少数具有特殊语义的信号归一化。
//! - **How**：描述符层只产出 `std::io::Error`，端点层在返回前统一调用 [`classify`] /
//!   [`op_error`]，依据 [`Op`] 放置地址并归一化原因。
//! - **What**：
//!   - 对端断开（`ENOTCONN`）→ 流结束，`read` 会把它呈现为 `Ok(0)`；
//!   - 已关闭描述符（`EBADF`、内部关闭标记、或消息包含 "use of closed"）→ [`Cause::Closed`]；
//!   - 截止时间到期 → [`Cause::TimedOut`]；
//!   - 其余原因原样透传于 [`Cause::Io`]。

use std::{error::Error as StdError, fmt, io, path::PathBuf};

use thiserror::Error;

use crate::addr::{NETWORK, VsockAddr};

/// 产生错误的操作标签。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Accept,
    Close,
    Dial,
    Listen,
    RawControl,
    RawRead,
    RawWrite,
    Read,
    Set,
    SyscallConn,
    Write,
}

impl Op {
    /// 错误渲染使用的稳定标签。
    pub const fn as_str(self) -> &'static str {
        match self {
            Op::Accept => "accept",
            Op::Close => "close",
            Op::Dial => "dial",
            Op::Listen => "listen",
            Op::RawControl => "raw-control",
            Op::RawRead => "raw-read",
            Op::RawWrite => "raw-write",
            Op::Read => "read",
            Op::Set => "set",
            Op::SyscallConn => "syscall-conn",
            Op::Write => "write",
        }
    }

    /// 该操作的错误是否以“本地 → 对端”形式报告地址。
    ///
    /// 为 `false` 时只报告本地地址（对端尚未知或与操作无关）。
    pub const fn reports_peer(self) -> bool {
        matches!(
            self,
            Op::Close | Op::Dial | Op::RawRead | Op::RawWrite | Op::Read | Op::Write
        )
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 归一化后的底层原因。
#[derive(Debug, Error)]
pub enum Cause {
    /// 在已关闭的端点上执行操作。
    #[error("use of closed network connection")]
    Closed,
    /// 截止时间已到。
    #[error("i/o timeout")]
    TimedOut,
    /// 对端已关闭写方向；仅出现在 `read` 以外的操作上。
    #[error("EOF")]
    EndOfStream,
    /// vsock 设备访问失败，保留设备路径便于排障。
    #[error("{}: {source}", .path.display())]
    Device { path: PathBuf, source: io::Error },
    /// 未被归一化的系统错误。
    #[error(transparent)]
    Io(io::Error),
}

/// 规范错误：操作标签 + 网络名 + 地址 + 原因。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 所有失败在抵达调用方之前都被整形为同一种值，日志与上层重试逻辑无需再解析 errno；
/// - 携带地址上下文，诊断时无需重新推导端点信息。
///
/// ## 契约（What）
/// - `dial`/`close`/`read`/`write`/`raw-read`/`raw-write`：`source_addr` 为本地地址，
///   `addr` 为对端地址（若已知）；
/// - `accept`/`listen`/`raw-control`/`set`/`syscall-conn`：仅 `addr` 携带本地地址；
/// - 构造后不可变。
///
/// ## 渲染（How）
/// - `"<op> vsock <source>-><addr>: <cause>"`，缺失的地址段被省略。
#[derive(Debug)]
pub struct VsockError {
    op: Op,
    source_addr: Option<VsockAddr>,
    addr: Option<VsockAddr>,
    cause: Cause,
}

impl VsockError {
    /// 依据操作标签放置地址并构造错误。
    pub fn new(op: Op, cause: Cause, local: Option<VsockAddr>, remote: Option<VsockAddr>) -> Self {
        let (source_addr, addr) = if op.reports_peer() {
            (local, remote)
        } else {
            (None, local)
        };
        Self {
            op,
            source_addr,
            addr,
            cause,
        }
    }

    /// 操作标签。
    pub fn op(&self) -> Op {
        self.op
    }

    /// 网络名，恒为 `"vsock"`。
    pub fn net(&self) -> &'static str {
        NETWORK
    }

    /// 源地址（仅对报告对端的操作有值）。
    pub fn source_addr(&self) -> Option<VsockAddr> {
        self.source_addr
    }

    /// 目标地址；对只报告本地地址的操作即为本地地址。
    pub fn addr(&self) -> Option<VsockAddr> {
        self.addr
    }

    /// 归一化原因。
    pub fn cause(&self) -> &Cause {
        &self.cause
    }

    /// 取出归一化原因。
    pub fn into_cause(self) -> Cause {
        self.cause
    }

    /// 是否为“使用已关闭连接”。
    pub fn is_closed(&self) -> bool {
        matches!(self.cause, Cause::Closed)
    }

    /// 是否为流结束。
    pub fn is_eof(&self) -> bool {
        matches!(self.cause, Cause::EndOfStream)
    }

    /// 是否为超时类错误：截止时间到期，或系统报告的超时/暂不可用。
    pub fn is_timeout(&self) -> bool {
        match &self.cause {
            Cause::TimedOut => true,
            Cause::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// 是否为暂时性错误，可在短暂等待后重试。
    ///
    /// 包含超时类错误，以及 `EINTR`、`EMFILE`、`ENFILE`。
    pub fn is_temporary(&self) -> bool {
        if self.is_timeout() {
            return true;
        }
        match &self.cause {
            Cause::Io(err) => {
                err.kind() == io::ErrorKind::Interrupted || errno::is_descriptor_exhaustion(err)
            }
            _ => false,
        }
    }

    /// 底层 errno（若存在）。
    pub fn raw_os_error(&self) -> Option<i32> {
        match &self.cause {
            Cause::Io(err) | Cause::Device { source: err, .. } => err.raw_os_error(),
            _ => None,
        }
    }
}

impl fmt::Display for VsockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op, NETWORK)?;
        if let Some(source) = &self.source_addr {
            write!(f, " {source}")?;
        }
        if let Some(addr) = &self.addr {
            let sep = if self.source_addr.is_some() { "->" } else { " " };
            write!(f, "{sep}{addr}")?;
        }
        write!(f, ": {}", self.cause)
    }
}

impl StdError for VsockError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.cause)
    }
}

impl From<VsockError> for io::Error {
    fn from(err: VsockError) -> Self {
        let kind = match &err.cause {
            Cause::Closed => io::ErrorKind::NotConnected,
            Cause::TimedOut => io::ErrorKind::TimedOut,
            Cause::EndOfStream => io::ErrorKind::UnexpectedEof,
            Cause::Device { source, .. } => source.kind(),
            Cause::Io(inner) => inner.kind(),
        };
        io::Error::new(kind, err)
    }
}

/// 描述符层的关闭标记，由分类器识别为 [`Cause::Closed`]。
#[derive(Debug, Error)]
#[error("use of closed network connection")]
pub(crate) struct DescriptorClosed;

/// 描述符层的截止标记，由分类器识别为 [`Cause::TimedOut`]。
#[derive(Debug, Error)]
#[error("i/o timeout")]
pub(crate) struct DeadlineExceeded;

pub(crate) fn closed_io() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, DescriptorClosed)
}

pub(crate) fn deadline_io() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, DeadlineExceeded)
}

/// 分类结果：流结束不是错误，交由调用方决定如何呈现。
#[derive(Debug)]
pub(crate) enum Classified {
    EndOfStream,
    Error(VsockError),
}

/// 把底层 IO 错误整形为规范错误。
pub(crate) fn classify(
    op: Op,
    err: io::Error,
    local: Option<VsockAddr>,
    remote: Option<VsockAddr>,
) -> Classified {
    match normalize(err) {
        Cause::EndOfStream => Classified::EndOfStream,
        cause => Classified::Error(VsockError::new(op, cause, local, remote)),
    }
}

/// 与 [`classify`] 相同，但把流结束也作为错误返回。
pub(crate) fn op_error(
    op: Op,
    err: io::Error,
    local: Option<VsockAddr>,
    remote: Option<VsockAddr>,
) -> VsockError {
    match classify(op, err, local, remote) {
        Classified::EndOfStream => VsockError::new(op, Cause::EndOfStream, local, remote),
        Classified::Error(err) => err,
    }
}

fn normalize(err: io::Error) -> Cause {
    if let Some(inner) = err.get_ref() {
        if inner.is::<DeadlineExceeded>() {
            return Cause::TimedOut;
        }
        if inner.is::<DescriptorClosed>() {
            return Cause::Closed;
        }
    }
    if errno::is_not_connected(&err) {
        return Cause::EndOfStream;
    }
    if errno::is_bad_descriptor(&err) || err.to_string().contains("use of closed") {
        return Cause::Closed;
    }
    Cause::Io(err)
}

#[cfg(target_os = "linux")]
mod errno {
    use nix::errno::Errno;
    use std::io;

    fn is(err: &io::Error, errno: Errno) -> bool {
        err.raw_os_error() == Some(errno as i32)
    }

    pub(super) fn is_not_connected(err: &io::Error) -> bool {
        is(err, Errno::ENOTCONN)
    }

    pub(super) fn is_bad_descriptor(err: &io::Error) -> bool {
        is(err, Errno::EBADF)
    }

    pub(super) fn is_descriptor_exhaustion(err: &io::Error) -> bool {
        is(err, Errno::EMFILE) || is(err, Errno::ENFILE)
    }
}

#[cfg(not(target_os = "linux"))]
mod errno {
    use std::io;

    pub(super) fn is_not_connected(err: &io::Error) -> bool {
        err.kind() == io::ErrorKind::NotConnected
    }

    pub(super) fn is_bad_descriptor(_err: &io::Error) -> bool {
        false
    }

    pub(super) fn is_descriptor_exhaustion(_err: &io::Error) -> bool {
        false
    }
}

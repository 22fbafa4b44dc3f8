//! vsock 描述符的两阶段生命周期。
//!
//! # 教案级说明
//!
//! ## 意图（Why）
//! - 地址绑定（`bind`+`listen` 或 `connect`）必须在简单、同步的阻塞描述符上完成；
//! - 面向调用方的读写与接受则必须可被截止时间与并发关闭打断，只能在接入就绪通知的
//!   非阻塞模式下实现。两阶段混用或漏掉转换是这一层最致命的错误类别。
//!
//! ## 逻辑（How）
//! - [`RawSocket`]：刚创建的阻塞描述符，只提供绑定类系统调用；[`RawSocket::into_managed`]
//!   与 [`RawSocket::early_close`] 都按值消耗自身，于是“转换恰好一次”“提前释放至多一次且
//!   不能在转换之后”都由所有权在编译期保证；
//! - [`ManagedSocket`]：注册到 Tokio 反应器的 `AsyncFd<OwnedFd>`，外加一个 `watch` 通道
//!   广播 `{closed, read_deadline, write_deadline}`。每个挂起点同时等待“就绪 / 截止 / 状态变化”，
//!   任一先到即返回，因此另一个任务的 `close` 或截止时间调整能立刻唤醒阻塞中的操作。
//!
//! ## 契约（What）
//! - 本层只产出 `std::io::Error`；关闭与截止使用 [`crate::error`] 中的内部标记，
//!   由分类器归一化；
//! - 进程级 fork 锁是唯一的全局可变状态，仅在 `SOCK_CLOEXEC` 不被接受时的回退路径上持有。

use std::{
    io,
    os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd},
    sync::{Arc, Mutex, PoisonError, RwLock, RwLockWriteGuard},
    time::Instant,
};

use nix::{
    errno::Errno,
    fcntl::{FcntlArg, FdFlag, OFlag, fcntl},
    libc,
    sys::socket::{self, AddressFamily, Backlog, SockFlag, SockType},
};
use socket2::SockRef;
use tokio::{
    io::{Interest, unix::AsyncFd},
    sync::watch,
    time,
};
use tracing::{debug, trace, warn};

use crate::{
    addr::VsockAddr,
    error::{closed_io, deadline_io},
    retry::{RetryClass, accept_syscall_class},
};

static FORK_LOCK: RwLock<()> = RwLock::new(());

/// 获取进程级 fork 锁的写端。
///
/// 派生子进程的代码可持有该守卫，以排除“描述符已创建但尚未设置 close-on-exec”的窗口；
/// 描述符创建的回退路径持有读端，多个任务可以并发创建。
pub fn fork_lock() -> RwLockWriteGuard<'static, ()> {
    FORK_LOCK.write().unwrap_or_else(PoisonError::into_inner)
}

/// 创建 `AF_VSOCK`/`SOCK_STREAM` 描述符，并保证 close-on-exec。
fn create_socket() -> io::Result<OwnedFd> {
    match socket::socket(
        AddressFamily::Vsock,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    ) {
        Ok(fd) => Ok(fd),
        Err(Errno::EINVAL) => {
            // 内核不接受组合标志：非原子地补设 FD_CLOEXEC，期间排除 fork。
            let _guard = FORK_LOCK.read().unwrap_or_else(PoisonError::into_inner);
            let fd = socket::socket(AddressFamily::Vsock, SockType::Stream, SockFlag::empty(), None)?;
            fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
            trace!(fd = fd.as_raw_fd(), "created vsock descriptor via cloexec fallback");
            Ok(fd)
        }
        Err(errno) => Err(errno.into()),
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// 阻塞阶段的描述符。
#[derive(Debug)]
pub(crate) struct RawSocket {
    fd: OwnedFd,
}

impl RawSocket {
    /// 创建新的 vsock 描述符。
    pub(crate) fn new() -> io::Result<Self> {
        create_socket().map(Self::from_owned)
    }

    /// 接管已有描述符（`accept4` 产出的连接等）。
    pub(crate) fn from_owned(fd: OwnedFd) -> Self {
        Self { fd }
    }

    pub(crate) fn bind(&self, addr: VsockAddr) -> io::Result<()> {
        let addr = socket::VsockAddr::from(addr);
        socket::bind(self.fd.as_raw_fd(), &addr)?;
        Ok(())
    }

    /// `backlog` 为 `None` 时使用平台最大值。
    pub(crate) fn listen(&self, backlog: Option<i32>) -> io::Result<()> {
        let backlog = match backlog {
            Some(len) => Backlog::new(len)?,
            None => Backlog::MAXCONN,
        };
        socket::listen(&self.fd, backlog)?;
        Ok(())
    }

    pub(crate) fn connect(&self, addr: VsockAddr) -> io::Result<()> {
        let addr = socket::VsockAddr::from(addr);
        socket::connect(self.fd.as_raw_fd(), &addr)?;
        Ok(())
    }

    /// 读取内核分配的本地地址。
    pub(crate) fn local_addr(&self) -> io::Result<VsockAddr> {
        let addr = socket::getsockname::<socket::VsockAddr>(self.fd.as_raw_fd())?;
        Ok(addr.into())
    }

    /// 设置阶段失败时释放描述符。消耗自身，因此至多调用一次，且无法在转换后调用。
    pub(crate) fn early_close(self) -> io::Result<()> {
        let fd = self.fd.into_raw_fd();
        debug!(fd, "releasing raw vsock descriptor after setup failure");
        nix::unistd::close(fd).map_err(|errno| {
            warn!(fd, error = %errno, "failed to release raw vsock descriptor");
            io::Error::from(errno)
        })
    }

    /// 一次性切换到非阻塞、接入就绪通知的托管阶段。
    ///
    /// 失败时描述符已被释放。
    pub(crate) fn into_managed(self, name: impl Into<String>) -> io::Result<ManagedSocket> {
        if let Err(err) = set_nonblocking(&self.fd) {
            let _ = self.early_close();
            return Err(err);
        }
        let registered =
            match AsyncFd::try_with_interest(self.fd, Interest::READABLE | Interest::WRITABLE) {
                Ok(registered) => registered,
                Err(err) => {
                    let (fd, err) = err.into_parts();
                    let _ = RawSocket::from_owned(fd).early_close();
                    return Err(err);
                }
            };
        let name = name.into();
        trace!(fd = registered.as_raw_fd(), name = %name, "vsock descriptor now managed");
        Ok(ManagedSocket {
            name,
            handle: Mutex::new(Some(Arc::new(registered))),
            state: watch::Sender::new(DescriptorState::default()),
        })
    }
}

/// 截止时间作用的方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DeadlineKind {
    Both,
    Read,
    Write,
}

/// 挂起点等待的就绪方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

impl Direction {
    fn interest(self) -> Interest {
        match self {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct DescriptorState {
    closed: bool,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
}

impl DescriptorState {
    fn deadline(&self, direction: Direction) -> Option<Instant> {
        match direction {
            Direction::Read => self.read_deadline,
            Direction::Write => self.write_deadline,
        }
    }
}

/// 托管阶段的描述符。
///
/// 所有方法都接收 `&self`：一个任务阻塞在读写/接受中时，另一个任务可以调整截止时间或关闭。
#[derive(Debug)]
pub(crate) struct ManagedSocket {
    name: String,
    handle: Mutex<Option<Arc<AsyncFd<OwnedFd>>>>,
    state: watch::Sender<DescriptorState>,
}

impl ManagedSocket {
    fn handle(&self) -> io::Result<Arc<AsyncFd<OwnedFd>>> {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(closed_io)
    }

    /// 等待 `direction` 就绪后执行 `op`，直到它不再返回 `WouldBlock`。
    ///
    /// 截止时间到期、描述符被关闭时立即返回对应标记错误；截止时间被改写时重新评估。
    async fn wait_io<R>(
        &self,
        direction: Direction,
        mut op: impl FnMut(RawFd) -> io::Result<R>,
    ) -> io::Result<R> {
        let handle = self.handle()?;
        let mut state = self.state.subscribe();
        loop {
            let deadline = {
                let current = state.borrow_and_update();
                if current.closed {
                    return Err(closed_io());
                }
                current.deadline(direction)
            };
            if deadline.is_some_and(|deadline| deadline <= Instant::now()) {
                return Err(deadline_io());
            }

            tokio::select! {
                biased;
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(closed_io());
                    }
                }
                _ = sleep_until(deadline) => return Err(deadline_io()),
                ready = handle.ready(direction.interest()) => {
                    let mut guard = ready?;
                    match guard.try_io(|io| op(io.as_raw_fd())) {
                        Ok(result) => return result,
                        Err(_would_block) => continue,
                    }
                }
            }
        }
    }

    pub(crate) async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.wait_io(Direction::Read, |fd| {
            // SAFETY: `buf` 在调用期间独占且长度与指针一致。
            let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        })
        .await
    }

    pub(crate) async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.wait_io(Direction::Write, |fd| {
            // SAFETY: `buf` 在调用期间有效；MSG_NOSIGNAL 避免对端关闭时触发 SIGPIPE。
            let n = unsafe {
                libc::send(fd, buf.as_ptr().cast(), buf.len(), libc::MSG_NOSIGNAL)
            };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        })
        .await
    }

    /// 在监听描述符上接受一个连接，返回新的阻塞阶段描述符与对端地址。
    ///
    /// 暂无待接受连接与连接在接受前被中止都属于瞬时条件，不会返回给调用方。
    pub(crate) async fn accept(&self) -> io::Result<(RawSocket, VsockAddr)> {
        self.wait_io(Direction::Read, |fd| loop {
            match socket::accept4(fd, SockFlag::SOCK_CLOEXEC) {
                Ok(conn) => {
                    // SAFETY: `accept4` 刚返回的描述符由本函数独占。
                    let conn = unsafe { OwnedFd::from_raw_fd(conn) };
                    let peer = socket::getpeername::<socket::VsockAddr>(conn.as_raw_fd())?;
                    return Ok((RawSocket::from_owned(conn), peer.into()));
                }
                Err(errno) => {
                    let err = io::Error::from(errno);
                    match accept_syscall_class(&err) {
                        // WouldBlock 交回 try_io，以便清除就绪状态后重新等待。
                        RetryClass::Immediately if err.kind() != io::ErrorKind::WouldBlock => {
                            trace!(fd, error = %err, "transient accept condition, retrying");
                        }
                        _ => return Err(err),
                    }
                }
            }
        })
        .await
    }

    /// 半关闭。
    pub(crate) fn shutdown(&self, how: std::net::Shutdown) -> io::Result<()> {
        let handle = self.handle()?;
        SockRef::from(handle.get_ref()).shutdown(how)
    }

    /// 设置截止时间；`None` 清除限制。已关闭时返回关闭标记。
    pub(crate) fn set_deadline(&self, kind: DeadlineKind, deadline: Option<Instant>) -> io::Result<()> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| {
            if state.closed {
                result = Err(closed_io());
                return false;
            }
            match kind {
                DeadlineKind::Both => {
                    state.read_deadline = deadline;
                    state.write_deadline = deadline;
                }
                DeadlineKind::Read => state.read_deadline = deadline,
                DeadlineKind::Write => state.write_deadline = deadline,
            }
            true
        });
        result
    }

    /// 把描述符交给同步回调。
    pub(crate) fn control<R>(&self, f: impl FnOnce(RawFd) -> R) -> io::Result<R> {
        let handle = self.handle()?;
        Ok(f(handle.as_raw_fd()))
    }

    /// 反复调用 `f` 直到其返回 `true`，两次调用之间等待 `direction` 就绪。
    pub(crate) async fn raw_io(
        &self,
        direction: Direction,
        mut f: impl FnMut(RawFd) -> bool,
    ) -> io::Result<()> {
        self.wait_io(direction, |fd| {
            if f(fd) {
                Ok(())
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            }
        })
        .await
    }

    /// 终止释放：标记关闭、唤醒所有挂起的操作并释放描述符。
    ///
    /// 若仍有在途操作持有句柄，描述符在其退出时释放；重复关闭返回关闭标记。
    pub(crate) fn close(&self) -> io::Result<()> {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(closed_io)?;
        self.state.send_modify(|state| state.closed = true);
        match Arc::try_unwrap(handle) {
            Ok(registered) => {
                let fd = registered.into_inner().into_raw_fd();
                debug!(fd, name = %self.name, "closed vsock descriptor");
                nix::unistd::close(fd).map_err(io::Error::from)
            }
            Err(shared) => {
                debug!(
                    fd = shared.as_raw_fd(),
                    name = %self.name,
                    "vsock descriptor closed, release deferred to in-flight operation"
                );
                Ok(())
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

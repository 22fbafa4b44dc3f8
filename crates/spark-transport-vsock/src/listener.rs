use std::{future::Future, io, time::Instant};

use tracing::debug;

use crate::{
    addr::{PORT_ANY, VsockAddr},
    cid::{ContextIdSource, DeviceContextId},
    conn::VsockStream,
    error::{Op, VsockError, op_error},
    fd::{DeadlineKind, ManagedSocket, RawSocket},
    options::ListenOptions,
    util::Acceptor,
};

/// 托管监听描述符的调试名。
const LISTEN_HANDLE_NAME: &str = "vsock-listen";

/// vsock 流监听器。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 在本机上下文 ID 上开放一个端口，接受来自宿主机或虚拟机的连接；
/// - `accept` 可被截止时间与并发 `close` 打断，监听任务不会永久挂起。
///
/// ## 逻辑 (How)
/// - `bind`：探测本机上下文 ID（或使用 [`ListenOptions`] 指定值），在原始阶段完成
///   `bind`、`listen` 与 `getsockname`，再切换到托管阶段；端口 `0` 在绑定前替换为
///   [`PORT_ANY`]，返回的地址已是内核分配的实际端口；
/// - `accept`：以 `SOCK_CLOEXEC` 接受连接，瞬时失败在内部重试，新连接的本地地址为监听地址。
///
/// ## 契约 (What)
/// - **前置条件**：调用方必须在 Tokio 运行时中使用该监听器；
/// - **错误语义**：探测阶段失败的错误不带地址；其后的绑定错误以请求的 `{cid, port}` 为 `addr`；
///   `accept`/`set` 错误以监听地址为 `addr`，`close` 错误以其为源地址。
#[derive(Debug)]
pub struct VsockListener {
    socket: ManagedSocket,
    local_addr: VsockAddr,
}

impl VsockListener {
    /// 在本机上下文 ID 的 `port` 上监听；`port` 为 `0` 时由内核分配。
    pub async fn bind(port: u32) -> Result<Self, VsockError> {
        Self::bind_with_options(port, ListenOptions::default()).await
    }

    /// 按给定选项监听。
    pub async fn bind_with_options(port: u32, options: ListenOptions) -> Result<Self, VsockError> {
        Self::bind_with_source(port, options, &DeviceContextId::default()).await
    }

    /// 未显式指定上下文 ID 时，由 `source` 提供本机上下文 ID。
    pub async fn bind_with_source(
        port: u32,
        options: ListenOptions,
        source: &impl ContextIdSource,
    ) -> Result<Self, VsockError> {
        let context_id = match options.context_id() {
            Some(context_id) => context_id,
            None => source
                .context_id()
                .map_err(|err| VsockError::new(Op::Listen, err.into(), None, None))?,
        };
        let requested = VsockAddr::new(context_id, port);
        let listener = Self::listen_at(requested, options.backlog())
            .map_err(|err| op_error(Op::Listen, err, Some(requested), None))?;
        debug!(op = %Op::Listen, local = %listener.local_addr, "vsock listener bound");
        Ok(listener)
    }

    fn listen_at(requested: VsockAddr, backlog: Option<i32>) -> io::Result<Self> {
        let port = match requested.port() {
            0 => PORT_ANY,
            port => port,
        };
        let raw = RawSocket::new()?;
        let bound = raw
            .bind(VsockAddr::new(requested.context_id(), port))
            .and_then(|()| raw.listen(backlog))
            .and_then(|()| raw.local_addr());
        match bound {
            Ok(local_addr) => Self::from_raw(raw, local_addr),
            Err(err) => {
                let _ = raw.early_close();
                Err(err)
            }
        }
    }

    /// 以已进入监听状态的阻塞描述符构造监听器。
    pub(crate) fn from_raw(raw: RawSocket, local_addr: VsockAddr) -> io::Result<Self> {
        Ok(Self {
            socket: raw.into_managed(LISTEN_HANDLE_NAME)?,
            local_addr,
        })
    }

    /// 监听器实际绑定的地址。
    pub fn local_addr(&self) -> VsockAddr {
        self.local_addr
    }

    /// 接受一个入站连接。
    pub async fn accept(&self) -> Result<VsockStream, VsockError> {
        let (raw, peer_addr) = self
            .socket
            .accept()
            .await
            .map_err(|err| self.error(Op::Accept, err))?;
        let stream = VsockStream::from_raw(raw, self.local_addr, peer_addr)
            .map_err(|err| self.error(Op::Accept, err))?;
        debug!(op = %Op::Accept, local = %self.local_addr, remote = %peer_addr, "accepted vsock connection");
        Ok(stream)
    }

    /// 关闭监听器并唤醒阻塞中的 `accept`；重复关闭返回关闭错误。
    pub fn close(&self) -> Result<(), VsockError> {
        self.socket.close().map_err(|err| self.error(Op::Close, err))
    }

    /// 设置 `accept` 的截止时间；`None` 清除限制。
    pub fn set_deadline(&self, deadline: Option<Instant>) -> Result<(), VsockError> {
        self.socket
            .set_deadline(DeadlineKind::Both, deadline)
            .map_err(|err| self.error(Op::Set, err))
    }

    fn error(&self, op: Op, err: io::Error) -> VsockError {
        op_error(op, err, Some(self.local_addr), None)
    }
}

impl Acceptor for VsockListener {
    type Conn = VsockStream;

    fn accept(&self) -> impl Future<Output = Result<VsockStream, VsockError>> + Send {
        VsockListener::accept(self)
    }

    fn close(&self) -> Result<(), VsockError> {
        VsockListener::close(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid::ContextIdError;
    use std::{
        os::{fd::OwnedFd, linux::net::SocketAddrExt, unix::net::{SocketAddr, UnixListener}},
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    const LOCAL: VsockAddr = VsockAddr::new(3, 5000);

    /// 以抽象命名空间的 AF_UNIX 监听套接字驱动监听器状态机；从不实际接受连接。
    fn unix_listener() -> VsockListener {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let name = format!(
            "spark-vsock-listener-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        );
        let addr = SocketAddr::from_abstract_name(name.as_bytes()).expect("abstract name");
        let listener = UnixListener::bind_addr(&addr).expect("bind unix listener");
        let raw = RawSocket::from_owned(OwnedFd::from(listener));
        VsockListener::from_raw(raw, LOCAL).expect("manage")
    }

    struct NoDevice;

    impl ContextIdSource for NoDevice {
        fn context_id(&self) -> Result<u32, ContextIdError> {
            Err(ContextIdError::Ioctl(io::Error::from(
                io::ErrorKind::PermissionDenied,
            )))
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_unblocks_pending_accept() {
        let listener = Arc::new(unix_listener());
        let acceptor = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.accept().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        listener.close().expect("close");

        let err = tokio::time::timeout(Duration::from_secs(5), acceptor)
            .await
            .expect("accept must be woken")
            .expect("join")
            .expect_err("accept on closed listener");
        assert!(err.is_closed());
        assert_eq!(err.op(), Op::Accept);
        assert_eq!(err.source_addr(), None);
        assert_eq!(err.addr(), Some(LOCAL));
        assert_eq!(
            err.to_string(),
            "accept vsock vm(3):5000: use of closed network connection"
        );

        let err = listener.close().expect_err("second close");
        assert_eq!(err.op(), Op::Close);
        assert_eq!(err.source_addr(), Some(LOCAL));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deadline_bounds_accept() {
        let listener = unix_listener();
        listener
            .set_deadline(Some(Instant::now() - Duration::from_millis(1)))
            .expect("set");
        let err = listener.accept().await.expect_err("past deadline");
        assert!(err.is_timeout());
        assert!(err.is_temporary());

        listener
            .set_deadline(Some(Instant::now() + Duration::from_millis(50)))
            .expect("set");
        let started = Instant::now();
        let err = listener.accept().await.expect_err("future deadline");
        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(40));

        listener.close().expect("close");
        let err = listener.set_deadline(None).expect_err("closed");
        assert_eq!(err.op(), Op::Set);
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn discovery_failure_is_reported_without_addresses() {
        let err = VsockListener::bind_with_source(1024, ListenOptions::default(), &NoDevice)
            .await
            .expect_err("discovery fails");
        assert_eq!(err.op(), Op::Listen);
        assert_eq!(err.source_addr(), None);
        assert_eq!(err.addr(), None);
        assert!(err.to_string().starts_with("listen vsock: "));
    }
}

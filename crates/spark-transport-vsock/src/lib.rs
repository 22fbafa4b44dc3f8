#![doc = r#"
# spark-transport-vsock

## 设计动机（Why）
- **定位**：该 crate 提供 Spark 在 Tokio 运行时上的 vsock（`AF_VSOCK`）流传输实现，
  承载宿主机与虚拟机之间不经过 IP 网络的通信。
- **架构角色**：与 `spark-transport-tcp` 并列的传输实现层积木，呈现同样的
  “监听 → 接受 / 拨号 → 读写 → 半关闭 → 关闭”生命周期，并以结构化错误报告失败。
- **设计理念**：强调“两阶段描述符”与“错误分类”：绑定类系统调用只在阻塞阶段执行，
  面向调用方的操作只在接入就绪通知的托管阶段执行；所有失败在返回前整形为
  [`VsockError`]。

## 核心契约（What）
- **输入条件**：调用方必须在 Tokio 运行时中使用本实现；仅 Linux 提供 IO 能力；
- **输出保障**：连接与监听器的所有操作均可被截止时间与并发 `close` 打断；
  `read` 以 `Ok(0)` 表示流结束；错误携带操作标签、网络名与按操作放置的地址；
- **全局状态**：仅有进程级 fork 锁（见 [`fork_lock`]），用于描述符创建的回退路径。

## 实现策略（How）
- **执行框架**：托管描述符是 `tokio::io::unix::AsyncFd<OwnedFd>`，所有挂起点在
  就绪、截止时间与关闭广播三者之间 `select!`；
- **系统调用**：`nix` 提供 `socket`/`bind`/`listen`/`connect`/`accept4`/`ioctl`，
  `socket2::SockRef` 负责半关闭；
- **重试策略**：`accept4` 的瞬时失败与 [`accept_with_timeout`] 的暂时性错误都由
  [`retry`] 模块的数据化分类驱动。

## 风险与考量（Trade-offs）
- **拨号阻塞**：`connect` 在原始阶段以阻塞方式执行，因此被派发到 Tokio 阻塞线程池；
  拨号本身不受截止时间约束。
- **关闭与在途操作**：`close` 立即唤醒所有挂起的操作；若仍有操作持有句柄，
  描述符在其退出时释放。
"#]

mod addr;
mod error;
mod options;
pub mod retry;
mod util;

#[cfg(target_os = "linux")]
mod cid;
#[cfg(target_os = "linux")]
mod conn;
#[cfg(target_os = "linux")]
mod fd;
#[cfg(target_os = "linux")]
mod listener;
#[cfg(target_os = "linux")]
mod raw;

pub use addr::{CID_ANY, ContextRole, HOST, HYPERVISOR, NETWORK, PORT_ANY, RESERVED, VsockAddr};
pub use error::{Cause, Op, VsockError};
pub use options::{AcceptRetry, ListenOptions};
pub use util::{Acceptor, accept_with_timeout, accept_with_timeout_and_retry};

#[cfg(target_os = "linux")]
pub use cid::{
    ContextIdError, ContextIdSource, DEV_VSOCK, DeviceContextId, is_hypervisor,
    is_hypervisor_with, local_context_id,
};
#[cfg(target_os = "linux")]
pub use conn::VsockStream;
#[cfg(target_os = "linux")]
pub use fd::fork_lock;
#[cfg(target_os = "linux")]
pub use listener::VsockListener;
#[cfg(target_os = "linux")]
pub use raw::RawConn;

/// 在本机上下文 ID 的 `port` 上监听；`port` 为 `0` 时由内核分配。
#[cfg(target_os = "linux")]
pub async fn listen(port: u32) -> Result<VsockListener, VsockError> {
    VsockListener::bind(port).await
}

/// 连接到 `{context_id, port}`。
#[cfg(target_os = "linux")]
pub async fn dial(context_id: u32, port: u32) -> Result<VsockStream, VsockError> {
    VsockStream::connect(context_id, port).await
}

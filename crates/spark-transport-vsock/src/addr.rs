use core::fmt;

/// vsock 网络名，出现在错误包络与调试句柄名中。
pub const NETWORK: &str = "vsock";

/// 与 Hypervisor 进程通信的上下文 ID。
pub const HYPERVISOR: u32 = 0x0;

/// 已废弃的保留上下文 ID，不能作为存活套接字的目标。
///
/// 仅作为文档常量暴露；传入 `dial`/`listen` 时不会被本 crate 拦截，
/// 而是交由内核拒绝。
pub const RESERVED: u32 = 0x1;

/// 与宿主机上 Hypervisor 以外进程通信的上下文 ID。
pub const HOST: u32 = 0x2;

/// 绑定时表示“任意本地上下文 ID”。
pub const CID_ANY: u32 = u32::MAX;

/// 绑定时表示“由内核分配临时端口”。
pub const PORT_ANY: u32 = u32::MAX;

/// 上下文 ID 的角色分类，仅用于渲染，不参与任何行为分支。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContextRole {
    /// `0`：Hypervisor。
    Hypervisor,
    /// `1`：保留值。
    Reserved,
    /// `2`：宿主机。
    Host,
    /// 其余取值：虚拟机。
    Vm,
}

impl ContextRole {
    /// 根据上下文 ID 取值分类。
    pub const fn of(context_id: u32) -> Self {
        match context_id {
            HYPERVISOR => Self::Hypervisor,
            RESERVED => Self::Reserved,
            HOST => Self::Host,
            _ => Self::Vm,
        }
    }

    /// 渲染用的角色名。
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hypervisor => "hypervisor",
            Self::Reserved => "reserved",
            Self::Host => "host",
            Self::Vm => "vm",
        }
    }
}

impl fmt::Display for ContextRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// vsock 端点地址：上下文 ID + 端口。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 与 `TransportSocketAddr` 在 IP 传输中的角色一致，为连接、监听器与错误包络提供
///   统一、不可变的地址表达；
/// - 渲染格式 `<role>(<cid>):<port>` 让日志一眼区分 Hypervisor、宿主机与虚拟机。
///
/// ## 契约（What）
/// - 构造后不可变，`Copy` 语义，随所属端点一同销毁；
/// - [`role`](Self::role) 仅是描述性分类：保留 ID 依旧可以被构造并交给内核，由系统调用失败；
/// - [`file_name`](Self::file_name) 用于命名非阻塞句柄，格式为 `vsock:<Display>`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VsockAddr {
    context_id: u32,
    port: u32,
}

impl VsockAddr {
    /// 构造地址。
    pub const fn new(context_id: u32, port: u32) -> Self {
        Self { context_id, port }
    }

    /// 上下文 ID。
    pub const fn context_id(&self) -> u32 {
        self.context_id
    }

    /// 端口。
    pub const fn port(&self) -> u32 {
        self.port
    }

    /// 上下文 ID 的角色分类。
    pub const fn role(&self) -> ContextRole {
        ContextRole::of(self.context_id)
    }

    /// 网络名，恒为 `"vsock"`。
    pub const fn network(&self) -> &'static str {
        NETWORK
    }

    /// 托管句柄的调试名：网络名与地址串的拼接。
    pub fn file_name(&self) -> String {
        format!("{}:{}", NETWORK, self)
    }
}

impl fmt::Display for VsockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}):{}", self.role(), self.context_id, self.port)
    }
}

#[cfg(target_os = "linux")]
impl From<nix::sys::socket::VsockAddr> for VsockAddr {
    fn from(addr: nix::sys::socket::VsockAddr) -> Self {
        Self::new(addr.cid(), addr.port())
    }
}

#[cfg(target_os = "linux")]
impl From<VsockAddr> for nix::sys::socket::VsockAddr {
    fn from(addr: VsockAddr) -> Self {
        nix::sys::socket::VsockAddr::new(addr.context_id, addr.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn well_known_context_ids_render_with_role() {
        assert_eq!(VsockAddr::new(HYPERVISOR, 1024).to_string(), "hypervisor(0):1024");
        assert_eq!(VsockAddr::new(RESERVED, 7).to_string(), "reserved(1):7");
        assert_eq!(VsockAddr::new(HOST, 22).to_string(), "host(2):22");
        assert_eq!(VsockAddr::new(3, 5000).to_string(), "vm(3):5000");
    }

    #[test]
    fn file_name_prefixes_network() {
        let addr = VsockAddr::new(HOST, 80);
        assert_eq!(addr.file_name(), "vsock:host(2):80");
        assert_eq!(addr.network(), "vsock");
    }

    proptest! {
        /// 任意地址的渲染都包含上下文 ID 与端口，且角色只取决于上下文 ID。
        #[test]
        fn display_contains_context_id_and_port(cid in any::<u32>(), port in any::<u32>()) {
            let rendered = VsockAddr::new(cid, port).to_string();
            let role = ContextRole::of(cid).as_str();
            prop_assert_eq!(rendered, format!("{role}({cid}):{port}"));
            if cid > HOST {
                prop_assert_eq!(ContextRole::of(cid), ContextRole::Vm);
            }
        }
    }
}

//! 本机上下文 ID 探测。
//!
//! 真正的查询由 vsock 设备的 `IOCTL_VM_SOCKETS_GET_LOCAL_CID` 完成；本模块只定义协作者契约
//! [`ContextIdSource`] 与基于设备的默认实现，并在其上构建 [`is_hypervisor`]。

use std::{
    fs::File,
    io,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::debug;

use crate::{addr::HOST, error::Cause};

/// vsock 设备路径，在 Hypervisor 与虚拟机上均存在。
pub const DEV_VSOCK: &str = "/dev/vsock";

// IOCTL_VM_SOCKETS_GET_LOCAL_CID = _IO(7, 0xb9)
nix::ioctl_read_bad!(vm_sockets_get_local_cid, 0x7b9, u32);

/// 上下文 ID 探测失败。
#[derive(Debug, Error)]
pub enum ContextIdError {
    /// 设备不存在或无权访问。
    #[error("{}: {source}", .path.display())]
    Device { path: PathBuf, source: io::Error },
    /// 设备拒绝查询请求。
    #[error("IOCTL_VM_SOCKETS_GET_LOCAL_CID: {0}")]
    Ioctl(#[source] io::Error),
}

/// 只有 vsock 设备本身的访问失败保留路径；其他路径退化为裸 IO 原因。
impl From<ContextIdError> for Cause {
    fn from(err: ContextIdError) -> Self {
        match err {
            ContextIdError::Device { path, source } if path == Path::new(DEV_VSOCK) => {
                Cause::Device { path, source }
            }
            ContextIdError::Device { source, .. } | ContextIdError::Ioctl(source) => {
                Cause::Io(source)
            }
        }
    }
}

/// 上下文 ID 来源（外部协作者契约）。
///
/// 返回调用方所在环境的 vsock 上下文 ID；不具备 vsock 能力时返回错误。
pub trait ContextIdSource {
    fn context_id(&self) -> Result<u32, ContextIdError>;
}

/// 通过 vsock 设备查询上下文 ID。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceContextId {
    path: PathBuf,
}

impl DeviceContextId {
    /// 使用指定设备路径。
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// 设备路径。
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for DeviceContextId {
    fn default() -> Self {
        Self::new(DEV_VSOCK)
    }
}

impl ContextIdSource for DeviceContextId {
    fn context_id(&self) -> Result<u32, ContextIdError> {
        let device = File::open(&self.path).map_err(|source| ContextIdError::Device {
            path: self.path.clone(),
            source,
        })?;
        let mut cid: u32 = 0;
        // SAFETY: `device` 在调用期间保持打开，`cid` 是该 ioctl 期望的 u32 出参。
        unsafe { vm_sockets_get_local_cid(device.as_raw_fd(), &mut cid) }
            .map_err(|errno| ContextIdError::Ioctl(io::Error::from(errno)))?;
        debug!(cid, device = %self.path.display(), "resolved local vsock context id");
        Ok(cid)
    }
}

/// 通过默认设备查询本机上下文 ID。
pub fn local_context_id() -> Result<u32, ContextIdError> {
    DeviceContextId::default().context_id()
}

/// 判断本机是否为 Hypervisor（宿主机）。
///
/// 探测失败一律视为“不是”，不会向调用方传播错误。
pub fn is_hypervisor() -> bool {
    is_hypervisor_with(&DeviceContextId::default())
}

/// 使用给定来源判断本机是否为宿主机。
pub fn is_hypervisor_with(source: &impl ContextIdSource) -> bool {
    match source.context_id() {
        Ok(cid) => cid == HOST,
        Err(err) => {
            debug!(error = %err, "context id discovery failed, assuming guest");
            false
        }
    }
}

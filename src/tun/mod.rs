//! TUN 模块
//!
//! 支持 Linux (/dev/net/tun)、macOS (utun) 和 Windows (wintun.dll) 的虚拟网络设备
//!
//! ## 架构
//!
//! ```text
//! VirtualInterface.read -> DeviceAdapter -> read hooks (SrcProxy) -> 写回网卡 / 上层回调
//! 调用方 -> DeviceAdapter.write -> write hooks -> VirtualInterface.write
//! ```

pub mod adapter;
pub mod device;
pub mod flow;
pub mod hook;
pub mod netcfg;
pub mod packet;
pub mod src_proxy;

pub use adapter::{DeviceAdapter, DeviceStatus, PacketCallback};
pub use device::{create_platform_device, VirtualInterface};
pub use flow::{FlowEntry, FlowTable};
pub use hook::{HookAction, HookChain, HookFlags, HookLevel, PacketHook};
pub use netcfg::{NetConfigurator, NetRequest, Platform};
pub use packet::{Frame, PacketInfo};
pub use src_proxy::{SrcProxy, SrcProxyHook, Verdict};

//! 把经过 TUN 网卡的 TCP 连接透明地重定向到上游 SOCKS5 代理

pub mod config;
pub mod error;
pub mod proxy;
pub mod tun;
pub mod utils;

pub use config::{RouteItem, SetupInfo};
pub use error::{Error, Result};
pub use tun::{DeviceAdapter, DeviceStatus, PacketCallback};

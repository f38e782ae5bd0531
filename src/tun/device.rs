//! TUN 设备抽象层
//!
//! `VirtualInterface` 是每个平台网卡的统一接口，适配器只依赖这个 trait。
//! - Linux: /dev/net/tun (tun crate)
//! - macOS: utun (tun crate)
//! - Windows: wintun.dll (tun crate with wintun backend)

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{RouteItem, SetupInfo};
use crate::error::Result;

/// 虚拟网卡
///
/// 读写可以并发，写入在实现内部串行化。读到的帧可以带一个固定长度的平台前缀，
/// 长度由 `frame_prefix` 给出。
#[async_trait]
pub trait VirtualInterface: Send + Sync {
    fn name(&self) -> String;

    fn running(&self) -> bool;

    /// 每个帧前面的平台前缀长度
    fn frame_prefix(&self) -> usize {
        0
    }

    /// 创建并启动网卡，已经在运行时返回 `AlreadyExists`
    async fn setup(&self, info: &SetupInfo) -> Result<()>;

    async fn shutdown(&self);

    fn refresh(&self);

    fn set_mtu(&self, mtu: u16);

    fn add_route(&self, routes: &[RouteItem]);

    fn remove_route(&self, routes: &[RouteItem]);

    /// 读取一帧，返回 0 表示空读
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    async fn write(&self, frame: &[u8]) -> Result<()>;

    /// 网卡已启动且持有预期地址，仅供参考
    fn check_available(&self, reorder: bool) -> bool;
}

/// 按平台选择网卡实现
pub fn create_platform_device() -> Option<Arc<dyn VirtualInterface>> {
    platform_device()
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn platform_device() -> Option<Arc<dyn VirtualInterface>> {
    Some(Arc::new(tun_device::TunDevice::new()))
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn platform_device() -> Option<Arc<dyn VirtualInterface>> {
    None
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
pub use tun_device::TunDevice;

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
mod tun_device {
    use super::*;
    use crate::error::Error;
    use crate::tun::netcfg::{NetConfigurator, NetRequest, Platform};
    use crate::utils::prefix_to_netmask;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};

    /// 基于 tun crate 的网卡
    pub struct TunDevice {
        reader: tokio::sync::Mutex<Option<ReadHalf<tun::AsyncDevice>>>,
        writer: tokio::sync::Mutex<Option<WriteHalf<tun::AsyncDevice>>>,
        netcfg: Mutex<Option<NetConfigurator>>,
    }

    impl TunDevice {
        pub fn new() -> Self {
            Self {
                reader: tokio::sync::Mutex::new(None),
                writer: tokio::sync::Mutex::new(None),
                netcfg: Mutex::new(None),
            }
        }

        fn netcfg(&self) -> Option<NetConfigurator> {
            match self.netcfg.lock() {
                Ok(guard) => guard.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            }
        }

        fn set_netcfg(&self, value: Option<NetConfigurator>) {
            match self.netcfg.lock() {
                Ok(mut guard) => *guard = value,
                Err(poisoned) => *poisoned.into_inner() = value,
            }
        }

        fn create(info: &SetupInfo) -> Result<tun::AsyncDevice> {
            let mut tun_config = tun::Configuration::default();

            tun_config
                .address(info.address)
                .netmask(prefix_to_netmask(info.prefix_length))
                .mtu(info.mtu)
                .up();

            #[cfg(target_os = "linux")]
            {
                tun_config.platform_config(|p| {
                    p.ensure_root_privileges(true);
                });
            }

            #[cfg(target_os = "windows")]
            {
                let guid = uuid::Uuid::parse_str(&info.platform_id)?.as_u128();
                tun_config.platform_config(|p| {
                    p.device_guid(guid);
                });
            }

            // macOS 只接受 utunN
            #[cfg(not(target_os = "macos"))]
            #[allow(deprecated)]
            if !info.name.is_empty() {
                tun_config.tun_name(&info.name);
            }

            tun::create_as_async(&tun_config)
                .map_err(|e| Error::Tun(format!("Failed to create TUN device: {}", e)))
        }

        fn device_name(device: &tun::AsyncDevice, fallback: &str) -> String {
            use tun::AbstractDevice;
            device.tun_name().unwrap_or_else(|_| fallback.to_string())
        }
    }

    impl Default for TunDevice {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl VirtualInterface for TunDevice {
        fn name(&self) -> String {
            self.netcfg()
                .map(|c| c.name().to_string())
                .unwrap_or_default()
        }

        fn running(&self) -> bool {
            self.netcfg().is_some()
        }

        async fn setup(&self, info: &SetupInfo) -> Result<()> {
            if self.running() {
                return Err(Error::AlreadyExists);
            }

            let Some(platform) = Platform::current() else {
                return Err(Error::Unsupported(std::env::consts::OS.to_string()));
            };

            let device = Self::create(info)?;
            let name = Self::device_name(&device, &info.name);
            let (read_half, write_half) = tokio::io::split(device);

            *self.reader.lock().await = Some(read_half);
            *self.writer.lock().await = Some(write_half);
            self.set_netcfg(Some(NetConfigurator::new(platform, &name, info.address)));

            tracing::info!(
                "TUN device created: {} {}/{} mtu {}",
                name, info.address, info.prefix_length, info.mtu
            );
            Ok(())
        }

        async fn shutdown(&self) {
            let name = self.name();
            self.set_netcfg(None);

            // 丢弃句柄即关闭设备
            self.reader.lock().await.take();
            self.writer.lock().await.take();

            if !name.is_empty() {
                tracing::info!("Closing TUN device: {}", name);
            }
        }

        fn refresh(&self) {
            if let Some(cfg) = self.netcfg() {
                cfg.apply_logged(&NetRequest::LinkUp);
            }
        }

        fn set_mtu(&self, mtu: u16) {
            if let Some(cfg) = self.netcfg() {
                cfg.apply_logged(&NetRequest::SetMtu(mtu));
            }
        }

        fn add_route(&self, routes: &[RouteItem]) {
            let Some(cfg) = self.netcfg() else { return };
            for route in routes {
                let route = route.network();
                tracing::debug!("Add route {} via {}", route, cfg.name());
                cfg.apply_logged(&NetRequest::AddRoute(route));
            }
        }

        fn remove_route(&self, routes: &[RouteItem]) {
            let Some(cfg) = self.netcfg() else { return };
            for route in routes {
                let route = route.network();
                tracing::debug!("Remove route {}", route);
                cfg.apply_logged(&NetRequest::RemoveRoute(route));
            }
        }

        async fn read(&self, buf: &mut [u8]) -> Result<usize> {
            let mut guard = self.reader.lock().await;
            match guard.as_mut() {
                Some(reader) => Ok(reader.read(buf).await?),
                None => Ok(0),
            }
        }

        async fn write(&self, frame: &[u8]) -> Result<()> {
            let mut guard = self.writer.lock().await;
            if let Some(writer) = guard.as_mut() {
                writer.write_all(frame).await?;
            }
            Ok(())
        }

        fn check_available(&self, reorder: bool) -> bool {
            let Some(cfg) = self.netcfg() else { return false };
            if reorder {
                cfg.apply_logged(&NetRequest::SetMetric(1));
            }
            cfg.apply_logged(&NetRequest::ShowLink)
                .map(|output| cfg.check_link(&output))
                .unwrap_or(false)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Error;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// 内存网卡：帧带 4 字节前缀，记录所有写入
    pub(crate) struct MemoryDevice {
        running: AtomicBool,
        inbound: Mutex<VecDeque<Vec<u8>>>,
        notify: Notify,
        pub written: Mutex<Vec<Vec<u8>>>,
        pub routes: Mutex<Vec<RouteItem>>,
        pub fail_setup: AtomicBool,
        pub setup_delay: Mutex<Option<std::time::Duration>>,
    }

    pub(crate) const PREFIX: usize = 4;

    impl MemoryDevice {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                running: AtomicBool::new(false),
                inbound: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                written: Mutex::new(Vec::new()),
                routes: Mutex::new(Vec::new()),
                fail_setup: AtomicBool::new(false),
                setup_delay: Mutex::new(None),
            })
        }

        /// 模拟内核送来一个 IP 包
        pub(crate) fn inject(&self, packet: &[u8]) {
            let mut frame = (packet.len() as u32).to_be_bytes().to_vec();
            frame.extend_from_slice(packet);
            self.inbound.lock().unwrap().push_back(frame);
            self.notify.notify_one();
        }

        pub(crate) fn written(&self) -> Vec<Vec<u8>> {
            self.written.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl VirtualInterface for MemoryDevice {
        fn name(&self) -> String {
            "mem0".to_string()
        }

        fn running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn frame_prefix(&self) -> usize {
            PREFIX
        }

        async fn setup(&self, _info: &SetupInfo) -> Result<()> {
            let delay = *self.setup_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.running() {
                return Err(Error::AlreadyExists);
            }
            if self.fail_setup.load(Ordering::SeqCst) {
                return Err(Error::Tun("open fail".into()));
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn shutdown(&self) {
            self.running.store(false, Ordering::SeqCst);
            self.notify.notify_waiters();
        }

        fn refresh(&self) {}

        fn set_mtu(&self, _mtu: u16) {}

        fn add_route(&self, routes: &[RouteItem]) {
            self.routes.lock().unwrap().extend(routes.iter().map(|r| r.network()));
        }

        fn remove_route(&self, routes: &[RouteItem]) {
            let removed: Vec<_> = routes.iter().map(|r| r.network()).collect();
            self.routes.lock().unwrap().retain(|r| !removed.contains(r));
        }

        async fn read(&self, buf: &mut [u8]) -> Result<usize> {
            loop {
                if !self.running() {
                    return Ok(0);
                }
                let notified = self.notify.notified();
                if let Some(frame) = self.inbound.lock().unwrap().pop_front() {
                    buf[..frame.len()].copy_from_slice(&frame);
                    return Ok(frame.len());
                }
                notified.await;
            }
        }

        async fn write(&self, frame: &[u8]) -> Result<()> {
            self.written.lock().unwrap().push(frame.to_vec());
            Ok(())
        }

        fn check_available(&self, _reorder: bool) -> bool {
            self.running()
        }
    }

    #[tokio::test]
    async fn test_memory_device_prefix_and_setup_twice() {
        let device = MemoryDevice::new();
        device.setup(&SetupInfo::default()).await.unwrap();
        assert!(matches!(device.setup(&SetupInfo::default()).await, Err(Error::AlreadyExists)));

        device.inject(&[0x45, 0, 0, 20]);
        let mut buf = [0u8; 64];
        let n = device.read(&mut buf).await.unwrap();
        assert_eq!(n, PREFIX + 4);
        assert_eq!(&buf[PREFIX..n], &[0x45, 0, 0, 20]);
    }

    #[test]
    fn test_platform_factory() {
        let device = create_platform_device();
        if cfg!(any(target_os = "linux", target_os = "macos", target_os = "windows")) {
            let device = device.unwrap();
            assert!(!device.running());
            assert_eq!(device.frame_prefix(), 0);
        } else {
            assert!(device.is_none());
        }
    }
}

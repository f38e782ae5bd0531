//! 网卡适配器
//!
//! 选择平台网卡，运行读取循环，把每个包交给读取 hook 链，
//! 再根据累积的标志写回网卡或交给上层回调。写入方向对称地经过写入 hook 链。

use async_trait::async_trait;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{RouteItem, SetupInfo};
use crate::error::{Error, Result};

use super::device::{create_platform_device, VirtualInterface};
use super::hook::{HookChain, HookFlags, PacketHook};
use super::packet::{checksum_with_zero, verify_packet, Frame, PacketInfo};
use super::src_proxy::{SrcProxy, SrcProxyHook};

/// 读缓冲大小
const READ_BUFFER_SIZE: usize = 128 * 1024;
/// 空读后的退避时间
const EMPTY_READ_MIN_DELAY: Duration = Duration::from_millis(10);
const EMPTY_READ_MAX_DELAY: Duration = Duration::from_secs(1);
/// 读取出错后的等待时间
const READ_ERROR_DELAY: Duration = Duration::from_secs(1);

/// 适配器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Normal,
    Operating,
    Running,
}

/// 上层回调，接收没有被 hook 拦下的包
#[async_trait]
pub trait PacketCallback: Send + Sync {
    async fn callback(&self, packet: &[u8], info: PacketInfo);
}

/// Setup / Shutdown 互斥，拿不到时立即失败
struct OperatingGuard<'a>(&'a AtomicBool);

impl<'a> OperatingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for OperatingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// 读取循环和适配器共享的状态
struct Shared {
    device: Arc<dyn VirtualInterface>,
    callback: Arc<dyn PacketCallback>,
    hooks: RwLock<Arc<HookChain>>,
    setup_error: Mutex<String>,
}

impl Shared {
    fn hooks(&self) -> Arc<HookChain> {
        match self.hooks.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_error(&self, message: String) {
        match self.setup_error.lock() {
            Ok(mut guard) => *guard = message,
            Err(poisoned) => *poisoned.into_inner() = message,
        }
    }

    fn error(&self) -> String {
        match self.setup_error.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// 网卡适配器
pub struct DeviceAdapter {
    shared: Option<Arc<Shared>>,
    src_proxy: Arc<SrcProxy>,
    operating: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    /// 没有网卡实现时记录错误
    unsupported_error: Mutex<String>,
}

impl DeviceAdapter {
    /// 使用当前平台的网卡
    pub fn new(callback: Arc<dyn PacketCallback>) -> Self {
        Self::build(create_platform_device(), callback)
    }

    /// 使用指定的网卡实现
    pub fn with_device(device: Arc<dyn VirtualInterface>, callback: Arc<dyn PacketCallback>) -> Self {
        Self::build(Some(device), callback)
    }

    fn build(device: Option<Arc<dyn VirtualInterface>>, callback: Arc<dyn PacketCallback>) -> Self {
        let src_proxy = Arc::new(SrcProxy::new());
        let hooks: Vec<Arc<dyn PacketHook>> = vec![Arc::new(SrcProxyHook::new(src_proxy.clone()))];

        let shared = device.map(|device| {
            Arc::new(Shared {
                device,
                callback,
                hooks: RwLock::new(Arc::new(HookChain::new(hooks))),
                setup_error: Mutex::new(String::new()),
            })
        });

        Self {
            shared,
            src_proxy,
            operating: AtomicBool::new(false),
            cancel: Mutex::new(None),
            unsupported_error: Mutex::new(String::new()),
        }
    }

    pub fn src_proxy(&self) -> &Arc<SrcProxy> {
        &self.src_proxy
    }

    pub fn status(&self) -> DeviceStatus {
        let Some(shared) = &self.shared else {
            return DeviceStatus::Normal;
        };
        if self.operating.load(Ordering::Acquire) {
            DeviceStatus::Operating
        } else if shared.device.running() {
            DeviceStatus::Running
        } else {
            DeviceStatus::Normal
        }
    }

    /// 最近一次 Setup 或读取循环的错误
    pub fn setup_error(&self) -> String {
        match &self.shared {
            Some(shared) => shared.error(),
            None => match self.unsupported_error.lock() {
                Ok(guard) => guard.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            },
        }
    }

    fn record_error(&self, message: String) {
        match &self.shared {
            Some(shared) => shared.set_error(message),
            None => match self.unsupported_error.lock() {
                Ok(mut guard) => *guard = message,
                Err(poisoned) => *poisoned.into_inner() = message,
            },
        }
    }

    fn replace_cancel(&self, token: Option<CancellationToken>) -> Option<CancellationToken> {
        match self.cancel.lock() {
            Ok(mut guard) => std::mem::replace(&mut *guard, token),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), token),
        }
    }

    /// 启动网卡、读取循环和源地址代理
    pub async fn setup(&self, info: &SetupInfo) -> Result<()> {
        let Some(_guard) = OperatingGuard::acquire(&self.operating) else {
            let err = Error::Operating("setup");
            self.record_error(err.to_string());
            return Err(err);
        };

        let result = self.setup_inner(info).await;
        if let Err(e) = &result {
            tracing::warn!("[TUN] setup failed: {}", e);
            self.record_error(e.to_string());
        }
        result
    }

    async fn setup_inner(&self, info: &SetupInfo) -> Result<()> {
        let Some(shared) = &self.shared else {
            return Err(Error::Unsupported(std::env::consts::OS.to_string()));
        };

        shared.device.setup(info).await?;
        shared.device.set_mtu(info.mtu);

        let token = CancellationToken::new();
        if let Some(old) = self.replace_cancel(Some(token.clone())) {
            old.cancel();
        }
        tokio::spawn(read_loop(shared.clone(), token.clone()));

        if let Err(e) = self.src_proxy.setup(info).await {
            token.cancel();
            shared.device.shutdown().await;
            return Err(e);
        }

        tracing::info!(
            "[TUN] {} running at {}/{}",
            shared.device.name(), info.address, info.prefix_length
        );
        Ok(())
    }

    /// 停止读取循环、关闭网卡和源地址代理
    pub async fn shutdown(&self) -> Result<()> {
        let Some(shared) = &self.shared else {
            return Err(Error::Unsupported(std::env::consts::OS.to_string()));
        };
        let Some(_guard) = OperatingGuard::acquire(&self.operating) else {
            let err = Error::Operating("shutdown");
            shared.set_error(err.to_string());
            return Err(err);
        };

        if let Some(token) = self.replace_cancel(None) {
            token.cancel();
        }
        shared.device.shutdown().await;
        self.src_proxy.shutdown();
        shared.set_error(String::new());

        tracing::info!("[TUN] shutdown");
        Ok(())
    }

    pub fn refresh(&self) {
        if let Some(shared) = &self.shared {
            shared.device.refresh();
        }
    }

    /// 只在网卡运行时添加
    pub fn add_route(&self, routes: &[RouteItem]) {
        if let Some(shared) = &self.shared {
            if shared.device.running() {
                shared.device.add_route(routes);
            }
        }
    }

    pub fn remove_route(&self, routes: &[RouteItem]) {
        if let Some(shared) = &self.shared {
            shared.device.remove_route(routes);
        }
    }

    /// 按名称合并 hook，同名的新 hook 替换旧的
    pub fn add_hooks(&self, hooks: Vec<Arc<dyn PacketHook>>) {
        let Some(shared) = &self.shared else { return };
        let mut guard = match shared.hooks.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut chain = HookChain::clone(&guard);
        chain.add(hooks);
        tracing::debug!("[TUN] hooks: {:?}", chain.names());
        *guard = Arc::new(chain);
    }

    pub fn hook_names(&self) -> Vec<String> {
        self.shared
            .as_ref()
            .map(|shared| shared.hooks().names())
            .unwrap_or_default()
    }

    /// 写入一个 IP 包
    ///
    /// 包格式错误或网卡未运行时返回 false；写入 hook 清除 `WRITE` 时视为已处理。
    pub async fn write(&self, src_id: &str, packet: &mut [u8]) -> bool {
        let Some(dst) = verify_packet(packet) else {
            return false;
        };
        if self.status() != DeviceStatus::Running {
            return false;
        }
        let Some(shared) = &self.shared else {
            return false;
        };

        let chain = shared.hooks();
        let flags = match catch_unwind(AssertUnwindSafe(|| chain.run_write(packet, dst, src_id))) {
            Ok(flags) => flags,
            Err(_) => {
                tracing::warn!("[TUN] write hook panicked");
                return false;
            }
        };
        checksum_with_zero(packet);

        if !flags.contains(HookFlags::WRITE) {
            return true;
        }
        match shared.device.write(packet).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("[TUN] write failed: {}", e);
                false
            }
        }
    }

    pub fn check_available(&self, reorder: bool) -> bool {
        self.shared
            .as_ref()
            .map(|shared| shared.device.check_available(reorder))
            .unwrap_or(false)
    }
}

/// 读取循环，每次 Setup 一个，直到取消
async fn read_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let prefix = shared.device.frame_prefix();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut empty_delay = EMPTY_READ_MIN_DELAY;

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = shared.device.read(&mut buf) => read,
        };

        let delay = match read {
            Ok(n) if n <= prefix => {
                tracing::trace!("[TUN] read buffer {}", n);
                let delay = empty_delay;
                empty_delay = (empty_delay * 2).min(EMPTY_READ_MAX_DELAY);
                Some(delay)
            }
            Ok(n) => {
                empty_delay = EMPTY_READ_MIN_DELAY;
                match process_frame(&shared, &mut buf[..n], prefix).await {
                    Ok(()) => None,
                    Err(e) => {
                        tracing::warn!("[TUN] read buffer error: {}", e);
                        shared.set_error(e.to_string());
                        Some(READ_ERROR_DELAY)
                    }
                }
            }
            Err(e) => {
                tracing::warn!("[TUN] read buffer error: {}", e);
                shared.set_error(e.to_string());
                Some(READ_ERROR_DELAY)
            }
        };

        if let Some(delay) = delay {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
    tracing::debug!("[TUN] read loop exited");
}

/// 处理一帧：只转发 IPv4，hook 链之后统一重算校验和
async fn process_frame(shared: &Shared, raw: &mut [u8], prefix: usize) -> Result<()> {
    let length = raw.len() - prefix;
    let Some(mut frame) = Frame::new(raw, prefix, length) else {
        return Ok(());
    };
    if frame.version() != 4 || frame.info().is_none() {
        return Ok(());
    }

    let chain = shared.hooks();
    let flags = {
        let packet = frame.packet_mut();
        let flags = catch_unwind(AssertUnwindSafe(|| chain.run_read(packet)))
            .map_err(|_| Error::Other("read hook panicked".into()))?;
        checksum_with_zero(packet);
        flags
    };

    if flags.contains(HookFlags::WRITE_BACK) {
        shared.device.write(frame.packet()).await?;
    }
    if flags.contains(HookFlags::SEND) {
        if let Some(info) = frame.info() {
            shared.callback.callback(frame.packet(), info).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tun::device::tests::MemoryDevice;
    use crate::tun::hook::{HookAction, HookLevel};
    use crate::tun::packet::tests::{ipv4_checksum_valid, tcp_checksum_valid};
    use crate::tun::packet::{build_tcp_packet, build_udp_packet, TcpFlags};
    use std::net::Ipv4Addr;

    const TUN_IP: Ipv4Addr = Ipv4Addr::new(10, 18, 18, 2);

    #[derive(Default)]
    struct RecordingCallback {
        packets: Mutex<Vec<(Vec<u8>, PacketInfo)>>,
    }

    impl RecordingCallback {
        fn packets(&self) -> Vec<(Vec<u8>, PacketInfo)> {
            self.packets.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PacketCallback for RecordingCallback {
        async fn callback(&self, packet: &[u8], info: PacketInfo) {
            self.packets.lock().unwrap().push((packet.to_vec(), info));
        }
    }

    /// 遇到目标端口 9 的包就 panic
    struct PanicHook;

    impl PacketHook for PanicHook {
        fn name(&self) -> &str {
            "panic"
        }

        fn read_level(&self) -> HookLevel {
            HookLevel::HIGHEST
        }

        fn read(&self, packet: &mut [u8]) -> HookAction {
            if packet.len() >= 24 && u16::from_be_bytes([packet[22], packet[23]]) == 9 {
                panic!("boom");
            }
            HookAction::PASS
        }
    }

    fn setup_info() -> SetupInfo {
        SetupInfo {
            address: TUN_IP,
            proxy_url: "socks5://127.0.0.1:1080".into(),
            ..SetupInfo::default()
        }
    }

    fn adapter() -> (Arc<DeviceAdapter>, Arc<MemoryDevice>, Arc<RecordingCallback>) {
        let device = MemoryDevice::new();
        let callback = Arc::new(RecordingCallback::default());
        let adapter = DeviceAdapter::with_device(device.clone(), callback.clone());
        (Arc::new(adapter), device, callback)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_setup_and_shutdown() {
        let (adapter, _device, _) = adapter();
        assert_eq!(adapter.status(), DeviceStatus::Normal);

        adapter.setup(&setup_info()).await.unwrap();
        assert_eq!(adapter.status(), DeviceStatus::Running);
        assert!(adapter.src_proxy().running());
        assert_eq!(adapter.hook_names(), vec!["SrcProxy"]);

        adapter.shutdown().await.unwrap();
        assert_eq!(adapter.status(), DeviceStatus::Normal);
        assert!(!adapter.src_proxy().running());
        assert!(adapter.setup_error().is_empty());
    }

    #[tokio::test]
    async fn test_setup_failure_is_recorded() {
        let (adapter, device, _) = adapter();
        device.fail_setup.store(true, Ordering::SeqCst);

        assert!(adapter.setup(&setup_info()).await.is_err());
        assert_eq!(adapter.status(), DeviceStatus::Normal);
        assert!(adapter.setup_error().contains("open fail"));
    }

    #[tokio::test]
    async fn test_concurrent_setup_fails_with_operating() {
        let (adapter, device, _) = adapter();
        *device.setup_delay.lock().unwrap() = Some(Duration::from_millis(300));

        let first = {
            let adapter = adapter.clone();
            tokio::spawn(async move { adapter.setup(&setup_info()).await })
        };
        wait_until(|| adapter.status() == DeviceStatus::Operating).await;

        let err = adapter.setup(&setup_info()).await.unwrap_err();
        assert!(matches!(err, Error::Operating(_)));
        assert!(err.to_string().contains("operating"));
        assert!(matches!(adapter.shutdown().await, Err(Error::Operating(_))));

        first.await.unwrap().unwrap();
        assert_eq!(adapter.status(), DeviceStatus::Running);
        adapter.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_syn_is_written_back_rewritten() {
        let (adapter, device, callback) = adapter();
        adapter.setup(&setup_info()).await.unwrap();
        let proxy_port = adapter.src_proxy().state().unwrap().proxy_port();

        let syn = build_tcp_packet(
            TUN_IP, Ipv4Addr::new(10, 18, 18, 3), 11111, 5201, 1, 0, TcpFlags::syn(), 65535, &[],
        );
        device.inject(&syn);
        wait_until(|| device.written().len() == 1).await;

        let written = &device.written()[0];
        assert_eq!(&written[12..16], &[10, 18, 18, 0]);
        assert_eq!(&written[16..20], &TUN_IP.octets());
        assert_eq!(u16::from_be_bytes([written[22], written[23]]), proxy_port);
        assert!(ipv4_checksum_valid(written));
        assert!(tcp_checksum_valid(written));
        assert!(callback.packets().is_empty());

        adapter.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_untouched_packet_is_sent_upward() {
        let (adapter, device, callback) = adapter();
        adapter.setup(&setup_info()).await.unwrap();

        let udp = build_udp_packet(TUN_IP, Ipv4Addr::new(8, 8, 8, 8), 5353, 53, b"query");
        device.inject(&udp);

        // IPv6 包被丢弃
        let mut ipv6 = vec![0u8; 40];
        ipv6[0] = 0x60;
        device.inject(&ipv6);

        wait_until(|| callback.packets().len() == 1).await;
        let (packet, info) = &callback.packets()[0];
        assert_eq!(packet, &udp);
        assert_eq!(info.dst_port, 53);
        assert!(device.written().is_empty());

        adapter.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_hook_panic_does_not_stop_read_loop() {
        let (adapter, device, callback) = adapter();
        adapter.add_hooks(vec![Arc::new(PanicHook)]);
        assert_eq!(adapter.hook_names(), vec!["panic", "SrcProxy"]);
        adapter.setup(&setup_info()).await.unwrap();

        let bad = build_udp_packet(TUN_IP, Ipv4Addr::new(8, 8, 8, 8), 5353, 9, b"x");
        let good = build_udp_packet(TUN_IP, Ipv4Addr::new(8, 8, 8, 8), 5353, 53, b"y");
        device.inject(&bad);
        device.inject(&good);

        wait_until(|| callback.packets().len() == 1).await;
        assert_eq!(callback.packets()[0].1.dst_port, 53);
        assert!(adapter.setup_error().contains("panicked"));

        adapter.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_path() {
        let (adapter, device, _) = adapter();
        let mut packet = build_udp_packet(TUN_IP, Ipv4Addr::new(8, 8, 8, 8), 5353, 53, b"hi");

        // 未运行
        assert!(!adapter.write("peer", &mut packet).await);

        adapter.setup(&setup_info()).await.unwrap();
        assert!(adapter.write("peer", &mut packet).await);
        assert_eq!(device.written(), vec![packet.clone()]);

        // 长度不符
        let mut truncated = packet[..packet.len() - 1].to_vec();
        assert!(!adapter.write("peer", &mut truncated).await);
        assert_eq!(device.written().len(), 1);

        adapter.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_routes_only_added_while_running() {
        let (adapter, device, _) = adapter();
        let route = RouteItem::new(Ipv4Addr::new(192, 168, 50, 7), 24);

        adapter.add_route(&[route]);
        assert!(device.routes.lock().unwrap().is_empty());

        adapter.setup(&setup_info()).await.unwrap();
        adapter.add_route(&[route]);
        assert_eq!(
            *device.routes.lock().unwrap(),
            vec![RouteItem::new(Ipv4Addr::new(192, 168, 50, 0), 24)]
        );

        adapter.remove_route(&[route]);
        assert!(device.routes.lock().unwrap().is_empty());
        assert!(adapter.check_available(false));

        adapter.shutdown().await.unwrap();
        assert!(!adapter.check_available(false));
    }
}

//! 源地址代理
//!
//! 把网卡自身发出的 TCP 连接改写后写回网卡，让本机协议栈自己连到本地监听端口，
//! 再通过上游代理连到真实目标。以网卡 IP 10.18.18.2、监听端口 33333 为例，
//! 原始连接 10.18.18.2:11111 -> 10.18.18.3:5201：
//!
//! ```text
//! 1. SYN 10.18.18.2:11111 -> 10.18.18.3:5201        新建流，分配重映射端口 22222
//! 2. 改写 10.18.18.0:22222 -> 10.18.18.2:33333      写回网卡，本机监听端口收到连接
//! 3. 回包 10.18.18.2:33333 -> 10.18.18.0:22222
//!    改写 10.18.18.3:5201 -> 10.18.18.2:11111       写回网卡，应用看到的是真实目标
//! ```
//!
//! 监听端口 accept 到的连接，其 (本地地址, 对端端口) 即 (10.18.18.2, 22222)，
//! 查流表得到真实目标后交给 `ProxyManager`。

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::config::SetupInfo;
use crate::error::Result;
use crate::proxy::ProxyManager;
use crate::utils::network_address;

use super::flow::{FlowEntry, FlowTable, SWEEP_INTERVAL};
use super::hook::{HookAction, HookFlags, HookLevel, PacketHook};
use super::packet::{Ipv4View, PROTO_TCP};

pub const SRC_PROXY_HOOK_NAME: &str = "SrcProxy";

/// accept 出错后的等待时间
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// 单个包的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// 不处理，继续后续 hook
    Pass,
    /// 已改写，写回网卡并停止
    WriteBack,
}

/// 一次 Setup 的运行状态
pub struct ProxyState {
    tun_ip: Ipv4Addr,
    proxy_src: Ipv4Addr,
    proxy_port: u16,
    flows: Arc<FlowTable>,
    cancel: CancellationToken,
}

impl ProxyState {
    pub(crate) fn new(tun_ip: Ipv4Addr, prefix_length: u8, proxy_port: u16) -> Self {
        Self {
            tun_ip,
            proxy_src: network_address(tun_ip, prefix_length),
            proxy_port,
            flows: Arc::new(FlowTable::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn proxy_port(&self) -> u16 {
        self.proxy_port
    }

    pub fn proxy_src(&self) -> Ipv4Addr {
        self.proxy_src
    }

    pub fn flows(&self) -> &Arc<FlowTable> {
        &self.flows
    }

    /// 改写一个 IPv4 包，改写过的包 IP 和 TCP 校验和都被清零
    pub fn process(&self, packet: &mut [u8]) -> Verdict {
        let Some(mut ip) = Ipv4View::new(packet) else {
            return Verdict::Pass;
        };
        if ip.protocol() != PROTO_TCP || ip.src_addr() != self.tun_ip || ip.is_fragment() {
            return Verdict::Pass;
        }
        let src_addr = ip.src_addr();
        let dst_addr = ip.dst_addr();

        let (src_port, dst_port, flags) = match ip.tcp() {
            Some(tcp) => (tcp.src_port(), tcp.dst_port(), tcp.flags()),
            None => return Verdict::Pass,
        };

        if src_port == self.proxy_port {
            // 监听端口发回的包
            let Some(flow) = self.flows.get(src_addr, dst_port) else {
                return Verdict::Pass;
            };
            flow.touch(flags.fin_or_rst());

            ip.set_dst_addr(src_addr);
            ip.set_src_addr(flow.dst_addr);
            ip.set_checksum(0);
            if let Some(mut tcp) = ip.tcp() {
                tcp.set_dst_port(flow.src_port);
                tcp.set_src_port(flow.dst_port);
                tcp.set_checksum(0);
            }
            tracing::trace!(
                "return {}:{} -> {}:{}",
                flow.dst_addr, flow.dst_port, src_addr, flow.src_port
            );
            return Verdict::WriteBack;
        }

        // 应用发出的包
        let flow = match self.flows.get(src_addr, src_port) {
            Some(flow) if flow.src_port != src_port => {
                // 源端口正被另一条流用作重映射端口
                tracing::debug!(
                    "{}:{} collides with remap port of {}:{}, pass through",
                    src_addr, src_port, src_addr, flow.src_port
                );
                return Verdict::Pass;
            }
            Some(flow) if flags.is_bare_syn() && flow.fin_seen() => {
                // 旧连接已关闭，端口被复用
                self.flows.remove(src_addr, &flow);
                match self.create_flow(src_addr, src_port, SocketAddrV4::new(dst_addr, dst_port)) {
                    Some(flow) => flow,
                    None => return Verdict::Pass,
                }
            }
            Some(flow) => flow,
            None if flags.is_bare_syn() => {
                match self.create_flow(src_addr, src_port, SocketAddrV4::new(dst_addr, dst_port)) {
                    Some(flow) => flow,
                    None => return Verdict::Pass,
                }
            }
            None => return Verdict::Pass,
        };
        flow.touch(flags.fin_or_rst());

        ip.set_dst_addr(src_addr);
        ip.set_src_addr(self.proxy_src);
        ip.set_checksum(0);
        if let Some(mut tcp) = ip.tcp() {
            tcp.set_dst_port(self.proxy_port);
            tcp.set_src_port(flow.remapped_port);
            tcp.set_checksum(0);
        }
        tracing::trace!(
            "forward {}:{} -> {}:{} as {}:{}",
            src_addr, src_port, flow.dst_addr, flow.dst_port, self.proxy_src, flow.remapped_port
        );
        Verdict::WriteBack
    }

    fn create_flow(&self, src_addr: Ipv4Addr, src_port: u16, dst: SocketAddrV4) -> Option<Arc<FlowEntry>> {
        self.flows.create(src_addr, src_port, dst, self.proxy_port)
    }

    /// 根据 accept 到的连接查出真实目标
    pub fn lookup_accepted(&self, local: SocketAddr, peer: SocketAddr) -> Option<SocketAddrV4> {
        let SocketAddr::V4(local) = local else {
            return None;
        };
        self.flows
            .get(*local.ip(), peer.port())
            .map(|flow| flow.destination())
    }
}

/// 源地址代理
pub struct SrcProxy {
    state: RwLock<Option<Arc<ProxyState>>>,
    proxy: Arc<ProxyManager>,
}

impl SrcProxy {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(None),
            proxy: Arc::new(ProxyManager::new()),
        }
    }

    pub fn running(&self) -> bool {
        self.state().is_some()
    }

    pub fn state(&self) -> Option<Arc<ProxyState>> {
        match self.state.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn replace_state(&self, state: Option<Arc<ProxyState>>) -> Option<Arc<ProxyState>> {
        match self.state.write() {
            Ok(mut guard) => std::mem::replace(&mut *guard, state),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), state),
        }
    }

    /// 解析代理、绑定监听端口、启动 accept 和清理任务
    pub async fn setup(&self, info: &SetupInfo) -> Result<()> {
        self.shutdown();

        self.proxy.parse(&info.proxy_url)?;

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let proxy_port = listener.local_addr()?.port();
        let state = Arc::new(ProxyState::new(info.address, info.prefix_length, proxy_port));

        tokio::spawn(accept_loop(listener, state.clone(), self.proxy.clone()));
        tokio::spawn(sweep_loop(state.flows.clone(), state.cancel.clone()));

        tracing::info!(
            "SrcProxy listening on {}, proxy source {}",
            proxy_port, state.proxy_src
        );
        self.replace_state(Some(state));
        Ok(())
    }

    /// 关闭监听端口、停止清理任务并清空流表，已建立的转发不受影响
    pub fn shutdown(&self) {
        if let Some(state) = self.replace_state(None) {
            state.cancel.cancel();
            state.flows.clear();
            tracing::info!("SrcProxy stopped");
        }
    }

    pub fn process(&self, packet: &mut [u8]) -> Verdict {
        match self.state() {
            Some(state) => state.process(packet),
            None => Verdict::Pass,
        }
    }
}

impl Default for SrcProxy {
    fn default() -> Self {
        Self::new()
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<ProxyState>, proxy: Arc<ProxyManager>) {
    loop {
        let accepted = tokio::select! {
            _ = state.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (socket, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!("SrcProxy accept error: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                continue;
            }
        };

        handle_accepted(socket, peer, &state, &proxy);
    }
    tracing::debug!("SrcProxy accept loop exited");
}

fn handle_accepted(socket: TcpStream, peer: SocketAddr, state: &ProxyState, proxy: &Arc<ProxyManager>) {
    let target = socket
        .local_addr()
        .ok()
        .and_then(|local| state.lookup_accepted(local, peer));

    let Some(target) = target else {
        tracing::debug!("SrcProxy: no flow for {}, closing", peer);
        return;
    };

    let proxy = proxy.clone();
    tokio::spawn(async move {
        match proxy.connect(socket, target).await {
            Ok(stats) => tracing::debug!(
                "[Proxy] {} closed: {} up, {} down",
                target, stats.local_to_remote, stats.remote_to_local
            ),
            Err(e) => tracing::debug!("[Proxy] {} failed: {}", target, e),
        }
    });
}

async fn sweep_loop(flows: Arc<FlowTable>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                flows.sweep();
            }
        }
    }
}

/// 包装成 hook：读取优先级低，写入优先级高
pub struct SrcProxyHook {
    inner: Arc<SrcProxy>,
}

impl SrcProxyHook {
    pub fn new(inner: Arc<SrcProxy>) -> Self {
        Self { inner }
    }

    pub fn proxy(&self) -> &Arc<SrcProxy> {
        &self.inner
    }
}

impl PacketHook for SrcProxyHook {
    fn name(&self) -> &str {
        SRC_PROXY_HOOK_NAME
    }

    fn read_level(&self) -> HookLevel {
        HookLevel::LOW9
    }

    fn write_level(&self) -> HookLevel {
        HookLevel::HIGH9
    }

    fn read(&self, packet: &mut [u8]) -> HookAction {
        match self.inner.process(packet) {
            Verdict::Pass => HookAction::PASS,
            Verdict::WriteBack => {
                HookAction::new(HookFlags::WRITE_BACK, HookFlags::NEXT | HookFlags::SEND)
            }
        }
    }
}

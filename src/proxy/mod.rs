//! 上游代理
//!
//! `ProxyManager` 根据 URL 选定一个后端，之后所有被重定向的连接都交给它。

pub mod relay;
pub mod socks5;

pub use relay::{relay_bidirectional, RelayStats};
pub use socks5::Socks5Proxy;

use std::net::SocketAddrV4;
use std::sync::RwLock;
use tokio::net::TcpStream;

use crate::error::{Error, Result};

/// 代理后端
#[derive(Debug, Clone)]
pub enum ProxyBackend {
    Socks5(Socks5Proxy),
}

impl ProxyBackend {
    /// 按 URL 选择后端，没有匹配的后端返回 None
    pub fn from_url(proxy: &str) -> Option<Result<Self>> {
        if Socks5Proxy::test(proxy) {
            return Some(Socks5Proxy::parse(proxy).map(ProxyBackend::Socks5));
        }
        None
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProxyBackend::Socks5(_) => "Socks5",
        }
    }

    pub async fn connect(&self, local: TcpStream, target: SocketAddrV4) -> Result<RelayStats> {
        match self {
            ProxyBackend::Socks5(proxy) => proxy.connect(local, target).await,
        }
    }
}

/// 代理管理器
#[derive(Debug, Default)]
pub struct ProxyManager {
    current: RwLock<Option<ProxyBackend>>,
}

impl ProxyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析代理地址，成功后成为当前后端
    ///
    /// 不支持的协议返回 `Ok(false)` 并保持原有选择。
    pub fn parse(&self, proxy: &str) -> Result<bool> {
        let Some(backend) = ProxyBackend::from_url(proxy) else {
            tracing::warn!("[Proxy] no backend for {}", proxy);
            return Ok(false);
        };
        let backend = backend?;
        tracing::debug!("[Proxy] current proxy {} -> [{}]", proxy, backend.name());

        match self.current.write() {
            Ok(mut guard) => *guard = Some(backend),
            Err(poisoned) => *poisoned.into_inner() = Some(backend),
        }
        Ok(true)
    }

    pub fn current(&self) -> Option<ProxyBackend> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// 把一个已接受的连接通过当前后端连到真实目标
    ///
    /// 没有后端时直接关闭连接。
    pub async fn connect(&self, local: TcpStream, target: SocketAddrV4) -> Result<RelayStats> {
        let Some(backend) = self.current() else {
            drop(local);
            tracing::error!("[Proxy] proxy not found!");
            return Err(Error::Other("proxy not found".into()));
        };
        backend.connect(local, target).await
    }
}

//! 平台网络配置
//!
//! 把声明式的请求渲染成各平台的 `ip` / `ifconfig` / `route` / `netsh` 命令并执行，
//! 调用方只关心成功与否以及命令输出。

use crate::config::RouteItem;
use crate::error::{Error, Result};
use crate::utils::prefix_to_netmask;
use std::net::Ipv4Addr;
use std::process::Command;

/// 配置请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetRequest {
    LinkUp,
    SetMtu(u16),
    AddRoute(RouteItem),
    RemoveRoute(RouteItem),
    /// 降低接口跃点数（Windows 接口排序）
    SetMetric(u32),
    ShowLink,
}

/// 目标平台
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Macos,
    Windows,
}

impl Platform {
    pub fn current() -> Option<Self> {
        if cfg!(target_os = "linux") {
            Some(Platform::Linux)
        } else if cfg!(target_os = "macos") {
            Some(Platform::Macos)
        } else if cfg!(target_os = "windows") {
            Some(Platform::Windows)
        } else {
            None
        }
    }
}

/// 一个网卡的配置器
#[derive(Debug, Clone)]
pub struct NetConfigurator {
    platform: Platform,
    name: String,
    address: Ipv4Addr,
}

impl NetConfigurator {
    pub fn new(platform: Platform, name: &str, address: Ipv4Addr) -> Self {
        Self {
            platform,
            name: name.to_string(),
            address,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 渲染出要执行的命令（程序名 + 参数）
    pub fn render(&self, request: &NetRequest) -> Vec<String> {
        let name = self.name.as_str();
        match (self.platform, request) {
            (Platform::Linux, NetRequest::LinkUp) => {
                vec!["ip".into(), "link".into(), "set".into(), "dev".into(), name.into(), "up".into()]
            }
            (Platform::Linux, NetRequest::SetMtu(mtu)) => vec![
                "ip".into(), "link".into(), "set".into(), "dev".into(), name.into(),
                "mtu".into(), mtu.to_string(),
            ],
            (Platform::Linux, NetRequest::AddRoute(route)) => vec![
                "ip".into(), "route".into(), "add".into(), route.to_string(),
                "via".into(), self.address.to_string(),
                "dev".into(), name.into(), "metric".into(), "1".into(),
            ],
            (Platform::Linux, NetRequest::RemoveRoute(route)) => {
                vec!["ip".into(), "route".into(), "del".into(), route.to_string()]
            }
            (Platform::Linux, NetRequest::SetMetric(_)) => Vec::new(),
            (Platform::Linux, NetRequest::ShowLink) => {
                vec!["ip".into(), "link".into(), "show".into(), name.into()]
            }

            (Platform::Macos, NetRequest::LinkUp) => vec!["ifconfig".into(), name.into(), "up".into()],
            (Platform::Macos, NetRequest::SetMtu(mtu)) => {
                vec!["ifconfig".into(), name.into(), "mtu".into(), mtu.to_string()]
            }
            (Platform::Macos, NetRequest::AddRoute(route)) => vec![
                "route".into(), "add".into(), "-net".into(), route.to_string(),
                "-interface".into(), name.into(),
            ],
            (Platform::Macos, NetRequest::RemoveRoute(route)) => {
                vec!["route".into(), "delete".into(), "-net".into(), route.to_string()]
            }
            (Platform::Macos, NetRequest::SetMetric(_)) => Vec::new(),
            (Platform::Macos, NetRequest::ShowLink) => vec!["ifconfig".into(), name.into()],

            (Platform::Windows, NetRequest::LinkUp) => vec![
                "netsh".into(), "interface".into(), "set".into(), "interface".into(),
                name.into(), "enable".into(),
            ],
            (Platform::Windows, NetRequest::SetMtu(mtu)) => vec![
                "netsh".into(), "interface".into(), "ipv4".into(), "set".into(), "subinterface".into(),
                name.into(), format!("mtu={}", mtu), "store=persistent".into(),
            ],
            (Platform::Windows, NetRequest::AddRoute(route)) => vec![
                "route".into(), "add".into(), route.address.to_string(),
                "mask".into(), prefix_to_netmask(route.prefix_length).to_string(),
                self.address.to_string(), "metric".into(), "5".into(),
            ],
            (Platform::Windows, NetRequest::RemoveRoute(route)) => {
                vec!["route".into(), "delete".into(), route.address.to_string()]
            }
            (Platform::Windows, NetRequest::SetMetric(metric)) => vec![
                "netsh".into(), "interface".into(), "ipv4".into(), "set".into(), "interface".into(),
                name.into(), format!("metric={}", metric),
            ],
            (Platform::Windows, NetRequest::ShowLink) => vec![
                "netsh".into(), "interface".into(), "ipv4".into(), "show".into(), "addresses".into(),
                name.into(),
            ],
        }
    }

    /// 执行请求，返回标准输出
    pub fn apply(&self, request: &NetRequest) -> Result<String> {
        let args = self.render(request);
        let Some((program, rest)) = args.split_first() else {
            return Ok(String::new());
        };

        tracing::debug!("{}: {}", self.name, args.join(" "));

        let output = Command::new(program)
            .args(rest)
            .output()
            .map_err(|e| Error::Command(format!("{}: {}", program, e)))?;

        if !output.status.success() {
            return Err(Error::Command(format!(
                "{}: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// 执行请求，失败只记录日志
    pub fn apply_logged(&self, request: &NetRequest) -> Option<String> {
        match self.apply(request) {
            Ok(output) => Some(output),
            Err(e) => {
                tracing::warn!("{:?} failed: {}", request, e);
                None
            }
        }
    }

    /// 网卡已启动并持有预期地址
    pub fn check_link(&self, output: &str) -> bool {
        let address = self.address.to_string();
        match self.platform {
            Platform::Linux => output.contains("state UP") || output.contains(",UP"),
            Platform::Macos => output.contains("UP") && output.contains(&address),
            Platform::Windows => output.contains(&address),
        }
    }
}

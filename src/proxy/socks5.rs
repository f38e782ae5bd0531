/// SOCKS5 客户端
///
/// RFC 1928 / RFC 1929: 方法协商、用户名密码子协商、IPv4 CONNECT

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use std::net::SocketAddrV4;
use url::Url;

use crate::error::{Error, Result};
use super::relay::{relay_bidirectional, RelayStats};

/// SOCKS5 版本号
const SOCKS5_VERSION: u8 = 0x05;
/// 用户名密码子协商版本号
const AUTH_VERSION: u8 = 0x01;

const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;

const DEFAULT_PORT: u16 = 1080;

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "General failure",
        0x02 => "Connection not allowed",
        0x03 => "Network unreachable",
        0x04 => "Host unreachable",
        0x05 => "Connection refused",
        0x06 => "TTL expired",
        0x07 => "Command not supported",
        0x08 => "Address type not supported",
        _ => "Unknown error",
    }
}

/// SOCKS5 上游代理
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Proxy {
    host: String,
    port: u16,
    username: String,
    password: String,
}

impl Socks5Proxy {
    /// 是否为 socks5 地址
    pub fn test(proxy: &str) -> bool {
        Url::parse(proxy)
            .map(|url| matches!(url.scheme(), "socks5" | "socks5h"))
            .unwrap_or(false)
    }

    /// 解析 `socks5://[user:pass@]host[:port]`
    pub fn parse(proxy: &str) -> Result<Self> {
        let url = Url::parse(proxy)?;
        if !matches!(url.scheme(), "socks5" | "socks5h") {
            return Err(Error::Config(format!("Not a socks5 url: {}", proxy)));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::Config(format!("Missing proxy host: {}", proxy)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            username: url.username().to_string(),
            password: url.password().unwrap_or_default().to_string(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn requires_auth(&self) -> bool {
        !self.username.is_empty()
    }

    /// 通过上游代理连接 `target`，然后在 `local` 和代理之间转发
    pub async fn connect(&self, local: TcpStream, target: SocketAddrV4) -> Result<RelayStats> {
        debug!("[Socks5] connect {} with socks server {}:{}", target, self.host, self.port);

        let mut remote = TcpStream::connect((self.host.as_str(), self.port)).await?;
        let _ = remote.set_nodelay(true);
        let _ = local.set_nodelay(true);

        self.handshake(&mut remote, target).await?;

        Ok(relay_bidirectional(local, remote).await)
    }

    /// 协商 + 认证 + CONNECT
    pub async fn handshake<S>(&self, stream: &mut S, target: SocketAddrV4) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // 1. 方法协商
        let greeting: &[u8] = if self.requires_auth() {
            &[SOCKS5_VERSION, 2, AUTH_NONE, AUTH_PASSWORD]
        } else {
            &[SOCKS5_VERSION, 1, AUTH_NONE]
        };
        stream.write_all(greeting).await?;

        let mut response = [0u8; 2];
        stream.read_exact(&mut response).await?;
        if response[0] != SOCKS5_VERSION {
            return Err(Error::Protocol("Invalid SOCKS version from server".into()));
        }

        // 2. 认证
        match response[1] {
            AUTH_NONE => {}
            AUTH_PASSWORD if self.requires_auth() => self.authenticate(stream).await?,
            AUTH_NO_ACCEPTABLE => {
                return Err(Error::Protocol("Server rejected auth methods".into()));
            }
            method => {
                return Err(Error::Protocol(format!("Unexpected auth method: {:#04x}", method)));
            }
        }

        // 3. CONNECT
        let mut request = Vec::with_capacity(10);
        request.extend_from_slice(&[SOCKS5_VERSION, CMD_CONNECT, 0x00, ATYP_IPV4]);
        request.extend_from_slice(&target.ip().octets());
        request.extend_from_slice(&target.port().to_be_bytes());
        stream.write_all(&request).await?;

        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS5_VERSION {
            return Err(Error::Protocol("Invalid SOCKS version in response".into()));
        }
        if header[1] != REP_SUCCESS {
            return Err(Error::Protocol(format!("SOCKS5 error: {}", reply_message(header[1]))));
        }

        // 跳过绑定地址
        match header[3] {
            ATYP_IPV4 => {
                let mut skip = [0u8; 6];
                stream.read_exact(&mut skip).await?;
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut skip = vec![0u8; len[0] as usize + 2];
                stream.read_exact(&mut skip).await?;
            }
            ATYP_IPV6 => {
                let mut skip = [0u8; 18];
                stream.read_exact(&mut skip).await?;
            }
            atyp => {
                return Err(Error::Protocol(format!("Unknown address type: {}", atyp)));
            }
        }

        Ok(())
    }

    async fn authenticate<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let username = self.username.as_bytes();
        let password = self.password.as_bytes();
        if username.len() > 255 || password.len() > 255 {
            return Err(Error::Config("Proxy credentials too long".into()));
        }

        let mut request = Vec::with_capacity(3 + username.len() + password.len());
        request.push(AUTH_VERSION);
        request.push(username.len() as u8);
        request.extend_from_slice(username);
        request.push(password.len() as u8);
        request.extend_from_slice(password);
        stream.write_all(&request).await?;

        let mut response = [0u8; 2];
        stream.read_exact(&mut response).await?;
        if response[1] != 0x00 {
            return Err(Error::Protocol("Authentication failed".into()));
        }
        Ok(())
    }
}

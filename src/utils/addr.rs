/// 地址解析工具

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// 未写前缀长度时的默认值
pub const DEFAULT_PREFIX_LENGTH: u8 = 24;

/// 解析 CIDR 地址
/// 
/// 支持 "10.18.18.2/24" 与 "10.18.18.2"（默认 /24）两种格式
/// 
/// # 返回
/// 
/// (address, prefix_length)
pub fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let cidr = cidr.trim();
    let (addr_part, prefix_part) = match cidr.split_once('/') {
        Some((a, p)) => (a, Some(p)),
        None => (cidr, None),
    };

    let address = addr_part.parse::<Ipv4Addr>()
        .map_err(|_| Error::Config(format!("Invalid address: {}", cidr)))?;

    let prefix_length = match prefix_part {
        Some(p) => p.parse::<u8>()
            .ok()
            .filter(|len| *len <= 32)
            .ok_or_else(|| Error::Config(format!("Invalid prefix length: {}", cidr)))?,
        None => DEFAULT_PREFIX_LENGTH,
    };

    Ok((address, prefix_length))
}

/// 前缀长度 -> 子网掩码
pub fn prefix_to_netmask(prefix_length: u8) -> Ipv4Addr {
    Ipv4Addr::from(prefix_to_mask_value(prefix_length))
}

pub fn prefix_to_mask_value(prefix_length: u8) -> u32 {
    match prefix_length {
        0 => 0,
        len if len >= 32 => u32::MAX,
        len => u32::MAX << (32 - len),
    }
}

/// 网络地址（address & mask）
pub fn network_address(address: Ipv4Addr, prefix_length: u8) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(address) & prefix_to_mask_value(prefix_length))
}

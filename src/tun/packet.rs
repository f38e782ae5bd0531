//! IP 包视图与校验和
//!
//! - `Frame`：设备读到的一帧（可能带平台前缀），惰性解析 IP 头
//! - `Ipv4View` / `TcpView`：带边界检查的可变头部视图
//! - `checksum_with_zero`：重新计算被清零的校验和
//! - `build_tcp_packet` / `build_udp_packet`：构造完整 IPv4 包

use std::net::{IpAddr, Ipv4Addr};

use etherparse::{NetSlice, SlicedPacket, TransportSlice};

/// 协议号
pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

const IPV4_MIN_HEADER_LEN: usize = 20;
const TCP_MIN_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

/// 设备读到的一帧
///
/// `raw[offset..offset + length]` 是去掉平台前缀后的 IP 包。
/// 只在一次 hook 流水线期间有效，hook 不得保留。
pub struct Frame<'a> {
    raw: &'a mut [u8],
    offset: usize,
    length: usize,
}

/// 帧的解析结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    /// 4 或 6
    pub version: u8,
    pub protocol: u8,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    /// 非 TCP/UDP 时为 0
    pub src_port: u16,
    pub dst_port: u16,
}

impl<'a> Frame<'a> {
    pub fn new(raw: &'a mut [u8], offset: usize, length: usize) -> Option<Self> {
        if length == 0 || offset.checked_add(length)? > raw.len() {
            return None;
        }
        Some(Self { raw, offset, length })
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// IP 包
    pub fn packet(&self) -> &[u8] {
        &self.raw[self.offset..self.offset + self.length]
    }

    pub fn packet_mut(&mut self) -> &mut [u8] {
        &mut self.raw[self.offset..self.offset + self.length]
    }

    /// 协议版本
    pub fn version(&self) -> u8 {
        self.packet()[0] >> 4
    }

    /// 解析版本/协议/地址/端口，格式错误返回 None
    pub fn info(&self) -> Option<PacketInfo> {
        let parsed = SlicedPacket::from_ip(self.packet()).ok()?;

        let (version, protocol, src_addr, dst_addr) = match &parsed.net {
            Some(NetSlice::Ipv4(ipv4)) => {
                let header = ipv4.header();
                (
                    4,
                    ipv4.payload().ip_number.0,
                    IpAddr::V4(header.source_addr()),
                    IpAddr::V4(header.destination_addr()),
                )
            }
            Some(NetSlice::Ipv6(ipv6)) => {
                let header = ipv6.header();
                (
                    6,
                    ipv6.payload().ip_number.0,
                    IpAddr::V6(header.source_addr()),
                    IpAddr::V6(header.destination_addr()),
                )
            }
            _ => return None,
        };

        let (src_port, dst_port) = match &parsed.transport {
            Some(TransportSlice::Tcp(tcp)) => (tcp.source_port(), tcp.destination_port()),
            Some(TransportSlice::Udp(udp)) => (udp.source_port(), udp.destination_port()),
            _ => (0, 0),
        };

        Some(PacketInfo {
            version,
            protocol,
            src_addr,
            dst_addr,
            src_port,
            dst_port,
        })
    }
}

/// IPv4 头可变视图
///
/// 构造时校验：长度 >= 20、版本为 4、IHL >= 5、IHL <= 总长度 <= 缓冲区长度
pub struct Ipv4View<'a> {
    buf: &'a mut [u8],
    header_len: usize,
    total_len: usize,
}

impl<'a> Ipv4View<'a> {
    pub fn new(buf: &'a mut [u8]) -> Option<Self> {
        if buf.len() < IPV4_MIN_HEADER_LEN || buf[0] >> 4 != 4 {
            return None;
        }
        let header_len = ((buf[0] & 0x0f) as usize) * 4;
        let total_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if header_len < IPV4_MIN_HEADER_LEN || header_len > total_len || total_len > buf.len() {
            return None;
        }
        Some(Self { buf, header_len, total_len })
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }

    pub fn protocol(&self) -> u8 {
        self.buf[9]
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.buf[12], self.buf[13], self.buf[14], self.buf[15])
    }

    pub fn set_src_addr(&mut self, addr: Ipv4Addr) {
        self.buf[12..16].copy_from_slice(&addr.octets());
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.buf[16], self.buf[17], self.buf[18], self.buf[19])
    }

    pub fn set_dst_addr(&mut self, addr: Ipv4Addr) {
        self.buf[16..20].copy_from_slice(&addr.octets());
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.buf[10], self.buf[11]])
    }

    pub fn set_checksum(&mut self, value: u16) {
        self.buf[10..12].copy_from_slice(&value.to_be_bytes());
    }

    /// MF 置位或片偏移非 0
    pub fn is_fragment(&self) -> bool {
        let flags_offset = u16::from_be_bytes([self.buf[6], self.buf[7]]);
        flags_offset & 0x2000 != 0 || flags_offset & 0x1fff != 0
    }

    /// 重新计算 IP 头校验和
    pub fn update_checksum(&mut self) {
        self.set_checksum(0);
        let checksum = calculate_checksum(&self.buf[..self.header_len]);
        self.set_checksum(checksum);
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[self.header_len..self.total_len]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.header_len..self.total_len]
    }

    /// TCP 头视图，非 TCP 或长度不足时返回 None
    pub fn tcp(&mut self) -> Option<TcpView<'_>> {
        if self.protocol() != PROTO_TCP {
            return None;
        }
        TcpView::new(self.payload_mut())
    }
}

/// TCP 头可变视图
pub struct TcpView<'a> {
    buf: &'a mut [u8],
}

impl<'a> TcpView<'a> {
    pub fn new(buf: &'a mut [u8]) -> Option<Self> {
        if buf.len() < TCP_MIN_HEADER_LEN {
            return None;
        }
        let data_offset = ((buf[12] >> 4) as usize) * 4;
        if data_offset < TCP_MIN_HEADER_LEN || data_offset > buf.len() {
            return None;
        }
        Some(Self { buf })
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.buf[0], self.buf[1]])
    }

    pub fn set_src_port(&mut self, port: u16) {
        self.buf[0..2].copy_from_slice(&port.to_be_bytes());
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.buf[2], self.buf[3]])
    }

    pub fn set_dst_port(&mut self, port: u16) {
        self.buf[2..4].copy_from_slice(&port.to_be_bytes());
    }

    pub fn flags(&self) -> TcpFlags {
        TcpFlags::from_byte(self.buf[13])
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.buf[16], self.buf[17]])
    }

    pub fn set_checksum(&mut self, value: u16) {
        self.buf[16..18].copy_from_slice(&value.to_be_bytes());
    }
}

/// 重新计算为 0 的校验和
///
/// 修改头部字段的一方负责把对应校验和清零，这里在整条 hook 链之后统一计算一次：
/// - IP 头校验和为 0 时重算
/// - 未分片包的 TCP/UDP（伪头部）与 ICMP 校验和为 0 时重算
///
/// 仅处理 IPv4，其他内容原样保留
pub fn checksum_with_zero(packet: &mut [u8]) {
    let Some(mut ip) = Ipv4View::new(packet) else {
        return;
    };

    if ip.checksum() == 0 {
        ip.update_checksum();
    }
    if ip.is_fragment() {
        return;
    }

    let src = ip.src_addr();
    let dst = ip.dst_addr();
    let protocol = ip.protocol();
    let payload = ip.payload_mut();

    let field = match protocol {
        PROTO_TCP if payload.len() >= TCP_MIN_HEADER_LEN => 16,
        PROTO_UDP if payload.len() >= UDP_HEADER_LEN => 6,
        PROTO_ICMP if payload.len() >= 4 => 2,
        _ => return,
    };
    if payload[field] != 0 || payload[field + 1] != 0 {
        return;
    }

    let checksum = match protocol {
        PROTO_TCP => calculate_tcp_checksum(src, dst, payload),
        PROTO_UDP => calculate_udp_checksum(src, dst, payload),
        _ => calculate_checksum(payload),
    };
    payload[field..field + 2].copy_from_slice(&checksum.to_be_bytes());
}

/// 写入路径校验：声明的总长度等于缓冲区长度时返回目标地址
pub fn verify_packet(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < IPV4_MIN_HEADER_LEN || packet[0] >> 4 != 4 {
        return None;
    }
    let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    if total_len != packet.len() {
        return None;
    }
    let dst = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
    if dst.is_unspecified() {
        return None;
    }
    Some(dst)
}

/// 构造 IPv4 + TCP 包
pub fn build_tcp_packet(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload: &[u8],
) -> Vec<u8> {
    let tcp_len = 20 + payload.len(); // TCP header (20) + payload
    let total_len = 20 + tcp_len;     // IP header (20) + TCP

    let mut packet = Vec::with_capacity(total_len);

    // ========== IPv4 Header (20 bytes) ==========
    push_ipv4_header(&mut packet, total_len, PROTO_TCP, src_ip, dst_ip);

    // ========== TCP Header (20 bytes) ==========
    let tcp_start = packet.len();
    packet.extend(&src_port.to_be_bytes());      // Source Port
    packet.extend(&dst_port.to_be_bytes());      // Destination Port
    packet.extend(&seq.to_be_bytes());           // Sequence Number
    packet.extend(&ack.to_be_bytes());           // Acknowledgment Number
    packet.push(0x50);                           // Data Offset (5) + Reserved
    packet.push(flags.to_byte());                // Flags
    packet.extend(&window.to_be_bytes());        // Window Size
    packet.extend(&[0x00, 0x00]);                // Checksum (placeholder)
    packet.extend(&[0x00, 0x00]);                // Urgent Pointer
    packet.extend(payload);

    let tcp_checksum = calculate_tcp_checksum(src_ip, dst_ip, &packet[tcp_start..]);
    packet[tcp_start + 16..tcp_start + 18].copy_from_slice(&tcp_checksum.to_be_bytes());

    packet
}

/// 构造 IPv4 + UDP 包
pub fn build_udp_packet(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = 8 + payload.len();  // UDP header (8) + payload
    let total_len = 20 + udp_len;     // IP header (20) + UDP

    let mut packet = Vec::with_capacity(total_len);
    push_ipv4_header(&mut packet, total_len, PROTO_UDP, src_ip, dst_ip);

    // ========== UDP Header (8 bytes) ==========
    let udp_start = packet.len();
    packet.extend(&src_port.to_be_bytes());      // Source Port
    packet.extend(&dst_port.to_be_bytes());      // Destination Port
    packet.extend(&(udp_len as u16).to_be_bytes()); // Length
    packet.extend(&[0x00, 0x00]);                // Checksum (placeholder)
    packet.extend(payload);

    let udp_checksum = calculate_udp_checksum(src_ip, dst_ip, &packet[udp_start..]);
    packet[udp_start + 6..udp_start + 8].copy_from_slice(&udp_checksum.to_be_bytes());

    packet
}

fn push_ipv4_header(packet: &mut Vec<u8>, total_len: usize, protocol: u8, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) {
    packet.push(0x45);                           // Version (4) + IHL (5)
    packet.push(0x00);                           // DSCP + ECN
    packet.extend(&(total_len as u16).to_be_bytes()); // Total Length
    packet.extend(&[0x00, 0x00]);                // Identification
    packet.extend(&[0x40, 0x00]);                // Flags (DF) + Fragment Offset
    packet.push(64);                             // TTL
    packet.push(protocol);                       // Protocol
    packet.extend(&[0x00, 0x00]);                // Header Checksum (placeholder)
    packet.extend(&src_ip.octets());             // Source IP
    packet.extend(&dst_ip.octets());             // Destination IP

    let ip_checksum = calculate_checksum(&packet[0..20]);
    packet[10..12].copy_from_slice(&ip_checksum.to_be_bytes());
}

/// TCP 标志位
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn syn() -> Self {
        Self { syn: true, ..Default::default() }
    }

    pub fn syn_ack() -> Self {
        Self { syn: true, ack: true, ..Default::default() }
    }

    pub fn ack() -> Self {
        Self { ack: true, ..Default::default() }
    }

    pub fn psh_ack() -> Self {
        Self { psh: true, ack: true, ..Default::default() }
    }

    pub fn fin_ack() -> Self {
        Self { fin: true, ack: true, ..Default::default() }
    }

    pub fn rst() -> Self {
        Self { rst: true, ..Default::default() }
    }

    /// ECE/CWR 位被忽略
    pub fn from_byte(byte: u8) -> Self {
        Self {
            fin: byte & 0x01 != 0,
            syn: byte & 0x02 != 0,
            rst: byte & 0x04 != 0,
            psh: byte & 0x08 != 0,
            ack: byte & 0x10 != 0,
            urg: byte & 0x20 != 0,
        }
    }

    pub fn to_byte(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0x01; }
        if self.syn { flags |= 0x02; }
        if self.rst { flags |= 0x04; }
        if self.psh { flags |= 0x08; }
        if self.ack { flags |= 0x10; }
        if self.urg { flags |= 0x20; }
        flags
    }

    /// 新连接的第一个包：SYN，且没有 ACK/FIN/RST
    pub fn is_bare_syn(&self) -> bool {
        self.syn && !self.ack && !self.fin && !self.rst
    }

    pub fn fin_or_rst(&self) -> bool {
        self.fin || self.rst
    }
}

/// 按 16-bit 字累加
fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

/// 折叠进位并取反
fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !sum as u16
}

fn pseudo_header_sum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, protocol: u8, len: usize) -> u32 {
    let sum = sum_words(&src_ip.octets(), 0);
    let sum = sum_words(&dst_ip.octets(), sum);
    sum + protocol as u32 + len as u32
}

/// 计算 IP 校验和
pub fn calculate_checksum(data: &[u8]) -> u16 {
    fold(sum_words(data, 0))
}

/// 计算 TCP 校验和（包含伪头部）
pub fn calculate_tcp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, tcp_segment: &[u8]) -> u16 {
    let sum = pseudo_header_sum(src_ip, dst_ip, PROTO_TCP, tcp_segment.len());
    fold(sum_words(tcp_segment, sum))
}

/// 计算 UDP 校验和（包含伪头部）
pub fn calculate_udp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, udp_segment: &[u8]) -> u16 {
    let sum = pseudo_header_sum(src_ip, dst_ip, PROTO_UDP, udp_segment.len());
    let checksum = fold(sum_words(udp_segment, sum));
    // UDP 校验和为 0 时应设置为 0xFFFF
    if checksum == 0 { 0xFFFF } else { checksum }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 校验和连同校验字段一起累加，结果取反为 0 即正确
    pub(crate) fn ipv4_checksum_valid(packet: &[u8]) -> bool {
        let header_len = ((packet[0] & 0x0f) as usize) * 4;
        calculate_checksum(&packet[..header_len]) == 0
    }

    pub(crate) fn tcp_checksum_valid(packet: &[u8]) -> bool {
        let header_len = ((packet[0] & 0x0f) as usize) * 4;
        let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
        let src = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
        let dst = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
        calculate_tcp_checksum(src, dst, &packet[header_len..total_len]) == 0
    }

    #[test]
    fn test_tcp_packet_build() {
        let packet = build_tcp_packet(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(93, 184, 216, 34),
            12345,
            80,
            1000,
            0,
            TcpFlags::syn(),
            65535,
            &[],
        );

        assert_eq!(packet[0] & 0xF0, 0x40); // IPv4
        assert_eq!(packet[9], 6);           // TCP protocol
        assert_eq!(packet.len(), 40);       // IP(20) + TCP(20)
        assert!(ipv4_checksum_valid(&packet));
        assert!(tcp_checksum_valid(&packet));
    }

    #[test]
    fn test_udp_packet_build() {
        let packet = build_udp_packet(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(8, 8, 8, 8),
            54321,
            53,
            b"DNS query",
        );

        assert_eq!(packet[0] & 0xF0, 0x40); // IPv4
        assert_eq!(packet[9], 17);          // UDP protocol
        assert_eq!(packet.len(), 20 + 8 + 9); // IP(20) + UDP(8) + payload(9)
        assert!(ipv4_checksum_valid(&packet));
    }

    #[test]
    fn test_frame_info() {
        let mut raw = vec![0u8; 4];
        raw.extend(build_tcp_packet(
            Ipv4Addr::new(10, 18, 18, 2),
            Ipv4Addr::new(10, 18, 18, 3),
            11111,
            5201,
            1,
            0,
            TcpFlags::syn(),
            64240,
            &[],
        ));
        let len = raw.len() - 4;
        let frame = Frame::new(&mut raw, 4, len).unwrap();

        assert_eq!(frame.version(), 4);
        let info = frame.info().unwrap();
        assert_eq!(info.protocol, PROTO_TCP);
        assert_eq!(info.src_addr, IpAddr::V4(Ipv4Addr::new(10, 18, 18, 2)));
        assert_eq!(info.dst_addr, IpAddr::V4(Ipv4Addr::new(10, 18, 18, 3)));
        assert_eq!(info.src_port, 11111);
        assert_eq!(info.dst_port, 5201);
    }

    #[test]
    fn test_frame_bounds() {
        let mut raw = vec![0u8; 10];
        assert!(Frame::new(&mut raw, 4, 7).is_none());
        assert!(Frame::new(&mut raw, 4, 0).is_none());
        assert!(Frame::new(&mut raw, 4, 6).is_some());
    }

    #[test]
    fn test_ipv4_view_rejects_short_or_bad_length() {
        let mut short = vec![0x45u8; 19];
        assert!(Ipv4View::new(&mut short).is_none());

        let mut packet = build_tcp_packet(
            Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(2, 2, 2, 2),
            1, 2, 0, 0, TcpFlags::ack(), 100, b"abc",
        );
        // 总长度大于缓冲区
        packet[2..4].copy_from_slice(&100u16.to_be_bytes());
        assert!(Ipv4View::new(&mut packet).is_none());

        // IHL < 5
        let mut packet = build_tcp_packet(
            Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(2, 2, 2, 2),
            1, 2, 0, 0, TcpFlags::ack(), 100, b"abc",
        );
        packet[0] = 0x44;
        assert!(Ipv4View::new(&mut packet).is_none());
    }

    #[test]
    fn test_tcp_view_rejects_bad_data_offset() {
        let mut packet = build_tcp_packet(
            Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(2, 2, 2, 2),
            1, 2, 0, 0, TcpFlags::ack(), 100, &[],
        );
        packet[20 + 12] = 0xF0; // 60 字节头部，超出段长度
        let mut ip = Ipv4View::new(&mut packet).unwrap();
        assert!(ip.tcp().is_none());
    }

    #[test]
    fn test_checksum_with_zero_after_rewrite() {
        let mut packet = build_tcp_packet(
            Ipv4Addr::new(10, 18, 18, 2),
            Ipv4Addr::new(10, 18, 18, 3),
            11111,
            5201,
            7,
            9,
            TcpFlags::psh_ack(),
            502,
            b"hello world!",
        );
        {
            let mut ip = Ipv4View::new(&mut packet).unwrap();
            ip.set_src_addr(Ipv4Addr::new(10, 18, 18, 0));
            ip.set_dst_addr(Ipv4Addr::new(10, 18, 18, 2));
            ip.set_checksum(0);
            let mut tcp = ip.tcp().unwrap();
            tcp.set_src_port(40000);
            tcp.set_dst_port(33333);
            tcp.set_checksum(0);
        }
        checksum_with_zero(&mut packet);
        assert!(ipv4_checksum_valid(&packet));
        assert!(tcp_checksum_valid(&packet));
    }

    #[test]
    fn test_checksum_with_zero_keeps_nonzero() {
        let mut packet = build_tcp_packet(
            Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2),
            1000, 2000, 0, 0, TcpFlags::ack(), 100, &[],
        );
        packet[10] ^= 0xFF; // 故意改坏，非 0 不重算
        let before = packet.clone();
        checksum_with_zero(&mut packet);
        assert_eq!(before, packet);
    }

    #[test]
    fn test_checksum_with_zero_skips_fragment_payload() {
        let mut packet = build_udp_packet(
            Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2),
            1000, 2000, b"frag",
        );
        packet[6] = 0x20; // MF
        packet[10] = 0;
        packet[11] = 0;
        packet[26] = 0;
        packet[27] = 0;
        checksum_with_zero(&mut packet);
        assert!(ipv4_checksum_valid(&packet));
        assert_eq!(&packet[26..28], &[0, 0]);
    }

    #[test]
    fn test_verify_packet() {
        let packet = build_udp_packet(
            Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2),
            1000, 2000, b"x",
        );
        assert_eq!(verify_packet(&packet), Some(Ipv4Addr::new(10, 0, 0, 2)));

        let mut longer = packet.clone();
        longer.push(0);
        assert_eq!(verify_packet(&longer), None);
        assert_eq!(verify_packet(&packet[..packet.len() - 1]), None);
    }

    #[test]
    fn test_flags() {
        assert!(TcpFlags::syn().is_bare_syn());
        assert!(!TcpFlags::syn_ack().is_bare_syn());
        assert!(TcpFlags::from_byte(0x02 | 0x40 | 0x80).is_bare_syn()); // SYN + ECE + CWR
        assert!(TcpFlags::fin_ack().fin_or_rst());
        assert!(TcpFlags::rst().fin_or_rst());
        assert!(!TcpFlags::psh_ack().fin_or_rst());
        assert_eq!(TcpFlags::from_byte(TcpFlags::psh_ack().to_byte()), TcpFlags::psh_ack());
    }
}

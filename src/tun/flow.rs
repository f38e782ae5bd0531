//! 流表 - 连接追踪
//!
//! 每条被重定向的 TCP 流以 (源 IP, 源端口) 为键，同时登记在原始源端口和
//! 重映射端口两个键下，两个键指向同一个条目。

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// 清理间隔
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// 收到 FIN/RST 后空闲多久移除
pub const FIN_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// 重映射端口范围
const REMAP_PORT_MIN: u16 = 10000;
const REMAP_PORT_MAX: u16 = 65535;
const REMAP_MAX_ATTEMPTS: usize = 1024;

/// 流表键
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct FlowKey {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl FlowKey {
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self { addr, port }
    }
}

/// 流条目
#[derive(Debug)]
pub struct FlowEntry {
    /// 真实目标地址
    pub dst_addr: Ipv4Addr,
    /// 真实目标端口
    pub dst_port: u16,
    /// 原始源端口
    pub src_port: u16,
    /// 重映射后的源端口
    pub remapped_port: u16,
    /// 收到过 FIN 或 RST
    fin_seen: AtomicBool,
    /// 最后活动时间
    last_activity: Mutex<Instant>,
}

impl FlowEntry {
    fn new(dst: SocketAddrV4, src_port: u16, remapped_port: u16) -> Self {
        Self {
            dst_addr: *dst.ip(),
            dst_port: dst.port(),
            src_port,
            remapped_port,
            fin_seen: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn destination(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.dst_addr, self.dst_port)
    }

    pub fn fin_seen(&self) -> bool {
        self.fin_seen.load(Ordering::Acquire)
    }

    pub fn last_activity(&self) -> Instant {
        match self.last_activity.lock() {
            Ok(t) => *t,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// 刷新活动时间，`fin_or_rst` 为真时标记为关闭中
    pub fn touch(&self, fin_or_rst: bool) {
        self.touch_at(fin_or_rst, Instant::now());
    }

    pub(crate) fn touch_at(&self, fin_or_rst: bool, now: Instant) {
        if fin_or_rst {
            self.fin_seen.store(true, Ordering::Release);
        }
        match self.last_activity.lock() {
            Ok(mut t) => *t = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        self.fin_seen() && now.saturating_duration_since(self.last_activity()) >= FIN_IDLE_TIMEOUT
    }
}

/// 流表
#[derive(Default)]
pub struct FlowTable {
    entries: DashMap<FlowKey, Arc<FlowEntry>>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, addr: Ipv4Addr, port: u16) -> Option<Arc<FlowEntry>> {
        self.entries.get(&FlowKey::new(addr, port)).map(|e| e.value().clone())
    }

    /// 为新 SYN 建立条目
    ///
    /// 随机挑选一个与现有键都不冲突的重映射端口（冲突则重新随机），
    /// 然后登记在原始端口和重映射端口两个键下。
    /// 原始键已存在时返回已有条目；原始端口正被另一条流用作重映射端口时返回 None。
    pub fn create(
        &self,
        src_addr: Ipv4Addr,
        src_port: u16,
        dst: SocketAddrV4,
        reserved_port: u16,
    ) -> Option<Arc<FlowEntry>> {
        let mut rng = rand::thread_rng();
        for _ in 0..REMAP_MAX_ATTEMPTS {
            if let Some(existing) = self.get(src_addr, src_port) {
                if existing.src_port == src_port {
                    return Some(existing);
                }
                tracing::debug!(
                    "{}:{} is the remap port of flow {}:{}",
                    src_addr, src_port, src_addr, existing.src_port
                );
                return None;
            }

            let port = rng.gen_range(REMAP_PORT_MIN..=REMAP_PORT_MAX);
            if port == reserved_port || port == src_port {
                continue;
            }
            if let Some(entry) = self.register(src_addr, src_port, port, dst) {
                return Some(entry);
            }
        }
        tracing::warn!("No free remap port for {}:{}", src_addr, src_port);
        None
    }

    /// 以指定的重映射端口登记一条流
    ///
    /// 重映射键已被占用，或原始键是另一条流的重映射键时返回 None。
    /// 同一时刻只持有一个键的分片锁。
    pub(crate) fn register(
        &self,
        src_addr: Ipv4Addr,
        src_port: u16,
        remapped_port: u16,
        dst: SocketAddrV4,
    ) -> Option<Arc<FlowEntry>> {
        let entry = Arc::new(FlowEntry::new(dst, src_port, remapped_port));
        let remap_key = FlowKey::new(src_addr, remapped_port);

        // 先占用重映射键，保证重映射端口在存活条目中唯一
        match self.entries.entry(remap_key) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(v) => {
                v.insert(entry.clone());
            }
        }

        let existing = match self.entries.entry(FlowKey::new(src_addr, src_port)) {
            Entry::Occupied(o) => o.get().clone(),
            Entry::Vacant(v) => {
                v.insert(entry.clone());
                tracing::debug!(
                    "Flow created: {}:{} -> {} (remap {})",
                    src_addr, src_port, dst, remapped_port
                );
                return Some(entry);
            }
        };

        // 分片锁已释放，撤回占用的重映射键
        self.entries.remove_if(&remap_key, |_, e| Arc::ptr_eq(e, &entry));
        (existing.src_port == src_port).then_some(existing)
    }

    /// 删除一条流的两个键，返回删除的键数
    pub fn remove(&self, src_addr: Ipv4Addr, entry: &FlowEntry) -> usize {
        let keys = [
            FlowKey::new(src_addr, entry.src_port),
            FlowKey::new(src_addr, entry.remapped_port),
        ];
        let mut removed = 0;
        for key in keys {
            if self.entries.remove_if(&key, |_, e| std::ptr::eq(e.as_ref(), entry)).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// 清理已关闭且空闲超时的条目，活跃条目不受影响
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// 先收集过期条目，再成对删除两个键
    pub fn sweep_at(&self, now: Instant) -> usize {
        let expired: Vec<(Ipv4Addr, Arc<FlowEntry>)> = self
            .entries
            .iter()
            .filter(|e| e.key().port == e.value().src_port && e.value().expired(now))
            .map(|e| (e.key().addr, e.value().clone()))
            .collect();

        let removed: usize = expired
            .iter()
            .filter(|(_, entry)| entry.expired(now))
            .map(|(addr, entry)| self.remove(*addr, entry))
            .sum();
        if removed > 0 {
            tracing::debug!("Flow sweep removed {} keys, {} left", removed, self.entries.len());
        }
        removed
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// 键数量（每条流占两个键）
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

//! 数据包 hook
//!
//! 每个 hook 在读/写流水线上各有一个优先级，按优先级升序依次执行。
//! hook 返回要添加和要移除的标志位，流水线把它们累加到 `HookFlags` 上，
//! `NEXT` 被清除后停止执行后续 hook。

use std::net::Ipv4Addr;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

/// hook 标志位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HookFlags(u8);

impl HookFlags {
    pub const NONE: Self = Self(0);
    /// 继续执行后续 hook
    pub const NEXT: Self = Self(0b0001);
    /// 读取路径：交给上层回调
    pub const SEND: Self = Self(0b0010);
    /// 写入路径：写入设备
    pub const WRITE: Self = Self(0b0100);
    /// 读取路径：写回设备
    pub const WRITE_BACK: Self = Self(0b1000);

    /// 读取流水线初始值
    pub const READ_INITIAL: Self = Self(Self::NEXT.0 | Self::SEND.0);
    /// 写入流水线初始值
    pub const WRITE_INITIAL: Self = Self(Self::NEXT.0 | Self::WRITE.0);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// 先加后减
    pub fn apply(&mut self, action: HookAction) {
        self.insert(action.add);
        self.remove(action.del);
    }
}

impl BitOr for HookFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for HookFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// hook 的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HookAction {
    pub add: HookFlags,
    pub del: HookFlags,
}

impl HookAction {
    /// 不改变任何标志
    pub const PASS: Self = Self { add: HookFlags::NONE, del: HookFlags::NONE };

    pub fn new(add: HookFlags, del: HookFlags) -> Self {
        Self { add, del }
    }
}

/// hook 优先级，数值越小越先执行
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HookLevel(pub i8);

impl HookLevel {
    pub const HIGHEST: Self = Self(i8::MIN);
    pub const HIGH9: Self = Self(-9);
    pub const NORMAL: Self = Self(0);
    pub const LOW9: Self = Self(9);
    pub const LOWEST: Self = Self(i8::MAX);
}

/// 数据包 hook
///
/// 在读取线程上同步执行，不要在里面做阻塞操作。
pub trait PacketHook: Send + Sync {
    /// 名称，同名 hook 只保留一个
    fn name(&self) -> &str;

    fn read_level(&self) -> HookLevel {
        HookLevel::NORMAL
    }

    fn write_level(&self) -> HookLevel {
        HookLevel::NORMAL
    }

    /// 读取路径，可以原地修改 IP 包（修改后把对应校验和清零）
    fn read(&self, packet: &mut [u8]) -> HookAction;

    /// 写入路径，`origin_dst` 为原始目标地址，`src_id` 为调用方给出的来源标识
    fn write(&self, _packet: &mut [u8], _origin_dst: Ipv4Addr, _src_id: &str) -> HookAction {
        HookAction::PASS
    }
}

/// 已排序的读/写 hook 链
#[derive(Clone, Default)]
pub struct HookChain {
    read: Vec<Arc<dyn PacketHook>>,
    write: Vec<Arc<dyn PacketHook>>,
}

impl HookChain {
    pub fn new(hooks: Vec<Arc<dyn PacketHook>>) -> Self {
        let mut chain = Self::default();
        chain.rebuild(hooks);
        chain
    }

    /// 按名称取并集，新 hook 覆盖同名旧 hook，然后重新排序
    pub fn add(&mut self, hooks: Vec<Arc<dyn PacketHook>>) {
        let mut merged = hooks;
        for existing in &self.read {
            if !merged.iter().any(|h| h.name() == existing.name()) {
                merged.push(existing.clone());
            }
        }
        self.rebuild(merged);
    }

    fn rebuild(&mut self, hooks: Vec<Arc<dyn PacketHook>>) {
        let mut read = hooks.clone();
        read.sort_by(|a, b| a.read_level().cmp(&b.read_level()));
        let mut write = hooks;
        write.sort_by(|a, b| a.write_level().cmp(&b.write_level()));
        self.read = read;
        self.write = write;
    }

    pub fn len(&self) -> usize {
        self.read.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.read.iter().map(|h| h.name().to_string()).collect()
    }

    /// 执行读取链
    pub fn run_read(&self, packet: &mut [u8]) -> HookFlags {
        let mut flags = HookFlags::READ_INITIAL;
        for hook in &self.read {
            flags.apply(hook.read(packet));
            if !flags.contains(HookFlags::NEXT) {
                tracing::trace!("Read chain stopped by hook {}", hook.name());
                break;
            }
        }
        flags
    }

    /// 执行写入链
    pub fn run_write(&self, packet: &mut [u8], origin_dst: Ipv4Addr, src_id: &str) -> HookFlags {
        let mut flags = HookFlags::WRITE_INITIAL;
        for hook in &self.write {
            flags.apply(hook.write(packet, origin_dst, src_id));
            if !flags.contains(HookFlags::NEXT) {
                tracing::trace!("Write chain stopped by hook {}", hook.name());
                break;
            }
        }
        flags
    }
}

impl std::fmt::Debug for HookChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookChain").field("hooks", &self.names()).finish()
    }
}

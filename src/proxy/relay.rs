/// 数据转发模块
///
/// 两个方向各一个拷贝循环，任意一个方向结束（EOF 或出错）都会关闭两端。

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};
use std::io;

/// 缓冲配置
const BUFFER_SIZE: usize = 32 * 1024;

/// 转发结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub local_to_remote: u64,
    pub remote_to_local: u64,
}

/// 双向转发数据
///
/// 不设超时，依赖对端关闭。返回时两端都已被丢弃。
pub async fn relay_bidirectional<L, R>(local: L, remote: R) -> RelayStats
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let mut stats = RelayStats::default();

    let finished = tokio::select! {
        result = copy_one_way(&mut local_read, &mut remote_write, &mut stats.local_to_remote) => {
            ("local->remote", result)
        }
        result = copy_one_way(&mut remote_read, &mut local_write, &mut stats.remote_to_local) => {
            ("remote->local", result)
        }
    };

    match finished {
        (direction, Ok(())) => trace!("{}: EOF reached", direction),
        (direction, Err(e)) => trace!("{}: {}", direction, e),
    }

    // 另一方向可能还在等待，主动关闭写端
    let _ = local_write.shutdown().await;
    let _ = remote_write.shutdown().await;

    debug!(
        "Relay finished: {} bytes local->remote, {} bytes remote->local",
        stats.local_to_remote, stats.remote_to_local
    );
    stats
}

/// 单向转发
async fn copy_one_way<R, W>(reader: &mut R, writer: &mut W, total: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buffer[..n]).await?;
        writer.flush().await?;
        *total += n as u64;
    }
}

use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::util::timeout_with_context;

/// Reads once from `stream`; a read that stalls past `timeout` is an error.
pub async fn read_with_timeout<S>(
    stream: &mut S,
    buf: &mut [u8],
    timeout: Duration,
    context: &str,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    timeout_with_context(timeout, stream.read(buf), context).await
}

/// Writes all of `bytes`, bounding the whole write by `timeout`.
pub async fn write_all_with_timeout<S>(
    stream: &mut S,
    bytes: &[u8],
    timeout: Duration,
    context: &str,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    timeout_with_context(timeout, stream.write_all(bytes), context).await
}

//! What a peer does with a punched connection.
//!
//! The requesting side chats: each stdin line goes to the counterparty and
//! the response is printed. The waiting side echoes back whatever it reads.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

const READ_BUF: usize = 512;

/// Send each line from `input` and print the reply. Returns when `input`
/// ends.
pub async fn chat<S, I>(stream: &mut S, peer: &str, input: I) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    I: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    let mut buf = vec![0u8; READ_BUF];

    println!("connected to {peer}, type messages and press enter");
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        stream
            .write_all(format!("{line}\n").as_bytes())
            .await
            .context("failed to send message")?;

        let n = stream.read(&mut buf).await.context("failed to read response")?;
        if n == 0 {
            bail!("{peer} closed the connection");
        }
        print!("[{peer}] {}", String::from_utf8_lossy(&buf[..n]));
    }
    Ok(())
}

/// Echo everything read from `stream` back to it until EOF. Returns the
/// number of bytes echoed.
pub async fn echo<S>(stream: &mut S, peer: &str) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; READ_BUF];
    let mut total = 0u64;
    loop {
        let n = stream
            .read(&mut buf)
            .await
            .with_context(|| format!("failed to read from {peer}"))?;
        if n == 0 {
            tracing::info!(%peer, bytes = total, "peer hung up");
            return Ok(total);
        }
        let message = String::from_utf8_lossy(&buf[..n]);
        tracing::debug!(%peer, message = %message.trim_end(), "received");
        stream
            .write_all(&buf[..n])
            .await
            .with_context(|| format!("failed to respond to {peer}"))?;
        total += n as u64;
    }
}

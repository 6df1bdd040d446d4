//! Frame I/O — the length-prefixed wire format underneath everything else:
//! `size: i64 (big-endian) || payload: size bytes`.
//!
//! Grounded directly on the original `nets.Write`/`nets.Read`: the same
//! precondition checks (`NoConnection`/`NoConfig`/`NoData`), the same
//! `OversizeFrame` check before the body is read, and the same
//! connection-close-on-decrypt-failure behavior. The one deliberate
//! departure is `ReadSize`'s 1-second sleep on a zero-byte read — this
//! crate uses `tokio::io::AsyncReadExt::read_exact`, which already
//! suspends the task on the reactor instead of spinning, so there is
//! nothing to back off from (SPEC_FULL §9, Open Question 2).

use mesh_core::{SecurityProvider, SystemConfig};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RuntimeError;

/// Write one frame: `bytes` preceded by its 8-byte big-endian length.
/// Fails `NoConnection`/`NoConfig`/`NoData` on missing inputs and
/// `OversizeFrame` if `bytes` exceeds `cfg.max_data_size`.
pub async fn write<C>(
    conn: Option<&mut C>,
    bytes: Option<&[u8]>,
    cfg: Option<&SystemConfig>,
) -> Result<(), RuntimeError>
where
    C: AsyncWrite + Unpin,
{
    let conn = conn.ok_or(RuntimeError::NoConnection)?;
    let bytes = bytes.ok_or(RuntimeError::NoData)?;
    let cfg = cfg.ok_or(RuntimeError::NoConfig)?;

    if bytes.len() as u64 > cfg.max_data_size {
        return Err(RuntimeError::OversizeFrame {
            got: bytes.len() as u64,
            max: cfg.max_data_size,
        });
    }

    conn.write_all(&(bytes.len() as i64).to_be_bytes()).await?;
    conn.write_all(bytes).await?;
    Ok(())
}

/// Read one frame, enforcing `cfg.max_data_size` before the body is read.
pub async fn read<C>(conn: Option<&mut C>, cfg: Option<&SystemConfig>) -> Result<Vec<u8>, RuntimeError>
where
    C: AsyncRead + Unpin,
{
    let conn = conn.ok_or(RuntimeError::NoConnection)?;
    let cfg = cfg.ok_or(RuntimeError::NoConfig)?;

    let mut size_buf = [0u8; 8];
    read_exact_or_short(conn, &mut size_buf).await?;
    let size = i64::from_be_bytes(size_buf);

    if size < 0 || size as u64 > cfg.max_data_size {
        return Err(RuntimeError::OversizeFrame {
            got: size.max(0) as u64,
            max: cfg.max_data_size,
        });
    }

    let mut data = vec![0u8; size as usize];
    read_exact_or_short(conn, &mut data).await?;
    Ok(data)
}

async fn read_exact_or_short<C>(conn: &mut C, buf: &mut [u8]) -> Result<(), RuntimeError>
where
    C: AsyncRead + Unpin,
{
    match conn.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(RuntimeError::ShortFrame),
        Err(e) => Err(RuntimeError::Io(e)),
    }
}

/// `write`, with the payload run through `security.encrypt` first.
pub async fn write_encrypted<C>(
    conn: Option<&mut C>,
    bytes: Option<&[u8]>,
    cfg: Option<&SystemConfig>,
    security: &dyn SecurityProvider,
) -> Result<(), RuntimeError>
where
    C: AsyncWrite + Unpin,
{
    let bytes = bytes.ok_or(RuntimeError::NoData)?;
    let encrypted = security.encrypt(bytes).map_err(RuntimeError::Encryption)?;
    write(conn, Some(encrypted.as_bytes()), cfg).await
}

/// `read`, with the frame run through `security.decrypt` before
/// returning it. Any decryption error is surfaced as-is; closing the
/// connection on that error is the caller's responsibility (the reader
/// task owns the connection, this function only owns the one read).
pub async fn read_encrypted_bytes<C>(
    conn: Option<&mut C>,
    cfg: Option<&SystemConfig>,
    security: &dyn SecurityProvider,
) -> Result<Vec<u8>, RuntimeError>
where
    C: AsyncRead + Unpin,
{
    let raw = read(conn, cfg).await?;
    let text = std::str::from_utf8(&raw).map_err(|_| RuntimeError::Decryption(
        mesh_core::CryptoError::InvalidEncoding,
    ))?;
    security.decrypt(text).map_err(RuntimeError::Decryption)
}

/// Same as [`read_encrypted_bytes`], but for steps whose plaintext is
/// itself a UTF-8 string (handshake steps 1/2/3/5).
pub async fn read_encrypted<C>(
    conn: Option<&mut C>,
    cfg: Option<&SystemConfig>,
    security: &dyn SecurityProvider,
) -> Result<String, RuntimeError>
where
    C: AsyncRead + Unpin,
{
    let bytes = read_encrypted_bytes(conn, cfg, security).await?;
    String::from_utf8(bytes).map_err(|_| RuntimeError::Decryption(mesh_core::CryptoError::InvalidEncoding))
}

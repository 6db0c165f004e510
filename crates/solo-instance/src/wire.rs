//! Wire contract between a secondary launch and the primary.
//!
//! Request: `[u32 LE frame len][payload]` where the default payload is
//! `[u8 version][u32 LE count][per string: u32 LE len + UTF-8 bytes]`.
//! Response: exactly 4 bytes, little-endian signed 32-bit exit code.
//! Everything is explicitly little-endian so foreign runtimes can speak it.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Current payload encoding version.
pub const FRAME_VERSION: u8 = 1;

/// Outer frame header: payload length as `u32` LE.
pub const HEADER_SIZE: usize = size_of::<u32>();

/// Sanity caps. Anything beyond these is a malformed or hostile frame, not a
/// real command line.
pub const MAX_ARGS: u32 = 4096;
pub const MAX_FRAME_BYTES: u32 = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unsupported frame version {found} (expected {FRAME_VERSION})")]
    Version { found: u8 },
    #[error("frame of {len} bytes exceeds the {max} byte cap")]
    Oversized { len: u32, max: u32 },
    #[error("argument count {count} exceeds the {MAX_ARGS} cap")]
    TooManyArgs { count: u32 },
    #[error("frame truncated while reading {what}")]
    Truncated { what: &'static str },
    #[error("argument is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Pluggable encoding of the argument vector. The frame length header and the
/// 4-byte response stay fixed regardless of codec.
pub trait ArgvCodec: Send + Sync + 'static {
    fn encode(&self, args: &[String]) -> Result<Vec<u8>, WireError>;
    fn decode(&self, payload: &[u8]) -> Result<Vec<String>, WireError>;
}

/// Default codec: versioned, length-prefixed string sequence.
#[derive(Debug, Default, Clone, Copy)]
pub struct LengthPrefixCodec;

impl ArgvCodec for LengthPrefixCodec {
    fn encode(&self, args: &[String]) -> Result<Vec<u8>, WireError> {
        let count = u32::try_from(args.len()).map_err(|_| WireError::TooManyArgs {
            count: u32::MAX,
        })?;
        if count > MAX_ARGS {
            return Err(WireError::TooManyArgs { count });
        }

        let mut buf = Vec::with_capacity(
            1 + size_of::<u32>() + args.iter().map(|a| a.len() + size_of::<u32>()).sum::<usize>(),
        );
        buf.push(FRAME_VERSION);
        buf.extend_from_slice(&count.to_le_bytes());
        for arg in args {
            let len = arg.len() as u32;
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(arg.as_bytes());
        }
        Ok(buf)
    }

    fn decode(&self, payload: &[u8]) -> Result<Vec<String>, WireError> {
        let mut cursor = payload;

        let version = take(&mut cursor, 1, "version")?[0];
        if version != FRAME_VERSION {
            return Err(WireError::Version { found: version });
        }

        let count = u32::from_le_bytes(take(&mut cursor, 4, "count")?.try_into().unwrap());
        if count > MAX_ARGS {
            return Err(WireError::TooManyArgs { count });
        }

        let mut args = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len =
                u32::from_le_bytes(take(&mut cursor, 4, "string length")?.try_into().unwrap());
            let bytes = take(&mut cursor, len as usize, "string bytes")?;
            args.push(String::from_utf8(bytes.to_vec())?);
        }
        Ok(args)
    }
}

fn take<'a>(cursor: &mut &'a [u8], n: usize, what: &'static str) -> Result<&'a [u8], WireError> {
    if cursor.len() < n {
        return Err(WireError::Truncated { what });
    }
    let (head, tail) = cursor.split_at(n);
    *cursor = tail;
    Ok(head)
}

/// Write one request frame and flush. The flush is the drain point: after it
/// returns, the whole request is on its way to the primary.
pub async fn write_request<W, C>(writer: &mut W, codec: &C, args: &[String]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    C: ArgvCodec + ?Sized,
{
    let payload = codec.encode(args)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_BYTES {
        return Err(WireError::Oversized {
            len,
            max: MAX_FRAME_BYTES,
        });
    }
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one request frame off the stream and decode it.
pub async fn read_request<R, C>(reader: &mut R, codec: &C) -> Result<Vec<String>, WireError>
where
    R: AsyncRead + Unpin,
    C: ArgvCodec + ?Sized,
{
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_BYTES {
        return Err(WireError::Oversized {
            len,
            max: MAX_FRAME_BYTES,
        });
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    codec.decode(&payload)
}

/// Write the fixed 4-byte exit code response and flush.
pub async fn write_response<W>(writer: &mut W, code: i32) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&code.to_le_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the fixed 4-byte exit code response.
pub async fn read_response<R>(reader: &mut R) -> Result<i32, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes).await?;
    Ok(i32::from_le_bytes(bytes))
}

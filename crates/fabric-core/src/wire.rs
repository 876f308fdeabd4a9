//! Length-prefixed framing
//!
//! Every frame on a fabric socket is a big-endian `i32` byte count followed
//! by that many bytes. A zero-length frame is a legal empty body.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{FabricResult, ProtocolError};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Size of the length prefix
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest body a peer may declare
pub const MAX_FRAME_LEN: usize = 100_000_000;

// ----------------------------------------------------------------------------
// Frame Codec
// ----------------------------------------------------------------------------

/// Validate a declared body length
pub fn validate_frame_length(declared: i32) -> Result<usize, ProtocolError> {
    if declared < 0 || declared as i64 > MAX_FRAME_LEN as i64 {
        return Err(ProtocolError::InvalidFrameLength {
            declared: declared as i64,
            max: MAX_FRAME_LEN,
        });
    }
    Ok(declared as usize)
}

/// Prefix a body with its length
pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::InvalidFrameLength {
            declared: body.len() as i64,
            max: MAX_FRAME_LEN,
        });
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as i32).to_be_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Read one frame body
pub async fn read_frame<R>(reader: &mut R) -> FabricResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let declared = reader.read_i32().await?;
    let len = validate_frame_length(declared)?;

    let mut body = vec![0u8; len];
    if len > 0 {
        reader.read_exact(&mut body).await?;
    }
    Ok(body)
}

/// Write one frame and flush it
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> FabricResult<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(body)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FabricError;

    #[test]
    fn test_length_bounds() {
        assert_eq!(validate_frame_length(0).unwrap(), 0);
        assert_eq!(validate_frame_length(100_000_000).unwrap(), MAX_FRAME_LEN);
        assert!(validate_frame_length(-1).is_err());
        assert!(validate_frame_length(100_000_001).is_err());
    }

    #[test]
    fn test_encode_prefixes_big_endian_length() {
        let frame = encode_frame(b"abc").unwrap();
        assert_eq!(&frame[..4], &[0, 0, 0, 3]);
        assert_eq!(&frame[4..], b"abc");
    }

    #[tokio::test]
    async fn test_frames_over_duplex_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, b"hello").await.unwrap();
        write_frame(&mut client, b"").await.unwrap();

        assert_eq!(read_frame(&mut server).await.unwrap(), b"hello");
        assert!(read_frame(&mut server).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_negative_length_is_protocol_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&(-5i32).to_be_bytes()).await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(
            err,
            FabricError::Protocol(ProtocolError::InvalidFrameLength { declared: -5, .. })
        ));
    }
}

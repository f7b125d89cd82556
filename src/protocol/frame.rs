//! Frame extraction: exactly one complete wire message per call, using the
//! header's length field. Returned frames include the 16 header bytes so the
//! body codecs can start at their documented offsets.

use crate::error::{Error, Result};
use crate::protocol::{MessageHeader, HEADER_LEN, MAX_MESSAGE_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read one framed message. `Ok(None)` means the peer closed the stream at a
/// frame boundary; EOF anywhere inside a frame is a truncation error.
pub async fn read_frame<R>(stream: &mut R) -> Result<Option<(MessageHeader, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_LEN];
    let mut filled = 0usize;
    while filled < HEADER_LEN {
        let n = stream.read(&mut header_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::TruncatedFrame {
                offset: filled,
                needed: HEADER_LEN - filled,
            });
        }
        filled += n;
    }

    let (header, _) = MessageHeader::parse(&header_buf).expect("16 bytes buffered");
    if header.message_length < HEADER_LEN as i32 || header.message_length > MAX_MESSAGE_SIZE {
        return Err(Error::OversizedFrame(header.message_length));
    }

    let mut frame = vec![0u8; header.message_length as usize];
    frame[..HEADER_LEN].copy_from_slice(&header_buf);
    if let Err(e) = stream.read_exact(&mut frame[HEADER_LEN..]).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(Error::TruncatedFrame {
                offset: HEADER_LEN,
                needed: header.message_length as usize - HEADER_LEN,
            });
        }
        return Err(e.into());
    }
    Ok(Some((header, frame)))
}

pub async fn write_frame<W>(stream: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(frame).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{encode_op_msg, encode_op_reply};
    use crate::protocol::OpCode;
    use bson::doc;

    #[tokio::test]
    async fn extracts_concatenated_frames_in_order_without_residue() {
        let a = encode_op_msg(&doc! { "ping": 1i32 }, 0, 1);
        let b = encode_op_reply(&[doc! { "ok": 1.0 }], 0, 1, 2);
        let mut stream: &[u8] = &[a.clone(), b.clone()].concat();

        let (hdr_a, frame_a) = read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(hdr_a.op_code, OpCode::Msg as i32);
        assert_eq!(frame_a, a);

        let (hdr_b, frame_b) = read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(hdr_b.op_code, OpCode::Reply as i32);
        assert_eq!(frame_b, b);

        assert!(read_frame(&mut stream).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clean_eof_is_not_an_error() {
        let mut stream: &[u8] = &[];
        assert!(read_frame(&mut stream).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_header_is_truncation() {
        let frame = encode_op_msg(&doc! { "ping": 1i32 }, 0, 1);
        let mut stream: &[u8] = &frame[..7];
        assert!(matches!(
            read_frame(&mut stream).await,
            Err(Error::TruncatedFrame { .. })
        ));
    }

    #[tokio::test]
    async fn eof_inside_body_is_truncation() {
        let frame = encode_op_msg(&doc! { "ping": 1i32 }, 0, 1);
        let mut stream: &[u8] = &frame[..frame.len() - 3];
        assert!(matches!(
            read_frame(&mut stream).await,
            Err(Error::TruncatedFrame { .. })
        ));
    }

    #[tokio::test]
    async fn oversized_and_undersized_lengths_are_fatal() {
        for bad_len in [15i32, MAX_MESSAGE_SIZE + 1] {
            let mut buf = Vec::new();
            MessageHeader {
                message_length: bad_len,
                request_id: 1,
                response_to: 0,
                op_code: OpCode::Msg as i32,
            }
            .encode(&mut buf);
            let mut stream: &[u8] = &buf;
            assert!(matches!(
                read_frame(&mut stream).await,
                Err(Error::OversizedFrame(l)) if l == bad_len
            ));
        }
    }
}

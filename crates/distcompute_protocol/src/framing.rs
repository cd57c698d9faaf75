//! Length-prefixed, optionally-compressed, chunked wire framing.
//!
//! Wire unit: `[4-byte BE length][1-byte flags][body]`. Flag bit 0 means
//! the body is zlib-compressed; all other bits are reserved and must be
//! zero. A logical [`Message`] larger than [`defaults::MAX_CHUNK_SIZE`] is
//! split into a `CHUNK_START`/`CHUNK_DATA`×N/`CHUNK_END` sequence whose
//! inner bytes concatenate back into a single re-materialized frame (its
//! own length+flags+body), which is then decoded as the logical message.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::defaults::{COMPRESSION_LEVEL, COMPRESSION_THRESHOLD, MAX_CHUNK_SIZE};
use crate::error::{FramingError, Result};
use crate::types::{
    ChunkDataPayload, ChunkEndPayload, ChunkStartPayload, Message, MessageKind,
};

const FLAG_COMPRESSED: u8 = 0x01;
const RESERVED_FLAG_MASK: u8 = !FLAG_COMPRESSED;

fn compress_body(body: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(COMPRESSION_LEVEL));
    encoder
        .write_all(body)
        .expect("writing to an in-memory buffer cannot fail");
    encoder
        .finish()
        .expect("flushing an in-memory buffer cannot fail")
}

fn decompress_body(body: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(body);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Send a logical message. `force_compress` overrides the size-adaptive
/// decision (`Some(true)`/`Some(false)`); `None` compresses iff the
/// serialized body exceeds [`COMPRESSION_THRESHOLD`].
pub async fn send<W: AsyncWrite + Unpin>(
    stream: &mut W,
    msg: &Message,
    force_compress: Option<bool>,
) -> Result<()> {
    let raw_body = bincode::serialize(msg)?;
    let compress = force_compress.unwrap_or_else(|| raw_body.len() > COMPRESSION_THRESHOLD);
    let inner_frame = build_frame(&raw_body, compress);

    if inner_frame.len() <= MAX_CHUNK_SIZE {
        stream.write_all(&inner_frame).await?;
        return Ok(());
    }

    send_chunked(stream, msg.kind(), inner_frame).await
}

fn build_frame(raw_body: &[u8], compress: bool) -> Vec<u8> {
    let (flags, payload) = if compress {
        (FLAG_COMPRESSED, compress_body(raw_body))
    } else {
        (0u8, raw_body.to_vec())
    };
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.push(flags);
    frame.extend_from_slice(&payload);
    frame
}

/// Send a single message as its own uncompressed framed unit, bypassing
/// the chunk-size check. Used only for the `CHUNK_START`/`CHUNK_DATA`/
/// `CHUNK_END` envelopes, which must never be compressed or re-chunked —
/// their payload was already compressed (if at all) inside the inner
/// frame they carry.
async fn send_raw<W: AsyncWrite + Unpin>(stream: &mut W, msg: &Message) -> Result<()> {
    let raw_body = bincode::serialize(msg)?;
    let frame = build_frame(&raw_body, false);
    stream.write_all(&frame).await?;
    Ok(())
}

async fn send_chunked<W: AsyncWrite + Unpin>(
    stream: &mut W,
    original_kind: MessageKind,
    inner_frame: Vec<u8>,
) -> Result<()> {
    let total_size = inner_frame.len() as u64;
    let num_chunks = inner_frame.len().div_ceil(MAX_CHUNK_SIZE) as u32;

    send_raw(
        stream,
        &Message::ChunkStart(ChunkStartPayload {
            original_kind,
            total_size,
            num_chunks,
        }),
    )
    .await?;

    for (chunk_num, chunk) in inner_frame.chunks(MAX_CHUNK_SIZE).enumerate() {
        send_raw(
            stream,
            &Message::ChunkData(ChunkDataPayload {
                chunk_num: chunk_num as u32,
                bytes: chunk.to_vec(),
            }),
        )
        .await?;
    }

    send_raw(stream, &Message::ChunkEnd(ChunkEndPayload { original_kind })).await
}

async fn read_exact_mapped<R: AsyncRead + Unpin>(stream: &mut R, buf: &mut [u8]) -> Result<()> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(FramingError::ConnectionLost),
        Err(e) => Err(FramingError::Io(e)),
    }
}

/// Read exactly one wire unit `(flags, body)`. Short reads are looped
/// transparently by `AsyncReadExt::read_exact` until the requested byte
/// count is delivered or the peer closes the connection.
async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<(u8, Vec<u8>)> {
    let mut len_buf = [0u8; 4];
    read_exact_mapped(stream, &mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    let mut flags_buf = [0u8; 1];
    read_exact_mapped(stream, &mut flags_buf).await?;

    let mut body = vec![0u8; len];
    read_exact_mapped(stream, &mut body).await?;

    Ok((flags_buf[0], body))
}

fn decode_payload(flags: u8, body: &[u8]) -> Result<Vec<u8>> {
    if flags & RESERVED_FLAG_MASK != 0 {
        return Err(FramingError::protocol_violation(format!(
            "reserved flag bits set: {flags:#04x}"
        )));
    }
    if flags & FLAG_COMPRESSED != 0 {
        decompress_body(body)
    } else {
        Ok(body.to_vec())
    }
}

/// Receive exactly one logical message, transparently reassembling a
/// chunked transfer if the first frame is a `CHUNK_START`.
pub async fn receive<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Message> {
    let (flags, body) = read_frame(stream).await?;
    let raw = decode_payload(flags, &body)?;
    let msg: Message = bincode::deserialize(&raw)?;

    match msg.kind() {
        MessageKind::ChunkStart => receive_chunked(stream, msg).await,
        MessageKind::ChunkData | MessageKind::ChunkEnd => Err(FramingError::protocol_violation(
            format!("unexpected {:?} outside a chunked transfer", msg.kind()),
        )),
        _ => Ok(msg),
    }
}

async fn receive_chunked<R: AsyncRead + Unpin>(
    stream: &mut R,
    start_msg: Message,
) -> Result<Message> {
    let start = match start_msg {
        Message::ChunkStart(payload) => payload,
        _ => unreachable!("caller only invokes this for CHUNK_START"),
    };

    let mut chunks: Vec<Option<Vec<u8>>> = vec![None; start.num_chunks as usize];

    for _ in 0..start.num_chunks {
        let (flags, body) = read_frame(stream).await?;
        let raw = decode_payload(flags, &body)?;
        let msg: Message = bincode::deserialize(&raw)?;
        match msg {
            Message::ChunkData(chunk) => {
                let idx = chunk.chunk_num as usize;
                let slot = chunks.get_mut(idx).ok_or_else(|| {
                    FramingError::protocol_violation(format!(
                        "chunk_num {idx} out of range (expected < {})",
                        start.num_chunks
                    ))
                })?;
                *slot = Some(chunk.bytes);
            }
            other => {
                return Err(FramingError::protocol_violation(format!(
                    "expected CHUNK_DATA, got {:?}",
                    other.kind()
                )))
            }
        }
    }

    let (flags, body) = read_frame(stream).await?;
    let raw = decode_payload(flags, &body)?;
    match bincode::deserialize(&raw)? {
        Message::ChunkEnd(end) if end.original_kind == start.original_kind => {}
        Message::ChunkEnd(end) => {
            return Err(FramingError::protocol_violation(format!(
                "CHUNK_END kind mismatch: expected {:?}, got {:?}",
                start.original_kind, end.original_kind
            )))
        }
        other => {
            return Err(FramingError::protocol_violation(format!(
                "expected CHUNK_END, got {:?}",
                other.kind()
            )))
        }
    }

    let mut full = Vec::with_capacity(start.total_size as usize);
    for (idx, chunk) in chunks.into_iter().enumerate() {
        let chunk = chunk
            .ok_or_else(|| FramingError::protocol_violation(format!("missing chunk {idx}")))?;
        full.extend_from_slice(&chunk);
    }
    if full.len() as u64 != start.total_size {
        return Err(FramingError::protocol_violation(format!(
            "reassembled {} bytes, expected {}",
            full.len(),
            start.total_size
        )));
    }

    decode_rematerialized_frame(&full)
}

/// Decode a frame that was reassembled in memory rather than read directly
/// off the wire (its length/flags/body have already been validated by the
/// chunk accounting above, so this only re-derives them).
fn decode_rematerialized_frame(full: &[u8]) -> Result<Message> {
    if full.len() < 5 {
        return Err(FramingError::protocol_violation(
            "reassembled frame shorter than the 5-byte header",
        ));
    }
    let inner_len = u32::from_be_bytes(full[0..4].try_into().unwrap()) as usize;
    let inner_flags = full[4];
    let inner_body = &full[5..];
    if inner_body.len() != inner_len {
        return Err(FramingError::protocol_violation(format!(
            "reassembled body length {} does not match header {}",
            inner_body.len(),
            inner_len
        )));
    }
    let raw = decode_payload(inner_flags, inner_body)?;
    Ok(bincode::deserialize(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ArgValue, FunctionId, TaskAssignmentPayload, TaskId};

    async fn round_trip(msg: Message, force_compress: Option<bool>) -> Message {
        let mut buf = Vec::new();
        send(&mut buf, &msg, force_compress).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        receive(&mut cursor).await.unwrap()
    }

    #[tokio::test]
    async fn small_message_round_trips_uncompressed() {
        let msg = Message::Shutdown;
        let got = round_trip(msg, None).await;
        assert!(matches!(got, Message::Shutdown));
    }

    #[tokio::test]
    async fn large_message_is_compressed_by_default() {
        let arg = ArgValue::IntVec(vec![7; 200_000]); // well over 512 KiB raw
        let msg = Message::TaskAssignment(TaskAssignmentPayload {
            task_id: TaskId::new(),
            function: FunctionId::new("identity"),
            arg,
        });
        let got = round_trip(msg.clone(), None).await;
        match (msg, got) {
            (Message::TaskAssignment(a), Message::TaskAssignment(b)) => {
                assert_eq!(a.task_id, b.task_id);
                assert_eq!(a.arg, b.arg);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn forced_compression_round_trips() {
        let msg = Message::WorkerRegistered(crate::types::WorkerRegisteredPayload {
            worker_id: crate::types::WorkerId::new(),
        });
        let got = round_trip(msg, Some(true)).await;
        assert!(matches!(got, Message::WorkerRegistered(_)));
    }

    #[tokio::test]
    async fn chunked_message_round_trips() {
        // ~8 MiB of payload, comfortably over MAX_CHUNK_SIZE even after
        // the bincode envelope, and large enough to trigger compression.
        let big = ArgValue::IntVec(vec![42; 2_000_000]);
        let msg = Message::TaskResult(crate::types::TaskResultPayload {
            task_id: TaskId::new(),
            value: big,
        });

        let mut buf = Vec::new();
        send(&mut buf, &msg, None).await.unwrap();
        // Must have gone out as more than one frame.
        assert!(buf.len() > MAX_CHUNK_SIZE);

        let mut cursor = std::io::Cursor::new(buf);
        let got = receive(&mut cursor).await.unwrap();
        match got {
            Message::TaskResult(r) => match r.value {
                ArgValue::IntVec(v) => assert_eq!(v.len(), 2_000_000),
                _ => panic!("wrong arg value"),
            },
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn connection_lost_on_clean_close_between_messages() {
        let cursor = std::io::Cursor::new(Vec::<u8>::new());
        let mut reader = cursor;
        let err = receive(&mut reader).await.unwrap_err();
        assert!(matches!(err, FramingError::ConnectionLost));
    }

    #[tokio::test]
    async fn connection_lost_mid_frame() {
        // Claim a 100-byte body but only provide 10 bytes, no flags byte.
        let mut buf = Vec::new();
        buf.extend_from_slice(&100u32.to_be_bytes());
        buf.push(0);
        buf.extend_from_slice(&[0u8; 10]);
        let mut cursor = std::io::Cursor::new(buf);
        let err = receive(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FramingError::ConnectionLost));
    }

    #[tokio::test]
    async fn reserved_flag_bits_are_a_protocol_violation() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.push(0x02); // reserved bit set
        let mut cursor = std::io::Cursor::new(buf);
        let err = receive(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FramingError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn chunk_data_out_of_order_arrival_still_reassembles_by_index() {
        // Build a CHUNK_START + two CHUNK_DATA (reversed) + CHUNK_END by hand
        // to prove reassembly is index-based, not arrival-order-based.
        let status = Message::WorkerStatus(crate::types::WorkerStatusPayload {
            worker_id: crate::types::WorkerId::new(),
            counters: Default::default(),
        });
        let inner_payload = bincode::serialize(&status).unwrap();
        let inner_frame = build_frame(&inner_payload, false);
        // Force tiny chunk size by hand-slicing instead of relying on MAX_CHUNK_SIZE.
        let split = inner_frame.len() / 2;
        let (first_half, second_half) = inner_frame.split_at(split);

        let mut buf = Vec::new();
        send_raw(
            &mut buf,
            &Message::ChunkStart(ChunkStartPayload {
                original_kind: MessageKind::WorkerStatus,
                total_size: inner_frame.len() as u64,
                num_chunks: 2,
            }),
        )
        .await
        .unwrap();
        // Send chunk 1 before chunk 0.
        send_raw(
            &mut buf,
            &Message::ChunkData(ChunkDataPayload {
                chunk_num: 1,
                bytes: second_half.to_vec(),
            }),
        )
        .await
        .unwrap();
        send_raw(
            &mut buf,
            &Message::ChunkData(ChunkDataPayload {
                chunk_num: 0,
                bytes: first_half.to_vec(),
            }),
        )
        .await
        .unwrap();
        send_raw(
            &mut buf,
            &Message::ChunkEnd(ChunkEndPayload {
                original_kind: MessageKind::WorkerStatus,
            }),
        )
        .await
        .unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let got = receive(&mut cursor).await.unwrap();
        match got {
            Message::WorkerStatus(_) => {}
            other => panic!("expected WorkerStatus, got {:?}", other.kind()),
        }
    }
}

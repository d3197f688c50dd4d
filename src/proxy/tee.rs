//! Stream tee with content decoding
//!
//! Sits on each forwarded body: bytes from the source stream go to the
//! peer verbatim through a bounded channel, and a copy goes into an
//! in-memory pipe whose far end decodes the configured `Content-Encoding`
//! and feeds the capture record in 8 KiB chunks. The capture side can
//! lag (the pipe backpressures the decoder) but never drops bytes and
//! never stalls the peer copy ahead of it.

use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use flate2::read::{DeflateDecoder, MultiGzDecoder};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::io::SyncIoBridge;
use tracing::debug;

use crate::capture::{CaptureRecord, DataType};

/// Decoded read granularity fed to the record.
const DECODE_CHUNK_SIZE: usize = 8192;

/// Pipe capacity between the forwarding copy and the decoder.
const PIPE_CAPACITY: usize = 64 * 1024;

/// In-flight chunks buffered toward the peer.
const FORWARD_CHANNEL_CAPACITY: usize = 32;

/// Splits `source` into a forwarded stream (the returned receiver) and a
/// decoded capture feed onto `record`.
///
/// The capture feed calls `report_chunk` per decoded chunk, `report_end`
/// at EOF, and `report_error` on source or decode failures. A vanished
/// peer (receiver dropped) ends the tee; the decoder then sees EOF.
pub fn spawn_tee(
    source: BoxStream<'static, Result<Bytes, std::io::Error>>,
    record: Arc<CaptureRecord>,
    direction: DataType,
    content_encoding: Option<String>,
) -> mpsc::Receiver<Result<Bytes, std::io::Error>> {
    let (forward_tx, forward_rx) = mpsc::channel(FORWARD_CHANNEL_CAPACITY);
    let (pipe_writer, pipe_reader) = tokio::io::duplex(PIPE_CAPACITY);

    let decode_record = Arc::clone(&record);
    tokio::task::spawn_blocking(move || {
        decode_into_record(pipe_reader, decode_record, direction, content_encoding);
    });

    tokio::spawn(pump(source, forward_tx, pipe_writer, record, direction));

    forward_rx
}

async fn pump(
    mut source: BoxStream<'static, Result<Bytes, std::io::Error>>,
    forward_tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
    pipe_writer: DuplexStream,
    record: Arc<CaptureRecord>,
    direction: DataType,
) {
    let mut pipe = Some(pipe_writer);
    while let Some(item) = source.next().await {
        match item {
            Ok(chunk) => {
                // Peer first: capture never gates forwarding.
                if forward_tx.send(Ok(chunk.clone())).await.is_err() {
                    debug!("forward side closed, ending tee");
                    // A vanished client mid-response is a write error; a
                    // dropped request body means the sender already
                    // reported the real failure.
                    if direction == DataType::ResponseBody {
                        record.report_error(&"client closed before response completed");
                    }
                    break;
                }
                if let Some(writer) = pipe.as_mut() {
                    if writer.write_all(&chunk).await.is_err() {
                        // Decoder bailed out; keep forwarding without capture.
                        pipe = None;
                    }
                }
            }
            Err(err) => {
                record.report_error(&err);
                let _ = forward_tx.send(Err(err)).await;
                break;
            }
        }
    }
    // Dropping the writer delivers EOF to the decoder.
    drop(pipe);
}

fn decode_into_record(
    pipe_reader: DuplexStream,
    record: Arc<CaptureRecord>,
    direction: DataType,
    content_encoding: Option<String>,
) {
    let bridge = SyncIoBridge::new(pipe_reader);
    let encoding = content_encoding.unwrap_or_default();

    let mut reader: Box<dyn Read> = match encoding.as_str() {
        "gzip" => Box::new(MultiGzDecoder::new(bridge)),
        "deflate" => Box::new(DeflateDecoder::new(bridge)),
        "zstd" => match zstd::stream::read::Decoder::new(bridge) {
            Ok(decoder) => Box::new(decoder),
            Err(err) => {
                record.report_error(&err);
                return;
            }
        },
        "br" => Box::new(brotli::Decompressor::new(bridge, DECODE_CHUNK_SIZE)),
        // Unknown or absent encodings capture the raw bytes.
        _ => Box::new(bridge),
    };

    let mut buffer = [0u8; DECODE_CHUNK_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => {
                record.report_end(direction);
                break;
            }
            Ok(n) => record.report_chunk(direction, &buffer[..n]),
            Err(err) => {
                record.report_error(&err);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{EventBus, RecordRegistry};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use futures_util::stream;
    use std::io::Write;

    fn test_record() -> Arc<CaptureRecord> {
        RecordRegistry::with_capacity(EventBus::new(), 4).create()
    }

    fn byte_stream(chunks: Vec<Vec<u8>>) -> BoxStream<'static, Result<Bytes, std::io::Error>> {
        stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c)))).boxed()
    }

    async fn collect_forwarded(
        mut rx: mpsc::Receiver<Result<Bytes, std::io::Error>>,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(item) = rx.recv().await {
            out.extend_from_slice(&item.unwrap());
        }
        out
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn identity_tee_forwards_and_captures() {
        let record = test_record();
        let rx = spawn_tee(
            byte_stream(vec![b"hello ".to_vec(), b"world".to_vec()]),
            Arc::clone(&record),
            DataType::ResponseBody,
            None,
        );

        assert_eq!(collect_forwarded(rx).await, b"hello world");

        // The capture side finishes shortly after the forward side drains.
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !record.is_finished() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("capture side never finished");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn gzip_tee_forwards_compressed_and_captures_decoded() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"decoded payload").unwrap();
        let compressed = encoder.finish().unwrap();

        let record = test_record();
        let rx = spawn_tee(
            byte_stream(vec![compressed.clone()]),
            Arc::clone(&record),
            DataType::ResponseBody,
            Some("gzip".to_string()),
        );

        // The peer sees the original compressed bytes unchanged.
        assert_eq!(collect_forwarded(rx).await, compressed);

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !record.is_finished() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("capture side never finished");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn source_error_reports_and_propagates() {
        let record = test_record();
        let source = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom")),
        ])
        .boxed();

        let mut rx = spawn_tee(source, Arc::clone(&record), DataType::ResponseBody, None);

        assert_eq!(rx.recv().await.unwrap().unwrap(), Bytes::from_static(b"partial"));
        assert!(rx.recv().await.unwrap().is_err());

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if record.summary().status == crate::capture::RequestStatus::Error {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("error never reported");
    }
}

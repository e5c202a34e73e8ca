//! One bincode-encoded message per frame.

use std::io;

use bytes::Bytes;
use concord_proto::constants::FRAME_HEADER_SIZE;
use concord_proto::defaults::DEFAULT_MAX_FRAME_SIZE;
use concord_proto::error::{ConcordError, ConcordResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::frame::{FrameReader, FrameWriter};

/// Serialize `msg` into a sealed frame.
pub fn encode_frame<T: Serialize>(
    frames: &mut FrameWriter,
    msg: &T,
    max_frame: usize,
) -> ConcordResult<Bytes> {
    frames.reset();
    if bincode::serialize_into(&mut *frames, msg).is_err() {
        frames.reset();
        return Err(ConcordError::CodecError);
    }
    if frames.len() + FRAME_HEADER_SIZE > max_frame {
        warn!("refusing to send {} byte frame", frames.len() + FRAME_HEADER_SIZE);
        frames.reset();
        return Err(ConcordError::InvalidParms);
    }
    Ok(frames.seal())
}

/// Deserialize the current frame's payload.
///
/// Decoding reads through the frame-scoped reader, so a short or corrupt
/// payload fails here instead of consuming the next frame.
pub fn decode_frame<T: DeserializeOwned>(frames: &mut FrameReader) -> ConcordResult<T> {
    bincode::deserialize_from(frames).map_err(|_| ConcordError::CodecError)
}

/// Map a frame-level I/O failure to the error reported for the connection.
fn classify(frames: &FrameReader, err: &io::Error) -> ConcordError {
    match err.kind() {
        io::ErrorKind::InvalidData => ConcordError::MalformedFrame,
        io::ErrorKind::UnexpectedEof if frames.has_partial() => ConcordError::TruncatedFrame,
        _ => ConcordError::NetworkError,
    }
}

/// Writes framed messages to an async sink.
pub struct MessageWriter<W> {
    sink: W,
    frames: FrameWriter,
    max_frame: usize,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(sink: W) -> Self {
        Self::with_max_frame(sink, DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame(sink: W, max_frame: usize) -> Self {
        Self {
            sink,
            frames: FrameWriter::new(),
            max_frame,
        }
    }

    pub async fn send<T: Serialize>(&mut self, msg: &T) -> ConcordResult<()> {
        let frame = encode_frame(&mut self.frames, msg, self.max_frame)?;
        self.sink
            .write_all(&frame)
            .await
            .map_err(|_| ConcordError::NetworkError)?;
        self.sink.flush().await.map_err(|_| ConcordError::NetworkError)?;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ = self.sink.shutdown().await;
    }
}

/// Reads framed messages from an async source.
pub struct MessageReader<R> {
    source: R,
    frames: FrameReader,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(source: R) -> Self {
        Self::with_max_frame(source, DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame(source: R, max_frame: usize) -> Self {
        Self {
            source,
            frames: FrameReader::with_max_frame(max_frame),
        }
    }

    /// Wait for the next message.
    ///
    /// Any error is final for the connection: buffered bytes are dropped
    /// so nothing carries over.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> ConcordResult<T> {
        loop {
            match self.frames.read_frame_from(&mut self.source).await {
                Ok(true) => {
                    return decode_frame(&mut self.frames).map_err(|e| {
                        self.frames.clear();
                        e
                    })
                }
                Ok(false) => continue,
                Err(e) => {
                    let err = classify(&self.frames, &e);
                    debug!("frame read failed: {} ({})", e, err);
                    self.frames.clear();
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_proto::lock::Lock;
    use concord_proto::message::{NodeEvent, PeerMessage, PeerRequest};

    #[tokio::test]
    async fn test_messages_over_duplex() {
        let (client, server) = tokio::io::duplex(16);
        let mut writer = MessageWriter::new(client);
        let mut reader = MessageReader::new(server);

        let sent = vec![
            PeerMessage::Event {
                seq: 1,
                event: NodeEvent::AcquiringLock(Lock::new("ChatChannel", "lobby")),
            },
            PeerMessage::Event {
                seq: 2,
                event: NodeEvent::CacheData {
                    cache: "scores".into(),
                    data: vec![0xAB; 300],
                },
            },
            PeerMessage::Refused { code: 6 },
        ];

        let expected = sent.clone();
        let send_task = tokio::spawn(async move {
            for msg in &sent {
                writer.send(msg).await.unwrap();
            }
            writer.shutdown().await;
        });

        for msg in expected {
            let got: PeerMessage = reader.recv().await.unwrap();
            assert_eq!(got, msg);
        }
        send_task.await.unwrap();

        let end = reader.recv::<PeerMessage>().await.unwrap_err();
        assert_eq!(end, ConcordError::NetworkError);
    }

    #[tokio::test]
    async fn test_truncated_message() {
        let mut frames = FrameWriter::new();
        let frame = encode_frame(&mut frames, &PeerRequest::Logoff, 1024).unwrap();
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&frame[..frame.len() - 1]).await.unwrap();
        drop(client);

        let mut reader = MessageReader::new(server);
        let err = reader.recv::<PeerRequest>().await.unwrap_err();
        assert_eq!(err, ConcordError::TruncatedFrame);
    }

    #[tokio::test]
    async fn test_malformed_header() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&[0, 0, 0, 1]).await.unwrap();

        let mut reader = MessageReader::new(server);
        let err = reader.recv::<PeerRequest>().await.unwrap_err();
        assert_eq!(err, ConcordError::MalformedFrame);
    }

    #[test]
    fn test_decode_cannot_read_into_next_frame() {
        let mut frames = FrameWriter::new();
        // A frame holding half of a u64 followed by a full frame.
        frames.put_u32(1);
        let mut stream = frames.seal().to_vec();
        stream.extend_from_slice(&encode_frame(&mut frames, &7u64, 1024).unwrap());

        let mut reader = FrameReader::new();
        let mut source = &stream[..];
        assert!(reader.read_frame(&mut source).unwrap());
        assert_eq!(decode_frame::<u64>(&mut reader), Err(ConcordError::CodecError));
        assert!(reader.read_frame(&mut source).unwrap());
        assert_eq!(decode_frame::<u64>(&mut reader), Ok(7));
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut frames = FrameWriter::new();
        let big = vec![0u8; 2048];
        assert_eq!(
            encode_frame(&mut frames, &big, 1024),
            Err(ConcordError::InvalidParms)
        );
        assert!(frames.is_empty());
    }
}

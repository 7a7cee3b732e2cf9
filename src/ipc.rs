//! The wire protocol spoken between the dispatcher and worker processes.
//!
//! Messages are JSON, framed with a 4-byte big-endian length prefix
//! (`tokio_util::codec::LengthDelimitedCodec`'s default), one frame per
//! message, in both directions over the worker's stdin/stdout.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::model::{SerializedError, Status};

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("connection closed")]
    Closed,
}

/// Parent → worker messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ParentMessage {
    /// Sent once, immediately after spawn. Establishes the worker's
    /// identity and environment before any test is dispatched to it.
    Init {
        worker_index: usize,
        project_name: String,
        variation_hash: String,
    },
    /// Assigns one bucket (an ordered run of tests sharing a `beforeAll`
    /// scope) for the worker to execute depth-first. `attempt` is the same
    /// for every test in the bucket: a retry always starts a fresh bucket
    /// in a fresh worker rather than mixing attempt numbers within one run.
    Run { bucket_id: String, test_ids: Vec<String>, attempt: usize },
    /// Requests graceful shutdown: finish the in-flight test, run teardown,
    /// then exit. Used for idle reclamation and global-deadline wind-down.
    Stop,
}

/// Worker → parent messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerMessage {
    /// Sent once init completes successfully; the dispatcher may now send
    /// `Run` messages to this worker.
    Ready,
    /// A worker-level startup or `beforeAll` failure; the worker is
    /// considered dead after sending this and will be torn down.
    InitError { error: SerializedError },
    TestBegin { test_id: String, attempt: usize },
    StdOut { test_id: String, chunk: String },
    StdErr { test_id: String, chunk: String },
    TestEnd {
        test_id: String,
        attempt: usize,
        status: Status,
        duration_ms: u64,
        error: Option<SerializedError>,
        #[serde(default)]
        data: serde_json::Value,
    },
    /// Sent after the last test in a bucket completes and `afterAll` hooks
    /// have run (or been skipped because the bucket never reported `Ready`
    /// progress past init). `failed_test_id`/`fatal_error`/`remaining` are
    /// only populated on a fatal, non-test-body failure (e.g. the worker
    /// couldn't resolve the bucket's suite at all) that keeps the bucket
    /// from running any test; the dispatcher otherwise reconstructs the
    /// in-flight/remaining split itself from the `TestBegin`/`TestEnd`
    /// stream when a worker dies mid-bucket without ever sending `Done`
    /// (spec.md §6, §7 item 4).
    Done {
        bucket_id: String,
        #[serde(default)]
        failed_test_id: Option<String>,
        #[serde(default)]
        fatal_error: Option<SerializedError>,
        #[serde(default)]
        remaining: Vec<String>,
    },
    /// `afterAll`/environment teardown raised after the bucket's tests had
    /// already all reported results; doesn't change any test's status but
    /// is still surfaced to reporters per spec.md §4.3.
    TeardownError { bucket_id: String, error: SerializedError },
}

/// Framing codec: length-delimited JSON, one [`ParentMessage`] or
/// [`WorkerMessage`] value per frame depending on direction.
pub struct MessageCodec<T> {
    inner: LengthDelimitedCodec,
    _marker: std::marker::PhantomData<T>,
}

impl<T> Default for MessageCodec<T> {
    fn default() -> Self {
        Self { inner: LengthDelimitedCodec::new(), _marker: std::marker::PhantomData }
    }
}

impl<T: Serialize> Encoder<T> for MessageCodec<T> {
    type Error = IpcError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)?;
        self.inner.encode(Bytes::from(payload), dst).map_err(IpcError::Transport)
    }
}

impl<T: for<'de> Deserialize<'de>> Decoder for MessageCodec<T> {
    type Item = T;
    type Error = IpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, Self::Error> {
        let Some(mut frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        let bytes = frame.copy_to_bytes(frame.remaining());
        let value = serde_json::from_slice(&bytes)?;
        Ok(Some(value))
    }
}

/// Encodes a single message into a length-prefixed frame, for transports
/// that write raw bytes rather than going through a `Framed` sink (used by
/// the worker side, which writes directly to stdout).
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, IpcError> {
    let payload = serde_json::to_vec(msg)?;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_the_codec() {
        let mut codec = MessageCodec::<ParentMessage>::default();
        let mut buf = BytesMut::new();
        let msg = ParentMessage::Run {
            bucket_id: "b1".into(),
            test_ids: vec!["t1".into(), "t2".into()],
            attempt: 0,
        };
        codec.encode(msg.clone(), &mut buf).unwrap();

        let mut decoder = MessageCodec::<ParentMessage>::default();
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();
        match decoded {
            ParentMessage::Run { bucket_id, test_ids, attempt } => {
                assert_eq!(bucket_id, "b1");
                assert_eq!(test_ids, vec!["t1".to_string(), "t2".to_string()]);
                assert_eq!(attempt, 0);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn decode_returns_none_on_partial_frame() {
        let mut decoder = MessageCodec::<WorkerMessage>::default();
        let mut buf = BytesMut::new();
        buf.put_u32(100);
        buf.extend_from_slice(b"not enough bytes");
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn encode_frame_prefixes_length() {
        let bytes = encode_frame(&WorkerMessage::Ready).unwrap();
        let len = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
        assert_eq!(len, bytes.len() - 4);
    }

    #[test]
    fn worker_message_tags_round_trip_through_json() {
        let msg = WorkerMessage::TestEnd {
            test_id: "t1".into(),
            attempt: 0,
            status: Status::Passed,
            duration_ms: 12,
            error: None,
            data: serde_json::Value::Null,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"testEnd\""));
        let back: WorkerMessage = serde_json::from_str(&json).unwrap();
        matches!(back, WorkerMessage::TestEnd { .. });
    }
}

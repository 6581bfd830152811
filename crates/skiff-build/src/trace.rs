//! BuildKit のトレースフレーム（protobuf）
//!
//! dockerd は `moby.buildkit.trace` の aux に、BuildKit の control API の
//! `StatusResponse` を protobuf でエンコードし Base64 にしたものを入れる。
//! 必要なフィールドだけを定義し、`SolveStatus` に変換する。

use crate::error::{BuildError, Result};
use crate::progress::{SolveStatus, Vertex, VertexLog, VertexStatus};
use base64::Engine;
use prost::Message;

#[derive(Clone, PartialEq, Message)]
pub struct StatusResponse {
    #[prost(message, repeated, tag = "1")]
    pub vertexes: Vec<ProtoVertex>,
    #[prost(message, repeated, tag = "2")]
    pub statuses: Vec<ProtoVertexStatus>,
    #[prost(message, repeated, tag = "3")]
    pub logs: Vec<ProtoVertexLog>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoVertex {
    #[prost(string, tag = "1")]
    pub digest: String,
    #[prost(string, repeated, tag = "2")]
    pub inputs: Vec<String>,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(bool, tag = "4")]
    pub cached: bool,
    #[prost(message, optional, tag = "5")]
    pub started: Option<Timestamp>,
    #[prost(message, optional, tag = "6")]
    pub completed: Option<Timestamp>,
    #[prost(string, tag = "7")]
    pub error: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoVertexStatus {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub vertex: String,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(int64, tag = "4")]
    pub current: i64,
    #[prost(int64, tag = "5")]
    pub total: i64,
    #[prost(message, optional, tag = "6")]
    pub timestamp: Option<Timestamp>,
    #[prost(message, optional, tag = "7")]
    pub started: Option<Timestamp>,
    #[prost(message, optional, tag = "8")]
    pub completed: Option<Timestamp>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoVertexLog {
    #[prost(string, tag = "1")]
    pub vertex: String,
    #[prost(message, optional, tag = "2")]
    pub timestamp: Option<Timestamp>,
    #[prost(int64, tag = "3")]
    pub stream: i64,
    #[prost(bytes = "vec", tag = "4")]
    pub msg: Vec<u8>,
}

/// google.protobuf.Timestamp
#[derive(Clone, Copy, PartialEq, Message)]
pub struct Timestamp {
    #[prost(int64, tag = "1")]
    pub seconds: i64,
    #[prost(int32, tag = "2")]
    pub nanos: i32,
}

impl Timestamp {
    /// RFC 3339 形式（範囲外なら秒数のまま）
    fn to_rfc3339(self) -> String {
        let nanos = u32::try_from(self.nanos).unwrap_or_default();
        match chrono::DateTime::from_timestamp(self.seconds, nanos) {
            Some(time) => time.to_rfc3339(),
            None => self.seconds.to_string(),
        }
    }
}

fn time(ts: Option<Timestamp>) -> Option<String> {
    ts.map(Timestamp::to_rfc3339)
}

/// protobuf の `StatusResponse` をデコード
pub fn decode_status(bytes: &[u8]) -> Result<SolveStatus> {
    let response = StatusResponse::decode(bytes)
        .map_err(|e| BuildError::Protocol(format!("parsing trace frame: {}", e)))?;
    Ok(response.into())
}

impl From<StatusResponse> for SolveStatus {
    fn from(response: StatusResponse) -> Self {
        let vertexes = response
            .vertexes
            .into_iter()
            .map(|v| Vertex {
                digest: v.digest,
                inputs: v.inputs,
                name: v.name,
                started: time(v.started),
                completed: time(v.completed),
                error: v.error,
                cached: v.cached,
            })
            .collect();

        let statuses = response
            .statuses
            .into_iter()
            .map(|s| VertexStatus {
                id: s.id,
                vertex: s.vertex,
                name: s.name,
                total: s.total,
                current: s.current,
                timestamp: time(s.timestamp),
                started: time(s.started),
                completed: time(s.completed),
            })
            .collect();

        let logs = response
            .logs
            .into_iter()
            .map(|l| VertexLog {
                vertex: l.vertex,
                stream: l.stream,
                data: base64::engine::general_purpose::STANDARD.encode(&l.msg),
                timestamp: time(l.timestamp),
            })
            .collect();

        Self {
            vertexes,
            statuses,
            logs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_wire_bytes() {
        // vertexes { digest: "sha256:a" name: "FROM alpine" cached: true }
        let mut bytes = vec![0x0a, 0x19, 0x0a, 0x08];
        bytes.extend_from_slice(b"sha256:a");
        bytes.extend_from_slice(&[0x1a, 0x0b]);
        bytes.extend_from_slice(b"FROM alpine");
        bytes.extend_from_slice(&[0x20, 0x01]);

        let status = decode_status(&bytes).unwrap();
        assert_eq!(status.vertexes.len(), 1);
        assert_eq!(status.vertexes[0].digest, "sha256:a");
        assert_eq!(status.vertexes[0].name, "FROM alpine");
        assert!(status.vertexes[0].cached);
        assert!(status.vertexes[0].completed.is_none());
    }

    #[test]
    fn test_logs_and_timestamps() {
        let response = StatusResponse {
            vertexes: vec![ProtoVertex {
                digest: "sha256:v".to_string(),
                name: "RUN make".to_string(),
                completed: Some(Timestamp {
                    seconds: 1_704_067_200,
                    nanos: 0,
                }),
                ..Default::default()
            }],
            logs: vec![ProtoVertexLog {
                vertex: "sha256:v".to_string(),
                stream: 1,
                msg: b"hello\n".to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let status = decode_status(&response.encode_to_vec()).unwrap();
        assert_eq!(
            status.vertexes[0].completed.as_deref(),
            Some("2024-01-01T00:00:00+00:00")
        );
        assert_eq!(status.logs[0].text(), "hello\n");
    }

    #[test]
    fn test_truncated_payload_is_protocol_error() {
        assert!(matches!(
            decode_status(&[0x0a, 0x19, 0x0a]),
            Err(BuildError::Protocol(_))
        ));
    }
}

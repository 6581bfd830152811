//! Docker API の出力ストリーム
//!
//! Docker のビルド・プッシュ API は空白区切りの JSON オブジェクトを順に返す。
//! コマンドの結果は `aux` フィールドに、エラーは `error` / `errorDetail` に入る。
//! BuildKit が有効な場合は `id` が `moby.buildkit.trace` の `aux` に
//! 進捗トレースが入るが、これは結果ではない。

use crate::error::{BuildError, Result};
use crate::progress::{ProgressSink, SolveStatus, spawn_trace_renderer};
use crate::trace;
use base64::Engine;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

/// BuildKit のトレースフレームを示す ID
pub const BUILDKIT_TRACE_ID: &str = "moby.buildkit.trace";

/// デコード済みメッセージのストリーム
pub type MessageStream = BoxStream<'static, Result<JsonMessage>>;

/// ストリーム中の1メッセージ
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "error", default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(rename = "errorDetail", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aux: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: String,
}

/// メッセージの分類
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// エラー（ストリームを中断する）
    Error(String),
    /// BuildKit のトレース
    Trace(Value),
    /// コマンドの結果
    Result(Value),
    /// ログ・ステータスのみ
    Progress,
}

impl JsonMessage {
    /// 出力すべきログ行（末尾の改行を除く）
    pub fn log_line(&self) -> Option<&str> {
        match self.stream.as_deref() {
            Some(s) if !s.is_empty() && s != "\n" => Some(s.strip_suffix('\n').unwrap_or(s)),
            _ => None,
        }
    }

    pub fn is_buildkit_trace(&self) -> bool {
        self.id.as_deref() == Some(BUILDKIT_TRACE_ID)
    }

    /// エラー判定を aux の分類より先に行う
    pub fn into_frame(self) -> Frame {
        if let Some(msg) = self.error_message.filter(|m| !m.is_empty()) {
            return Frame::Error(msg);
        }
        if let Some(err) = self.error {
            return Frame::Error(err.message);
        }
        match self.aux {
            Some(aux) if self.id.as_deref() == Some(BUILDKIT_TRACE_ID) => Frame::Trace(aux),
            Some(aux) => Frame::Result(aux),
            None => Frame::Progress,
        }
    }
}

impl SolveStatus {
    /// トレースフレームの aux をデコード
    ///
    /// dockerd は protobuf の `StatusResponse` を Base64 エンコードして送る。
    /// Base64 の中身が JSON ドキュメントの場合と、JSON オブジェクトそのものも受け付ける。
    pub fn from_aux(aux: &Value) -> Result<Self> {
        match aux {
            Value::String(encoded) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| BuildError::Protocol(format!("decoding trace frame: {}", e)))?;
                if bytes.first() == Some(&b'{') {
                    serde_json::from_slice(&bytes)
                        .map_err(|e| BuildError::Protocol(format!("parsing trace frame: {}", e)))
                } else {
                    trace::decode_status(&bytes)
                }
            }
            Value::Object(_) => serde_json::from_value(aux.clone())
                .map_err(|e| BuildError::Protocol(format!("parsing trace frame: {}", e))),
            other => Err(BuildError::Protocol(format!(
                "unexpected trace frame: {}",
                other
            ))),
        }
    }
}

/// バイト列を JSON メッセージに分割するデコーダ
///
/// チャンク境界をまたぐオブジェクトは次のチャンクまで保持する。
#[derive(Debug, Default)]
pub struct JsonMessageDecoder {
    buf: Vec<u8>,
}

impl JsonMessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// チャンクを追加し、完成したメッセージを返す
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<JsonMessage>> {
        self.buf.extend_from_slice(chunk);

        let mut messages = Vec::new();
        let consumed = {
            let mut iter =
                serde_json::Deserializer::from_slice(&self.buf).into_iter::<JsonMessage>();
            loop {
                match iter.next() {
                    Some(Ok(msg)) => messages.push(msg),
                    // 未完成のオブジェクトは次のチャンクを待つ
                    Some(Err(e)) if e.is_eof() => break,
                    Some(Err(e)) => {
                        return Err(BuildError::Protocol(format!(
                            "decoding docker output: {}",
                            e
                        )));
                    }
                    None => break,
                }
            }
            iter.byte_offset()
        };
        self.buf.drain(..consumed);
        Ok(messages)
    }

    /// ストリーム終端で未完成のメッセージが残っていればエラー
    pub fn finish(&self) -> Result<()> {
        if self.buf.iter().all(u8::is_ascii_whitespace) {
            Ok(())
        } else {
            Err(BuildError::Protocol(format!(
                "decoding docker output: truncated message: {}",
                String::from_utf8_lossy(&self.buf)
            )))
        }
    }
}

/// 生のレスポンスボディをメッセージストリームに変換
pub fn decode_stream<S, E>(body: S) -> MessageStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
{
    struct State<S> {
        body: std::pin::Pin<Box<S>>,
        decoder: JsonMessageDecoder,
        pending: VecDeque<JsonMessage>,
        done: bool,
    }

    let state = State {
        body: Box::pin(body),
        decoder: JsonMessageDecoder::new(),
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(msg) = st.pending.pop_front() {
                return Some((Ok(msg), st));
            }
            if st.done {
                return None;
            }
            match st.body.next().await {
                Some(Ok(chunk)) => match st.decoder.push(&chunk) {
                    Ok(msgs) => st.pending.extend(msgs),
                    Err(e) => {
                        st.done = true;
                        return Some((Err(e), st));
                    }
                },
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(BuildError::service("reading docker output", e)), st));
                }
                None => {
                    st.done = true;
                    if let Err(e) = st.decoder.finish() {
                        return Some((Err(e), st));
                    }
                }
            }
        }
    })
    .boxed()
}

/// 出力ストリームを最後まで読み、最後の結果 aux を返す
///
/// ログ行は `sink` に直接、トレースフレームは描画タスク経由で `sink` に渡す。
/// エラーフレームを受け取った時点で中断する。結果が1つもなければ `None`。
pub async fn read_docker_output(
    mut messages: MessageStream,
    sink: Arc<dyn ProgressSink>,
) -> Result<Option<Value>> {
    let (tx, renderer) = spawn_trace_renderer(sink.clone());

    let result = read_messages(&mut messages, sink.as_ref(), &tx).await;

    // 読み込みループが終わってからチャネルを閉じる
    drop(tx);
    if let Err(e) = renderer.await {
        tracing::warn!("Trace renderer stopped unexpectedly: {}", e);
    }

    result
}

async fn read_messages(
    messages: &mut MessageStream,
    sink: &dyn ProgressSink,
    trace_tx: &mpsc::UnboundedSender<SolveStatus>,
) -> Result<Option<Value>> {
    let mut result = None;

    while let Some(message) = messages.next().await {
        let message = message?;

        if let Some(line) = message.log_line() {
            sink.line(line);
        }
        if let Some(status) = &message.status {
            tracing::debug!(id = message.id.as_deref().unwrap_or(""), "{}", status);
        }

        match message.into_frame() {
            Frame::Error(msg) => return Err(BuildError::BuildFailed(msg)),
            Frame::Trace(aux) => {
                let status = SolveStatus::from_aux(&aux)?;
                if trace_tx.send(status).is_err() {
                    tracing::debug!("Trace renderer already stopped");
                }
            }
            Frame::Result(aux) => result = Some(aux),
            Frame::Progress => {}
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressSink;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        lines: Mutex<Vec<String>>,
        traces: Mutex<Vec<SolveStatus>>,
    }

    impl ProgressSink for Recorder {
        fn line(&self, line: &str) {
            self.lines.lock().unwrap().push(line.to_string());
        }

        fn trace(&self, status: &SolveStatus) {
            self.traces.lock().unwrap().push(status.clone());
        }
    }

    fn messages(text: &str) -> MessageStream {
        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> =
            vec![Ok(Bytes::from(text.to_string()))];
        decode_stream(stream::iter(chunks))
    }

    async fn read(text: &str) -> (Result<Option<Value>>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let result = read_docker_output(messages(text), recorder.clone()).await;
        (result, recorder)
    }

    fn trace_frame() -> String {
        let status = json!({"Vertexes": [{"Digest": "sha256:v", "Name": "RUN echo hi"}]});
        let encoded = base64::engine::general_purpose::STANDARD.encode(status.to_string());
        json!({"id": BUILDKIT_TRACE_ID, "aux": encoded}).to_string()
    }

    #[test]
    fn test_frame_priority() {
        let msg = JsonMessage {
            error_message: Some("boom".into()),
            error: Some(JsonError {
                code: None,
                message: "detail".into(),
            }),
            aux: Some(json!({"ID": "sha256:abc"})),
            ..Default::default()
        };
        assert_eq!(msg.into_frame(), Frame::Error("boom".into()));

        let msg = JsonMessage {
            error_message: Some(String::new()),
            error: Some(JsonError {
                code: Some(1),
                message: "detail".into(),
            }),
            ..Default::default()
        };
        assert_eq!(msg.into_frame(), Frame::Error("detail".into()));

        let msg = JsonMessage {
            id: Some(BUILDKIT_TRACE_ID.into()),
            aux: Some(json!("e30=")),
            ..Default::default()
        };
        assert!(matches!(msg.into_frame(), Frame::Trace(_)));
    }

    #[test]
    fn test_log_line() {
        let msg = |s: &str| JsonMessage {
            stream: Some(s.to_string()),
            ..Default::default()
        };
        assert_eq!(msg("Step 1/2\n").log_line(), Some("Step 1/2"));
        assert_eq!(msg("\n").log_line(), None);
        assert_eq!(msg("").log_line(), None);
        assert_eq!(JsonMessage::default().log_line(), None);
    }

    #[test]
    fn test_decoder_across_chunks() {
        let mut decoder = JsonMessageDecoder::new();
        let first = decoder.push(br#"{"stream":"a"}  {"stream":"#).unwrap();
        assert_eq!(first.len(), 1);
        let second = decoder.push(b"\"b\"}\n").unwrap();
        assert_eq!(second[0].stream.as_deref(), Some("b"));
        assert!(decoder.finish().is_ok());

        decoder.push(br#"{"stream":"#).unwrap();
        assert!(decoder.finish().is_err());
    }

    #[test]
    fn test_decoder_rejects_garbage() {
        let mut decoder = JsonMessageDecoder::new();
        assert!(matches!(
            decoder.push(b"not json"),
            Err(BuildError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_error_frame_only() {
        let (result, _) = read(r#"{"errorDetail":{"message":"no space left"},"error":"no space left"}"#).await;
        match result {
            Err(BuildError::BuildFailed(msg)) => assert_eq!(msg, "no space left"),
            other => panic!("Expected BuildFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_trace_frames_only() {
        let text = format!("{}\n{}\n", trace_frame(), trace_frame());
        let (result, recorder) = read(&text).await;
        assert_eq!(result.unwrap(), None);
        let traces = recorder.traces.lock().unwrap();
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0].vertexes[0].name, "RUN echo hi");
    }

    #[tokio::test]
    async fn test_last_aux_wins() {
        let text = r#"
{"stream":"Step 1/1 : FROM alpine\n"}
{"aux":{"ID":"sha256:1111111111111111111111"}}
{"stream":"\n"}
{"aux":{"ID":"sha256:abcdef0123456789abcdef"}}
{"stream":"Successfully built abcdef012345\n"}
"#;
        let (result, recorder) = read(text).await;
        assert_eq!(
            result.unwrap(),
            Some(json!({"ID": "sha256:abcdef0123456789abcdef"}))
        );
        assert_eq!(
            *recorder.lines.lock().unwrap(),
            vec!["Step 1/1 : FROM alpine", "Successfully built abcdef012345"]
        );
    }

    #[tokio::test]
    async fn test_error_after_result_aborts() {
        let text = r#"{"aux":{"ID":"sha256:abc"}}{"error":"failed to push"}"#;
        let (result, _) = read(text).await;
        assert!(matches!(result, Err(BuildError::BuildFailed(_))));
    }

    #[tokio::test]
    async fn test_protobuf_trace_then_result() {
        use prost::Message;

        let response = trace::StatusResponse {
            vertexes: vec![trace::ProtoVertex {
                digest: "sha256:v".to_string(),
                name: "[1/2] FROM alpine".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let encoded = base64::engine::general_purpose::STANDARD.encode(response.encode_to_vec());
        let text = format!(
            "{}\n{}\n",
            json!({"id": BUILDKIT_TRACE_ID, "aux": encoded}),
            r#"{"aux":{"ID":"sha256:0123456789abcdef0123"}}"#
        );

        let (result, recorder) = read(&text).await;
        assert_eq!(
            result.unwrap(),
            Some(json!({"ID": "sha256:0123456789abcdef0123"}))
        );
        let traces = recorder.traces.lock().unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].vertexes[0].name, "[1/2] FROM alpine");
    }

    #[tokio::test]
    async fn test_malformed_trace_is_protocol_error() {
        let text = json!({"id": BUILDKIT_TRACE_ID, "aux": "!!!not-base64"}).to_string();
        let (result, _) = read(&text).await;
        assert!(matches!(result, Err(BuildError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let (result, _) = read("").await;
        assert_eq!(result.unwrap(), None);
    }
}

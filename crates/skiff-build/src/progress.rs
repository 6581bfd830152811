//! ビルド進捗の出力
//!
//! ビルドストリームのログ行と BuildKit のトレースフレームを受け取る出力先と、
//! トレースフレームを別タスクで描画するためのチャネルを提供します。

use base64::Engine;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// BuildKit のトレースフレーム
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SolveStatus {
    #[serde(default)]
    pub vertexes: Vec<Vertex>,
    #[serde(default)]
    pub statuses: Vec<VertexStatus>,
    #[serde(default)]
    pub logs: Vec<VertexLog>,
}

/// ビルドグラフの頂点（1つのビルドステップ）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Vertex {
    pub digest: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub name: String,
    pub started: Option<String>,
    pub completed: Option<String>,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub cached: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VertexStatus {
    #[serde(rename = "ID")]
    pub id: String,
    pub vertex: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub current: i64,
    pub timestamp: Option<String>,
    pub started: Option<String>,
    pub completed: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VertexLog {
    pub vertex: String,
    #[serde(default)]
    pub stream: i64,
    /// Base64 エンコードされた出力
    #[serde(default)]
    pub data: String,
    pub timestamp: Option<String>,
}

impl VertexLog {
    /// ログ本文（デコードできなければそのまま）
    pub fn text(&self) -> String {
        match base64::engine::general_purpose::STANDARD.decode(&self.data) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => self.data.clone(),
        }
    }
}

/// 進捗の出力先
///
/// 1回のビルドにつき書き込み元は1つだけ（ログ行は読み込みループ、
/// トレースは描画タスク）。
pub trait ProgressSink: Send + Sync {
    /// ビルド出力の1行
    fn line(&self, line: &str);

    /// トレースフレーム
    fn trace(&self, status: &SolveStatus);
}

/// 何も出力しない
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn line(&self, _line: &str) {}

    fn trace(&self, _status: &SolveStatus) {}
}

/// スピナー付きのコンソール出力
pub struct ConsoleProgress {
    progress_bar: ProgressBar,
}

impl ConsoleProgress {
    pub fn new(image_name: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("Building {}...", image_name));

        Self { progress_bar: pb }
    }
}

impl Drop for ConsoleProgress {
    fn drop(&mut self) {
        self.progress_bar.finish_and_clear();
    }
}

impl ProgressSink for ConsoleProgress {
    fn line(&self, line: &str) {
        self.progress_bar.println(line);
        self.progress_bar.tick();
    }

    fn trace(&self, status: &SolveStatus) {
        for v in &status.vertexes {
            if !v.error.is_empty() {
                self.progress_bar
                    .println(format!("  {} {}: {}", "✗".red(), v.name, v.error));
            } else if v.completed.is_some() {
                let mark = if v.cached { "CACHED".yellow() } else { "✓".green() };
                self.progress_bar.println(format!("  {} {}", mark, v.name));
            } else if v.started.is_some() {
                self.progress_bar.set_message(v.name.clone());
            }
        }
        for s in &status.statuses {
            if s.total > 0 {
                self.progress_bar
                    .set_message(format!("{} {}/{}", s.id, s.current, s.total));
            }
        }
        for l in &status.logs {
            for line in l.text().lines() {
                self.progress_bar.println(format!("    {}", line.dimmed()));
            }
        }
    }
}

/// トレースフレームを描画するタスクを起動
///
/// 返された送信側を drop するとタスクは残りを描画して終了する。
/// 送信側は読み込みループが終わった後で閉じること。
pub fn spawn_trace_renderer(
    sink: Arc<dyn ProgressSink>,
) -> (mpsc::UnboundedSender<SolveStatus>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<SolveStatus>();
    let handle = tokio::spawn(async move {
        while let Some(status) = rx.recv().await {
            sink.trace(&status);
        }
    });
    (tx, handle)
}

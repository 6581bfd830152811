//! イメージビルド定義

use super::image::ImageRef;
use crate::error::{FlowError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// コマンド（exec形式の argv）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cmd {
    pub argv: Vec<String>,
}

impl Cmd {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }

    /// シェル経由で実行するコマンド（`sh -c "..."`）
    ///
    /// 空文字列は空コマンドになる。
    pub fn shell(script: &str) -> Self {
        if script.trim().is_empty() {
            return Self::default();
        }
        Self::new(["sh", "-c", script])
    }

    pub fn is_empty(&self) -> bool {
        self.argv.is_empty()
    }

    /// Dockerfile の exec 形式 (`["sh", "-c", "..."]`)
    pub fn to_exec_form(&self) -> String {
        serde_json::to_string(&self.argv).unwrap_or_else(|_| "[]".to_string())
    }
}

/// ローカルパスとコンテナ内パスの対応
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub local_path: PathBuf,
    pub container_path: String,
}

/// ビルドコンテキスト内の配置先を持つパス対応
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathMapping {
    pub local_path: PathBuf,
    pub container_path: String,
}

impl From<&Mount> for PathMapping {
    fn from(m: &Mount) -> Self {
        Self {
            local_path: m.local_path.clone(),
            container_path: m.container_path.clone(),
        }
    }
}

/// マウント一覧をパス対応に変換
pub fn mounts_to_path_mappings(mounts: &[Mount]) -> Vec<PathMapping> {
    mounts.iter().map(PathMapping::from).collect()
}

/// Dockerfile による一括ビルド
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticBuild {
    pub dockerfile: String,
    pub build_path: PathBuf,
    /// ビルド引数（宣言順）
    #[serde(default)]
    pub build_args: Vec<(String, String)>,
}

/// ベースイメージ + マウント + ステップによる高速ビルド
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastBuild {
    pub base_dockerfile: String,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub steps: Vec<Cmd>,
    #[serde(default)]
    pub entrypoint: Cmd,
}

/// 任意のコマンドによるビルド
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomBuild {
    pub command: String,
    #[serde(default)]
    pub deps: Vec<PathBuf>,
    /// 差分再ビルド用の高速ビルド設定
    #[serde(default)]
    pub fast: Option<FastBuild>,
}

/// ビルド方式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BuildDetails {
    Static(StaticBuild),
    Fast(FastBuild),
    Custom(CustomBuild),
}

impl BuildDetails {
    pub fn kind(&self) -> BuildKind {
        match self {
            BuildDetails::Static(_) => BuildKind::Static,
            BuildDetails::Fast(_) => BuildKind::Fast,
            BuildDetails::Custom(_) => BuildKind::Custom,
        }
    }
}

/// ビルド方式の種別（マニフェストに記録する）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildKind {
    Static,
    Fast,
    Custom,
}

/// イメージビルド定義
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageBuildSpec {
    pub image: ImageRef,
    pub details: BuildDetails,
    #[serde(default)]
    pub cache_paths: Vec<String>,
    /// この定義を含む設定ファイル
    pub config_file: PathBuf,
    #[serde(default)]
    pub repos: Vec<PathBuf>,
}

impl ImageBuildSpec {
    pub fn new(image: ImageRef, details: BuildDetails, config_file: PathBuf) -> Self {
        Self {
            image,
            details,
            cache_paths: Vec::new(),
            config_file,
            repos: Vec::new(),
        }
    }

    pub fn with_cache_paths(mut self, cache_paths: Vec<String>) -> Self {
        self.cache_paths = cache_paths;
        self
    }

    pub fn with_repos(mut self, repos: Vec<PathBuf>) -> Self {
        self.repos = repos;
        self
    }

    /// 比較キー（正規化されたイメージ名）
    pub fn name(&self) -> String {
        self.image.name()
    }

    /// 高速ビルド設定（Custom に内包されている場合も含む）
    pub fn maybe_fast_build(&self) -> Option<&FastBuild> {
        match &self.details {
            BuildDetails::Fast(fb) => Some(fb),
            BuildDetails::Custom(cb) => cb.fast.as_ref(),
            BuildDetails::Static(_) => None,
        }
    }

    pub fn maybe_static_build(&self) -> Option<&StaticBuild> {
        match &self.details {
            BuildDetails::Static(sb) => Some(sb),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let BuildDetails::Custom(cb) = &self.details
            && cb.command.trim().is_empty()
        {
            return Err(FlowError::EmptyCommand(self.image.to_string()));
        }
        Ok(())
    }
}

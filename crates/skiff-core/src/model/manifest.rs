//! マニフェスト定義

use super::build::{BuildKind, Cmd, PathMapping};
use super::image::ImageRef;
use super::resource::PortForward;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// デプロイ可能な単位
///
/// イメージに紐付いている場合はビルドに必要な情報をすべて含む。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    /// `---` 区切りのクラスタオブジェクト
    pub k8s_yaml: String,
    #[serde(default)]
    pub port_forwards: Vec<PortForward>,
    pub docker_ref: Option<ImageRef>,
    #[serde(default)]
    pub build_kind: Option<BuildKind>,
    #[serde(default)]
    pub mounts: Vec<PathMapping>,
    #[serde(default)]
    pub entrypoint: Cmd,
    #[serde(default)]
    pub steps: Vec<Cmd>,
    #[serde(default)]
    pub base_dockerfile: String,
    #[serde(default)]
    pub static_dockerfile: String,
    #[serde(default)]
    pub static_build_path: PathBuf,
    #[serde(default)]
    pub static_build_args: Vec<(String, String)>,
    #[serde(default)]
    pub cache_paths: Vec<String>,
    /// イメージを定義した設定ファイル
    pub config_file: Option<PathBuf>,
    #[serde(default)]
    pub repos: Vec<PathBuf>,
}

impl Manifest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// イメージのビルドが必要か
    pub fn is_image_bound(&self) -> bool {
        self.docker_ref.is_some()
    }

    /// 高速ビルド（ベース Dockerfile + ステップ）として構成されているか
    ///
    /// カスタムビルドに高速ビルドが含まれている場合も真。
    pub fn is_fast_build(&self) -> bool {
        self.build_kind == Some(BuildKind::Fast) || !self.base_dockerfile.is_empty()
    }

    pub fn is_static_build(&self) -> bool {
        self.build_kind == Some(BuildKind::Static)
    }
}

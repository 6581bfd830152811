use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error(
        "複数の登録済みイメージを参照するオブジェクトが見つかりました。\
         1つのオブジェクトは1つのイメージにのみ紐付けできます。\n\
         イメージ: {images:?}\nオブジェクト:\n{object}"
    )]
    AmbiguousImages { images: Vec<String>, object: String },

    #[error("イメージ '{0}' は既に定義されています")]
    DuplicateImage(String),

    #[error("リソース '{0}' は既に定義されています")]
    DuplicateResource(String),

    #[error("無効なイメージ参照: {reference}\n理由: {message}")]
    InvalidImageRef { reference: String, message: String },

    #[error("custom_build '{0}' のコマンドが空です")]
    EmptyCommand(String),

    #[error("無効な設定: {0}")]
    InvalidConfig(String),

    #[error("YAMLエラー: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("ファイル読み込みエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("設定ファイルの評価に失敗しました: {path}\n理由: {message}")]
    Evaluation { path: PathBuf, message: String },
}

pub type Result<T> = std::result::Result<T, FlowError>;

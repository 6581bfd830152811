use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("ユーザー設定ディレクトリを特定できません")]
    ConfigDirNotFound,

    #[error(
        "{} から Skifffile が見つかりません（Skifffile.local / Skifffile を \
        このディレクトリ、.skiff/、~/.config/skiff/ の順に探しました）",
        .searched.display()
    )]
    ConfigFileNotFound { searched: PathBuf },

    #[error("SKIFF_CONFIG_PATH に指定されたファイルが存在しません: {}", .0.display())]
    ConfigPathMissing(PathBuf),

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

pub mod error;

pub use error::*;

use std::path::{Path, PathBuf};

/// 設定ファイルのパスを直接指定する環境変数
pub const CONFIG_PATH_ENV: &str = "SKIFF_CONFIG_PATH";

/// 設定ファイル名（優先順）
pub const CONFIG_FILE_NAMES: [&str; 2] = ["Skifffile.local", "Skifffile"];

/// プロジェクト内の設定ディレクトリ
const PROJECT_CONFIG_DIR: &str = ".skiff";

/// skiff のユーザー設定ディレクトリ（なければ作成）
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("skiff");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// カレントディレクトリを起点に設定ファイルを探す
///
/// 以下の優先順位で検索:
/// 1. 環境変数 SKIFF_CONFIG_PATH (直接パス指定、存在しなければエラー)
/// 2. カレントディレクトリ: Skifffile.local, Skifffile
/// 3. ./.skiff/ ディレクトリ内: 同様の順序
/// 4. ~/.config/skiff/Skifffile (グローバル設定)
pub fn find_config_file() -> Result<PathBuf> {
    let current_dir = std::env::current_dir()?;
    find_config_file_from(&current_dir)
}

/// `dir` を起点に設定ファイルを探す
pub fn find_config_file_from(dir: &Path) -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if !path.is_file() {
            return Err(ConfigError::ConfigPathMissing(path));
        }
        tracing::debug!("Using {} from {}", path.display(), CONFIG_PATH_ENV);
        return Ok(path);
    }

    if let Some(path) = find_in(dir) {
        return Ok(path);
    }

    let project_dir = dir.join(PROJECT_CONFIG_DIR);
    if project_dir.is_dir()
        && let Some(path) = find_in(&project_dir)
    {
        return Ok(path);
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join("skiff").join("Skifffile");
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::ConfigFileNotFound {
        searched: dir.to_path_buf(),
    })
}

fn find_in(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

use anyhow::Context;
use skiff_core::{ConfigEvaluator, Manifest, load_manifests};
use std::path::{Path, PathBuf};

/// 設定ファイルを評価してマニフェスト一覧を作る
///
/// `config_path` が `None` の場合は `skiff_config::find_config_file` で探す。
/// 組み立てに失敗した場合はビルドを始める前にエラーを返す。
pub fn compile(
    evaluator: &dyn ConfigEvaluator,
    config_path: Option<&Path>,
) -> anyhow::Result<Vec<Manifest>> {
    let path: PathBuf = match config_path {
        Some(path) => path.to_path_buf(),
        None => skiff_config::find_config_file().context("設定ファイルの検索に失敗しました")?,
    };

    let manifests = load_manifests(evaluator, &path)
        .with_context(|| format!("{} のコンパイルに失敗しました", path.display()))?;

    tracing::info!(
        manifests = manifests.len(),
        images = manifests.iter().filter(|m| m.is_image_bound()).count(),
        "Compiled {}",
        path.display()
    );
    Ok(manifests)
}

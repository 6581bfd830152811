//! 統合ローダー
//!
//! 設定ファイルの評価、リソース組み立て、マニフェスト変換を統合

use crate::assembler::{AssemblerState, Declarations};
use crate::error::{FlowError, Result};
use crate::model::Manifest;
use std::path::Path;
use tracing::{debug, info, instrument};

/// 設定スクリプトの評価器
///
/// スクリプトエンジンは差し替え可能で、評価中に組み込み関数が呼ばれるたびに
/// `decls` の対応するメソッドを呼び出す。
pub trait ConfigEvaluator {
    fn evaluate(&self, path: &Path, decls: &mut dyn Declarations) -> Result<()>;
}

impl<F> ConfigEvaluator for F
where
    F: Fn(&Path, &mut dyn Declarations) -> Result<()>,
{
    fn evaluate(&self, path: &Path, decls: &mut dyn Declarations) -> Result<()> {
        self(path, decls)
    }
}

/// 設定ファイルを評価して宣言を蓄積した状態を返す
#[instrument(skip(evaluator), fields(path = %path.display()))]
pub fn evaluate_file(evaluator: &dyn ConfigEvaluator, path: &Path) -> Result<AssemblerState> {
    let mut state = AssemblerState::new(path);
    evaluator
        .evaluate(path, &mut state)
        .map_err(|e| match e {
            e @ FlowError::Evaluation { .. } => e,
            other => FlowError::Evaluation {
                path: path.to_path_buf(),
                message: other.to_string(),
            },
        })?;
    debug!(
        images = state.images().count(),
        objects = state.unassigned().len(),
        "Configuration evaluated"
    );
    Ok(state)
}

/// 設定ファイルからマニフェスト一覧を生成
///
/// 以下の処理を実行:
/// 1. 設定ファイルの評価
/// 2. リソース組み立て
/// 3. マニフェスト変換
#[instrument(skip(evaluator), fields(path = %path.display()))]
pub fn load_manifests(evaluator: &dyn ConfigEvaluator, path: &Path) -> Result<Vec<Manifest>> {
    info!("Starting configuration load");

    // 1. 評価
    let state = evaluate_file(evaluator, path)?;

    // 2. 組み立て
    let groups = state.assemble()?;

    // 3. 変換
    let manifests = state.translate(&groups)?;
    info!(
        manifests = manifests.len(),
        images = manifests.iter().filter(|m| m.is_image_bound()).count(),
        "Manifests assembled"
    );
    Ok(manifests)
}

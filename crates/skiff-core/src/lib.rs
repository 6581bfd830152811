//! skiff core
//!
//! 宣言されたイメージビルド定義とクラスタオブジェクトを組み立て、
//! デプロイ単位のマニフェストに変換します。

pub mod assembler;
pub mod error;
pub mod k8s;
pub mod loader;
pub mod model;

pub use assembler::{AssemblerState, BuildOptions, Declarations, UNRESOURCED_NAME};
pub use error::{FlowError, Result};
pub use k8s::ClusterObject;
pub use loader::{ConfigEvaluator, evaluate_file, load_manifests};
pub use model::*;

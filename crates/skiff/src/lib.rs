//! skiff
//!
//! ビルド・デプロイ宣言をマニフェストにコンパイルし、
//! イメージを持つマニフェストごとにビルドパイプラインを実行します。
//!
//! ```no_run
//! use skiff::skiff_build::{DockerService, ImageBuilder};
//! # async fn run(evaluator: &dyn skiff::skiff_core::ConfigEvaluator) -> anyhow::Result<()> {
//! skiff::init_tracing();
//! let manifests = skiff::compile(evaluator, None)?;
//! let builder = ImageBuilder::new(DockerService::connect()?);
//! for outcome in skiff::build_manifests(&builder, &manifests, false).await {
//!     println!("{}: {:?}", outcome.manifest, outcome.status);
//! }
//! # Ok(())
//! # }
//! ```

pub mod build;
pub mod compile;

pub use build::{BuildOutcome, BuildStatus, build_manifests};
pub use compile::compile;

pub use skiff_build;
pub use skiff_config;
pub use skiff_core;

use tracing_subscriber::EnvFilter;

/// ログ出力を初期化（`RUST_LOG` 未設定時は info）
///
/// 既に初期化済みの場合は何もしない。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

use colored::Colorize;
use skiff_build::{BuildError, Dockerfile, ImageBuilder, ImageService};
use skiff_core::{BuildKind, ImageRef, Manifest, Mount};

/// マニフェスト1件のビルド結果
#[derive(Debug)]
pub enum BuildStatus {
    Built(ImageRef),
    Pushed(ImageRef),
    /// パイプラインでビルドできない（カスタムコマンドのみのビルドなど）
    Skipped(String),
    Failed(BuildError),
}

#[derive(Debug)]
pub struct BuildOutcome {
    pub manifest: String,
    pub status: BuildStatus,
}

impl BuildOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self.status, BuildStatus::Failed(_))
    }

    /// ビルド（またはプッシュ）されたイメージ
    pub fn image(&self) -> Option<&ImageRef> {
        match &self.status {
            BuildStatus::Built(image) | BuildStatus::Pushed(image) => Some(image),
            _ => None,
        }
    }
}

/// イメージを持つマニフェストを順にビルドする
///
/// 1件の失敗で残りのビルドは止めない。結果はマニフェストの順に返す。
/// イメージを持たないマニフェストは結果に含めない。
pub async fn build_manifests<S: ImageService>(
    builder: &ImageBuilder<S>,
    manifests: &[Manifest],
    push: bool,
) -> Vec<BuildOutcome> {
    let mut outcomes = Vec::new();

    for manifest in manifests {
        let Some(reference) = &manifest.docker_ref else {
            continue;
        };

        println!("{} {}", "→".blue(), manifest.name.cyan());
        let status = build_one(builder, manifest, reference, push).await;

        match &status {
            BuildStatus::Built(image) | BuildStatus::Pushed(image) => {
                println!("  {} {}", "✓".green(), image);
            }
            BuildStatus::Skipped(reason) => {
                println!("  {} {}", "-".dimmed(), reason.dimmed());
            }
            BuildStatus::Failed(e) => {
                tracing::error!(manifest = %manifest.name, "{}", e);
                println!("  {} {}", "✗".red(), e.user_message());
            }
        }

        outcomes.push(BuildOutcome {
            manifest: manifest.name.clone(),
            status,
        });
    }

    outcomes
}

async fn build_one<S: ImageService>(
    builder: &ImageBuilder<S>,
    manifest: &Manifest,
    reference: &ImageRef,
    push: bool,
) -> BuildStatus {
    let built = if manifest.is_fast_build() {
        let mounts: Vec<Mount> = manifest
            .mounts
            .iter()
            .map(|m| Mount {
                local_path: m.local_path.clone(),
                container_path: m.container_path.clone(),
            })
            .collect();
        builder
            .build_from_scratch(
                reference,
                &Dockerfile::new(manifest.base_dockerfile.as_str()),
                &mounts,
                &manifest.steps,
                &manifest.entrypoint,
            )
            .await
    } else if manifest.is_static_build() {
        builder
            .build_static(
                reference,
                &Dockerfile::new(manifest.static_dockerfile.as_str()),
                &manifest.static_build_path,
                &manifest.static_build_args,
            )
            .await
    } else if manifest.build_kind == Some(BuildKind::Custom) {
        return BuildStatus::Skipped(format!("{} is built by a custom command", reference));
    } else {
        return BuildStatus::Skipped(format!("{} has no build configuration", reference));
    };

    let tagged = match built {
        Ok(tagged) => tagged,
        Err(e) => return BuildStatus::Failed(e),
    };

    if !push {
        return BuildStatus::Built(tagged);
    }
    match builder.push_image(&tagged).await {
        Ok(pushed) => BuildStatus::Pushed(pushed),
        Err(e) => BuildStatus::Failed(e),
    }
}

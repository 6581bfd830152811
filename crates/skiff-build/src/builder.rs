use crate::auth::RegistryAuth;
use crate::context::ContextBuilder;
use crate::dockerfile::Dockerfile;
use crate::error::{BuildError, Result};
use crate::progress::{NullProgress, ProgressSink};
use crate::service::{ImageBuildOptions, ImageService};
use crate::stream::read_docker_output;
use serde_json::Value;
use skiff_core::{Cmd, Digest, ImageRef, Mount, PathMapping, mounts_to_path_mappings};
use std::path::Path;
use std::sync::Arc;
use tracing::instrument;

/// ダイジェストから作るタグの接頭辞
pub const TAG_PREFIX: &str = "tilt-";

/// タグに使うダイジェストの桁数
const TAG_DIGEST_LEN: usize = 16;

/// ダイジェストからタグを作る（`tilt-` + 先頭16文字）
pub fn digest_as_tag(digest: &Digest) -> Result<String> {
    let prefix = digest
        .encoded()
        .get(..TAG_DIGEST_LEN)
        .ok_or_else(|| BuildError::DigestTooShort(digest.to_string()))?;
    Ok(format!("{}{}", TAG_PREFIX, prefix))
}

/// ビルド結果から `ID` のダイジェストを取り出す
fn digest_from_aux(aux: &Value) -> Result<Digest> {
    let id = aux
        .get("ID")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| BuildError::MissingDigest {
            field: "ID",
            payload: aux.to_string(),
        })?;

    Digest::parse(id).map_err(|e| BuildError::Protocol(e.to_string()))
}

pub struct ImageBuilder<S> {
    service: S,
    progress: Arc<dyn ProgressSink>,
    auth: RegistryAuth,
}

impl<S: ImageService> ImageBuilder<S> {
    pub fn new(service: S) -> Self {
        Self {
            service,
            progress: Arc::new(NullProgress),
            auth: RegistryAuth::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_auth(mut self, auth: RegistryAuth) -> Self {
        self.auth = auth;
        self
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// ベースDockerfileからイメージをビルド
    ///
    /// ベースDockerfileに ADD / COPY / ENTRYPOINT があればビルドせずにエラー。
    #[instrument(skip_all, fields(image = %reference))]
    pub async fn build_from_scratch(
        &self,
        reference: &ImageRef,
        base_dockerfile: &Dockerfile,
        mounts: &[Mount],
        steps: &[Cmd],
        entrypoint: &Cmd,
    ) -> Result<ImageRef> {
        base_dockerfile.validate_base()?;

        let paths = mounts_to_path_mappings(mounts);
        self.build_image(reference, base_dockerfile, &paths, steps, entrypoint)
            .await
    }

    /// ビルド済みイメージの上に変更分だけを積んで再ビルド
    #[instrument(skip_all, fields(image = %existing))]
    pub async fn build_from_existing(
        &self,
        existing: &ImageRef,
        paths: &[PathMapping],
        steps: &[Cmd],
    ) -> Result<ImageRef> {
        let dockerfile = Dockerfile::from_existing(existing);
        self.build_image(existing, &dockerfile, paths, steps, &Cmd::default())
            .await
    }

    async fn build_image(
        &self,
        reference: &ImageRef,
        dockerfile: &Dockerfile,
        paths: &[PathMapping],
        steps: &[Cmd],
        entrypoint: &Cmd,
    ) -> Result<ImageRef> {
        tracing::info!("Building image: {}", reference);

        let missing = ContextBuilder::missing_local_paths(paths)?;
        let mut df = dockerfile.clone();
        if !missing.is_empty() {
            tracing::warn!(
                "{} mounted path(s) no longer exist, removing them from the image",
                missing.len()
            );
            df = df.strip_paths(&missing).rm_paths(&missing);
        }

        df = df.add_all();
        for step in steps {
            df = df.run(step);
        }
        if !entrypoint.is_empty() {
            df = df.entrypoint(entrypoint);
        }
        tracing::debug!("Synthesized Dockerfile:\n{}", df);

        let context = ContextBuilder::create_context(&df, paths)?;
        self.submit(reference, context, ImageBuildOptions::default())
            .await
    }

    /// Dockerfile とビルドディレクトリから一括ビルド
    #[instrument(skip_all, fields(image = %reference))]
    pub async fn build_static(
        &self,
        reference: &ImageRef,
        dockerfile: &Dockerfile,
        build_path: &Path,
        build_args: &[(String, String)],
    ) -> Result<ImageRef> {
        tracing::info!("Building image: {}", reference);

        if !build_path.is_dir() {
            return Err(BuildError::InvalidConfig(format!(
                "build path is not a directory: {}",
                build_path.display()
            )));
        }

        let root = PathMapping {
            local_path: build_path.to_path_buf(),
            container_path: "/".to_string(),
        };
        let context = ContextBuilder::create_context(dockerfile, std::slice::from_ref(&root))?;
        let options = ImageBuildOptions {
            build_args: build_args.to_vec(),
            ..Default::default()
        };
        self.submit(reference, context, options).await
    }

    /// コンテキストを送信し、結果のダイジェストでタグを付ける
    async fn submit(
        &self,
        reference: &ImageRef,
        context: Vec<u8>,
        options: ImageBuildOptions,
    ) -> Result<ImageRef> {
        let messages = self.service.build(context, options).await?;

        let aux = read_docker_output(messages, self.progress.clone())
            .await?
            .ok_or(BuildError::NoResult)?;
        let digest = digest_from_aux(&aux)?;

        let tagged = self.tag_image(reference, &digest).await?;
        tracing::info!("Successfully built: {}", tagged);
        Ok(tagged)
    }

    /// ダイジェストから作ったタグをイメージに付ける
    pub async fn tag_image(&self, reference: &ImageRef, digest: &Digest) -> Result<ImageRef> {
        let tagged = reference.with_tag(digest_as_tag(digest)?);
        self.service.tag(&digest.to_string(), &tagged).await?;
        Ok(tagged)
    }

    /// イメージをレジストリにプッシュ
    ///
    /// 参照はそのまま返す（タグは付け替えない）。
    #[instrument(skip_all, fields(image = %reference))]
    pub async fn push_image(&self, reference: &ImageRef) -> Result<ImageRef> {
        if reference.domain().is_none() {
            return Err(BuildError::MissingDomain(reference.to_string()));
        }

        let auth = self.auth.push_auth(reference)?;
        let messages = self.service.push(reference, auth).await?;

        let aux = match read_docker_output(messages, self.progress.clone()).await {
            Ok(aux) => aux.ok_or(BuildError::NoResult)?,
            Err(BuildError::BuildFailed(message)) => {
                return Err(BuildError::PushFailed { message });
            }
            Err(e) => return Err(e),
        };

        match aux.get("Digest").and_then(Value::as_str) {
            Some(digest) if !digest.is_empty() => {
                tracing::info!("Pushed {} ({})", reference, digest);
                Ok(reference.clone())
            }
            _ => Err(BuildError::MissingDigest {
                field: "Digest",
                payload: aux.to_string(),
            }),
        }
    }
}

//! コンテナビルドサービス
//!
//! ビルド・プッシュ・タグ付けの3操作を `ImageService` として抽象化し、
//! Docker Engine API (bollard) による実装を提供します。

use crate::context::DOCKERFILE_PATH;
use crate::error::{BuildError, Result};
use crate::stream::{JsonError, JsonMessage, MessageStream};
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::models::{BuildInfo, PushImageInfo};
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use http_body_util::{Either, Full};
use serde_json::json;
use skiff_core::ImageRef;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

/// ビルドオプション
///
/// Dockerfile の位置と、Dockerfile ビルドの場合のビルド引数だけを指定する。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuildOptions {
    pub dockerfile: String,
    pub build_args: Vec<(String, String)>,
}

impl Default for ImageBuildOptions {
    fn default() -> Self {
        Self {
            dockerfile: DOCKERFILE_PATH.to_string(),
            build_args: Vec::new(),
        }
    }
}

/// 認証失敗時に認証情報を取り直すコールバック
pub type PrivilegeFn = Arc<dyn Fn() -> Result<Option<DockerCredentials>> + Send + Sync>;

/// プッシュ時の認証
#[derive(Clone, Default)]
pub struct PushAuth {
    pub credentials: Option<DockerCredentials>,
    pub privilege: Option<PrivilegeFn>,
}

impl fmt::Debug for PushAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushAuth")
            .field("has_credentials", &self.credentials.is_some())
            .field("has_privilege", &self.privilege.is_some())
            .finish()
    }
}

/// コンテナのビルド・プッシュ・タグ付けを行うサービス
pub trait ImageService: Send + Sync {
    /// ビルドコンテキスト（tar.gz）を送信し、出力ストリームを返す
    fn build(
        &self,
        context: Vec<u8>,
        options: ImageBuildOptions,
    ) -> impl Future<Output = Result<MessageStream>> + Send;

    /// イメージをプッシュし、出力ストリームを返す
    fn push(
        &self,
        image: &ImageRef,
        auth: PushAuth,
    ) -> impl Future<Output = Result<MessageStream>> + Send;

    /// `source`（イメージID等）に `target` のタグを付ける
    fn tag(&self, source: &str, target: &ImageRef) -> impl Future<Output = Result<()>> + Send;
}

/// Docker Engine API によるサービス
#[derive(Clone)]
pub struct DockerService {
    docker: Docker,
}

impl DockerService {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// `DOCKER_HOST` またはローカルのデフォルトソケットに接続
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::new(docker))
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    fn push_stream(
        &self,
        name: &str,
        tag: &str,
        credentials: Option<DockerCredentials>,
    ) -> BoxStream<'static, std::result::Result<PushImageInfo, bollard::errors::Error>> {
        #[allow(deprecated)]
        let options = bollard::image::PushImageOptions::<String> {
            tag: tag.to_string(),
        };

        #[allow(deprecated)]
        let stream = self.docker.push_image(name, Some(options), credentials);
        stream.boxed()
    }

    /// プッシュしたイメージのダイジェストを aux フレームとして返す
    ///
    /// Engine API のプッシュ出力は型付きで aux を持たないため、
    /// イメージの RepoDigests から同じ形の結果を組み立てる。
    async fn pushed_digest(docker: Docker, image: ImageRef) -> Result<JsonMessage> {
        let inspect = docker.inspect_image(&image.to_string()).await?;
        let name = image.name();

        let digest = inspect.repo_digests.unwrap_or_default().into_iter().find_map(|entry| {
            let (repo, digest) = entry.split_once('@')?;
            let repo = ImageRef::parse(repo).ok()?;
            (repo.name() == name).then(|| digest.to_string())
        });

        let Some(digest) = digest else {
            tracing::debug!("No repo digest recorded for {}", image);
            return Ok(JsonMessage {
                status: Some(format!("{}: no repo digest", image)),
                ..Default::default()
            });
        };

        Ok(JsonMessage {
            aux: Some(json!({
                "Tag": image.tag().unwrap_or("latest"),
                "Digest": digest,
                "Size": inspect.size.unwrap_or_default(),
            })),
            ..Default::default()
        })
    }
}

#[allow(deprecated)]
fn build_info_to_message(info: BuildInfo) -> Result<JsonMessage> {
    let aux = match info.aux {
        Some(aux) => Some(
            serde_json::to_value(aux)
                .map_err(|e| BuildError::Protocol(format!("encoding build result: {}", e)))?,
        ),
        None => None,
    };

    Ok(JsonMessage {
        stream: info.stream,
        status: info.status,
        progress: info.progress,
        id: info.id,
        error_message: info.error,
        error: info.error_detail.map(|detail| JsonError {
            code: detail.code,
            message: detail.message.unwrap_or_default(),
        }),
        aux,
    })
}

#[allow(deprecated)]
fn push_info_to_message(info: PushImageInfo) -> JsonMessage {
    JsonMessage {
        status: info.status,
        progress: info.progress,
        error_message: info.error,
        error: info.error_detail.map(|detail| JsonError {
            code: detail.code,
            message: detail.message.unwrap_or_default(),
        }),
        ..Default::default()
    }
}

fn is_unauthorized(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 401,
            ..
        }
    )
}

impl ImageService for DockerService {
    async fn build(&self, context: Vec<u8>, options: ImageBuildOptions) -> Result<MessageStream> {
        tracing::debug!("Submitting build context: {} bytes", context.len());

        if !options.build_args.is_empty() {
            tracing::debug!("Build args: {:?}", options.build_args);
        }

        #[allow(deprecated)]
        let options = bollard::image::BuildImageOptions::<String> {
            dockerfile: options.dockerfile,
            buildargs: options.build_args.into_iter().collect::<HashMap<_, _>>(),
            ..Default::default()
        };

        let body = Full::new(Bytes::from(context));

        // build_image のストリームは Docker を借用するので、
        // クローンを持つタスクからチャネル経由で受け取る
        let docker = self.docker.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            #[allow(deprecated)]
            let mut building =
                std::pin::pin!(docker.build_image(options, None, Some(Either::Left(body))));
            while let Some(item) = building.next().await {
                if tx.send(item).is_err() {
                    tracing::debug!("Build output receiver dropped");
                    break;
                }
            }
        });

        let received = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        Ok(received
            .map(|item| item.map_err(BuildError::from).and_then(build_info_to_message))
            .boxed())
    }

    async fn push(&self, image: &ImageRef, auth: PushAuth) -> Result<MessageStream> {
        let name = image.untagged().to_string();
        let tag = image.tag().unwrap_or("latest").to_string();
        tracing::info!("Pushing {}", image);

        let mut pushing = self.push_stream(&name, &tag, auth.credentials.clone());
        let mut first = pushing.next().await;

        // 最初の応答が 401 なら認証情報を取り直して1度だけやり直す
        let unauthorized = matches!(&first, Some(Err(err)) if is_unauthorized(err));
        if unauthorized && let Some(privilege) = &auth.privilege {
            tracing::info!("Registry rejected credentials for {}, retrying", image);
            let credentials = privilege()?;
            pushing = self.push_stream(&name, &tag, credentials);
            first = pushing.next().await;
        }

        let frames = stream::iter(first)
            .chain(pushing)
            .map(|item| item.map(push_info_to_message).map_err(BuildError::from));

        let digest = stream::once(Self::pushed_digest(self.docker.clone(), image.clone()));

        Ok(frames.chain(digest).boxed())
    }

    async fn tag(&self, source: &str, target: &ImageRef) -> Result<()> {
        let repo = target.untagged().to_string();
        let tag = target.tag().unwrap_or("latest").to_string();

        #[allow(deprecated)]
        let options = bollard::image::TagImageOptions::<String> { repo, tag };

        #[allow(deprecated)]
        self.docker.tag_image(source, Some(options)).await?;
        tracing::debug!("Tagged {} as {}", source, target);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Frame;
    use bollard::models::{ErrorDetail, ImageId};

    #[test]
    fn test_default_options_name_dockerfile() {
        assert_eq!(ImageBuildOptions::default().dockerfile, "Dockerfile");
    }

    #[test]
    #[allow(deprecated)]
    fn test_build_info_to_message() {
        let info = BuildInfo {
            stream: Some("Step 1/1 : FROM alpine\n".to_string()),
            aux: Some(ImageId {
                id: Some("sha256:abc".to_string()),
            }),
            ..Default::default()
        };
        let msg = build_info_to_message(info).unwrap();
        assert_eq!(msg.log_line(), Some("Step 1/1 : FROM alpine"));
        assert_eq!(msg.aux, Some(json!({"ID": "sha256:abc"})));

        let info = BuildInfo {
            error_detail: Some(ErrorDetail {
                code: None,
                message: Some("boom".to_string()),
            }),
            ..Default::default()
        };
        let msg = build_info_to_message(info).unwrap();
        assert_eq!(msg.error.map(|e| e.message), Some("boom".to_string()));
    }

    #[test]
    #[allow(deprecated)]
    fn test_push_info_to_message_keeps_error() {
        let info = PushImageInfo {
            error: Some("denied".to_string()),
            ..Default::default()
        };
        let msg = push_info_to_message(info);
        assert_eq!(msg.error_message.as_deref(), Some("denied"));
        assert!(msg.aux.is_none());
    }

    #[test]
    #[allow(deprecated)]
    fn test_push_info_error_detail_is_an_error_frame() {
        let info = PushImageInfo {
            error_detail: Some(ErrorDetail {
                code: Some(401),
                message: Some("unauthorized: authentication required".to_string()),
            }),
            ..Default::default()
        };
        let msg = push_info_to_message(info);
        assert_eq!(
            msg.into_frame(),
            Frame::Error("unauthorized: authentication required".to_string())
        );
    }

    #[test]
    fn test_push_auth_debug_hides_credentials() {
        let auth = PushAuth {
            credentials: Some(DockerCredentials {
                password: Some("secret".to_string()),
                ..Default::default()
            }),
            privilege: None,
        };
        let debug = format!("{:?}", auth);
        assert!(!debug.contains("secret"));
        assert!(debug.contains("has_credentials: true"));
    }

    #[tokio::test]
    #[ignore] // Docker接続が必要なため、通常のテストではスキップ
    async fn test_build_stream_outlives_service_borrow() {
        use crate::context::ContextBuilder;
        use crate::dockerfile::Dockerfile;
        use crate::progress::NullProgress;
        use crate::stream::read_docker_output;

        let context =
            ContextBuilder::create_context(&Dockerfile::new("FROM alpine:latest"), &[]).unwrap();
        let messages = {
            let service = DockerService::connect().unwrap();
            service
                .build(context, ImageBuildOptions::default())
                .await
                .unwrap()
        };

        let aux = read_docker_output(messages, Arc::new(NullProgress))
            .await
            .unwrap()
            .unwrap();
        assert!(aux["ID"].as_str().unwrap().starts_with("sha256:"));
    }

    #[tokio::test]
    #[ignore] // Docker接続が必要なため、通常のテストではスキップ
    async fn test_tag_missing_image_fails() {
        let service = DockerService::connect().unwrap();
        let target = ImageRef::parse("skiff-test:tilt-0000000000000000").unwrap();
        assert!(service.tag("sha256:0000", &target).await.is_err());
    }
}

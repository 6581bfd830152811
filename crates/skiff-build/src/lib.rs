//! skiff のイメージビルドパイプライン
//!
//! ベースDockerfileとマウント定義からビルドコンテキストを合成し、
//! コンテナビルドサービスに送信して、出力ストリームから得たダイジェストで
//! イメージにタグを付けます。レジストリへのプッシュも提供します。

pub mod auth;
pub mod builder;
pub mod context;
pub mod dockerfile;
pub mod error;
pub mod progress;
pub mod service;
pub mod stream;
pub mod trace;

pub use auth::RegistryAuth;
pub use builder::{ImageBuilder, TAG_PREFIX, digest_as_tag};
pub use context::ContextBuilder;
pub use dockerfile::Dockerfile;
pub use error::{BuildError, BuildResult, ErrorKind};
pub use progress::{ConsoleProgress, NullProgress, ProgressSink, SolveStatus};
pub use service::{DockerService, ImageBuildOptions, ImageService, PrivilegeFn, PushAuth};
pub use stream::{Frame, JsonMessage, MessageStream, read_docker_output};

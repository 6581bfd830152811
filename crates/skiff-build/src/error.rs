use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Invalid Dockerfile: {0}")]
    InvalidDockerfile(String),

    #[error("Invalid build configuration: {0}")]
    InvalidConfig(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("No result found in docker output")]
    NoResult,

    #[error("{field} not found in docker output: {payload}")]
    MissingDigest { field: &'static str, payload: String },

    #[error("Digest too short: {0}")]
    DigestTooShort(String),

    #[error("Docker connection error: {0}")]
    DockerConnection(#[from] bollard::errors::Error),

    #[error("Build failed: {0}")]
    BuildFailed(String),

    #[error("Push failed: {message}")]
    PushFailed { message: String },

    #[error("Authentication failed for {registry}: {message}")]
    AuthFailed { registry: String, message: String },

    #[error("No domain in container name: {0}")]
    MissingDomain(String),

    #[error("{context}: {source}")]
    Service {
        context: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// エラーの分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 設定の誤り（リトライしても解決しない）
    Configuration,
    /// ストリームの内容が想定外
    Protocol,
    /// ビルドサービス・レジストリ側の失敗
    Runtime,
    Io,
}

impl BuildError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BuildError::InvalidDockerfile(_) | BuildError::InvalidConfig(_) => {
                ErrorKind::Configuration
            }
            BuildError::Protocol(_)
            | BuildError::NoResult
            | BuildError::MissingDigest { .. }
            | BuildError::DigestTooShort(_) => ErrorKind::Protocol,
            BuildError::DockerConnection(_)
            | BuildError::BuildFailed(_)
            | BuildError::PushFailed { .. }
            | BuildError::AuthFailed { .. }
            | BuildError::MissingDomain(_)
            | BuildError::Service { .. } => ErrorKind::Runtime,
            BuildError::Io(_) => ErrorKind::Io,
        }
    }

    /// 外部サービスのエラーに文脈を付ける
    pub fn service(
        context: &'static str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        BuildError::Service {
            context,
            source: source.into(),
        }
    }

    /// ユーザー向けの分かりやすいエラーメッセージ
    pub fn user_message(&self) -> String {
        match self {
            BuildError::InvalidDockerfile(msg) => {
                format!(
                    "ベースDockerfileが不正です: {}\n\
                     \n\
                     ADD / COPY / ENTRYPOINT はマウントとエントリポイントの設定から\n\
                     自動的に追加されます。ベースDockerfileからは削除してください。",
                    msg
                )
            }
            BuildError::BuildFailed(msg) => {
                format!(
                    "ビルドに失敗しました: {}\n\
                     \n\
                     ビルドステップの内容を確認してください。",
                    msg
                )
            }
            BuildError::MissingDomain(image) => {
                format!(
                    "プッシュ先のレジストリが不明です: {}\n\
                     \n\
                     イメージ名にレジストリを含めてください（例: gcr.io/org/app）",
                    image
                )
            }
            BuildError::AuthFailed { registry, .. } => {
                format!(
                    "{} の認証に失敗しました。\n\
                     \n\
                     docker login {} を実行してください。",
                    registry, registry
                )
            }
            _ => format!("{}", self),
        }
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;
pub type BuildResult<T> = Result<T>;

//! イメージ参照とダイジェスト

use crate::error::{FlowError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Docker Hub の別名（比較時には取り除く）
const DOCKER_HUB_DOMAINS: [&str; 2] = ["docker.io", "index.docker.io"];

/// コンテナイメージ参照
///
/// `[domain/]path[:tag][@digest]` 形式。
///
/// # Examples
/// - `app` -> domain なし、path `app`
/// - `gcr.io/org/app:v1` -> domain `gcr.io`、path `org/app`、tag `v1`
/// - `localhost:5000/app` -> domain `localhost:5000`、path `app`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageRef {
    domain: Option<String>,
    path: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageRef {
    /// 文字列からパース
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = |message: &str| FlowError::InvalidImageRef {
            reference: s.to_string(),
            message: message.to_string(),
        };

        let s = s.trim();
        if s.is_empty() {
            return Err(invalid("空の参照"));
        }

        let (rest, digest) = match s.split_once('@') {
            Some((rest, digest)) => {
                if !digest.contains(':') {
                    return Err(invalid("ダイジェストは algorithm:hex 形式である必要があります"));
                }
                (rest, Some(digest.to_string()))
            }
            None => (s, None),
        };

        // 最後の / 以降にある : だけがタグ区切り（localhost:5000/app のポートと区別）
        let last_slash = rest.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match rest[last_slash..].rfind(':') {
            Some(pos) => {
                let pos = last_slash + pos;
                (&rest[..pos], Some(rest[pos + 1..].to_string()))
            }
            None => (rest, None),
        };

        if let Some(tag) = &tag
            && (tag.is_empty() || tag.len() > 128)
        {
            return Err(invalid("タグの長さが不正です"));
        }

        let (domain, path) = match name.split_once('/') {
            Some((first, remainder))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first.to_string()), remainder.to_string())
            }
            _ => (None, name.to_string()),
        };

        if path.is_empty() || path.split('/').any(str::is_empty) {
            return Err(invalid("リポジトリ名が空です"));
        }
        if path.chars().any(|c| c.is_ascii_uppercase() || c.is_whitespace()) {
            return Err(invalid("リポジトリ名は小文字である必要があります"));
        }

        Ok(Self {
            domain,
            path,
            tag,
            digest,
        })
    }

    /// 明示されたレジストリドメイン
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// タグ・ダイジェストを除いた正規化名（比較キー）
    ///
    /// `docker.io/library/app` と `app` は同じ名前として扱う。
    pub fn name(&self) -> String {
        match self.domain.as_deref() {
            Some(domain) if DOCKER_HUB_DOMAINS.contains(&domain) => self
                .path
                .strip_prefix("library/")
                .unwrap_or(&self.path)
                .to_string(),
            Some(domain) => format!("{}/{}", domain, self.path),
            None => self
                .path
                .strip_prefix("library/")
                .unwrap_or(&self.path)
                .to_string(),
        }
    }

    /// パスの最後のセグメント
    pub fn base_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// タグを付け替えた参照を返す（ダイジェストは外す）
    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            domain: self.domain.clone(),
            path: self.path.clone(),
            tag: Some(tag.into()),
            digest: None,
        }
    }

    /// タグ・ダイジェストなしの参照
    pub fn untagged(&self) -> Self {
        Self {
            domain: self.domain.clone(),
            path: self.path.clone(),
            tag: None,
            digest: None,
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(domain) = &self.domain {
            write!(f, "{}/", domain)?;
        }
        write!(f, "{}", self.path)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl FromStr for ImageRef {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ImageRef {
    type Error = FlowError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<ImageRef> for String {
    fn from(r: ImageRef) -> Self {
        r.to_string()
    }
}

/// コンテンツダイジェスト（`sha256:abcd...`）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: String,
    encoded: String,
}

impl Digest {
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((algorithm, encoded)) if !algorithm.is_empty() && !encoded.is_empty() => {
                Ok(Self {
                    algorithm: algorithm.to_string(),
                    encoded: encoded.to_string(),
                })
            }
            _ => Err(FlowError::InvalidImageRef {
                reference: s.to_string(),
                message: "ダイジェストは algorithm:hex 形式である必要があります".to_string(),
            }),
        }
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// ハッシュ値部分
    pub fn encoded(&self) -> &str {
        &self.encoded
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

impl FromStr for Digest {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = FlowError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.to_string()
    }
}

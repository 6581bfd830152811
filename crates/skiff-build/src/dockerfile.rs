//! Dockerfile の合成

use crate::error::{BuildError, Result};
use skiff_core::{Cmd, ImageRef, PathMapping};
use std::fmt;

/// ベースDockerfileに書いてはいけない命令（パイプライン側で追加する）
const RESERVED_INSTRUCTIONS: [&str; 3] = ["ADD", "COPY", "ENTRYPOINT"];

/// Dockerfile テキスト
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dockerfile(String);

impl Dockerfile {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// ビルド済みイメージをベースにした Dockerfile
    pub fn from_existing(existing: &ImageRef) -> Self {
        Self(format!("FROM {}", existing))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// ベースDockerfileとして使えるか検証
    pub fn validate_base(&self) -> Result<()> {
        let instructions = self.instructions();
        if instructions.is_empty() {
            return Err(BuildError::InvalidDockerfile(
                "base Dockerfile is empty".to_string(),
            ));
        }
        for (keyword, line) in &instructions {
            if RESERVED_INSTRUCTIONS.contains(&keyword.as_str()) {
                return Err(BuildError::InvalidDockerfile(format!(
                    "base Dockerfile must not contain {}: {}",
                    keyword, line
                )));
            }
        }
        Ok(())
    }

    /// 1行追加した新しい Dockerfile
    pub fn join(&self, line: &str) -> Self {
        if self.0.is_empty() {
            return Self(line.to_string());
        }
        Self(format!("{}\n{}", self.0.trim_end_matches('\n'), line))
    }

    /// コンテキスト全体を追加
    pub fn add_all(&self) -> Self {
        self.join("ADD . /")
    }

    pub fn run(&self, cmd: &Cmd) -> Self {
        self.join(&format!("RUN {}", cmd.to_exec_form()))
    }

    pub fn entrypoint(&self, cmd: &Cmd) -> Self {
        self.join(&format!("ENTRYPOINT {}", cmd.to_exec_form()))
    }

    /// 消えたパスを参照する ADD / COPY 命令を取り除く
    pub fn strip_paths(&self, missing: &[PathMapping]) -> Self {
        if missing.is_empty() {
            return self.clone();
        }
        let kept: Vec<&str> = self
            .0
            .lines()
            .filter(|line| !references_missing(line, missing))
            .collect();
        Self(kept.join("\n"))
    }

    /// 消えたパスをイメージからも削除
    pub fn rm_paths(&self, missing: &[PathMapping]) -> Self {
        if missing.is_empty() {
            return self.clone();
        }
        let mut paths: Vec<&str> = missing.iter().map(|m| m.container_path.as_str()).collect();
        paths.sort_unstable();
        paths.dedup();
        self.join(&format!("RUN rm -rf {}", paths.join(" ")))
    }

    /// (大文字の命令名, 命令) の一覧
    ///
    /// 行末の `\` による継続行は1つの命令にまとめる。
    fn instructions(&self) -> Vec<(String, String)> {
        let mut result = Vec::new();
        let mut current = String::new();

        for line in self.0.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match trimmed.strip_suffix('\\') {
                Some(head) => {
                    current.push_str(head.trim_end());
                    current.push(' ');
                }
                None => {
                    current.push_str(trimmed);
                    push_instruction(&mut result, std::mem::take(&mut current));
                }
            }
        }
        push_instruction(&mut result, current);
        result
    }
}

fn push_instruction(instructions: &mut Vec<(String, String)>, text: String) {
    let text = text.trim().to_string();
    if let Some(keyword) = text.split_whitespace().next() {
        instructions.push((keyword.to_ascii_uppercase(), text));
    }
}

fn references_missing(line: &str, missing: &[PathMapping]) -> bool {
    let mut tokens = line.split_whitespace();
    let Some(keyword) = tokens.next() else {
        return false;
    };
    if !matches!(keyword.to_ascii_uppercase().as_str(), "ADD" | "COPY") {
        return false;
    }
    let args: Vec<&str> = tokens.filter(|t| !t.starts_with("--")).collect();
    missing.iter().any(|m| {
        let local = m.local_path.to_string_lossy();
        args.iter()
            .any(|a| *a == m.container_path || *a == &*local)
    })
}

impl fmt::Display for Dockerfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn mapping(local: &str, container: &str) -> PathMapping {
        PathMapping {
            local_path: PathBuf::from(local),
            container_path: container.to_string(),
        }
    }

    #[test]
    fn test_validate_base_rejects_reserved() {
        assert!(Dockerfile::new("FROM alpine\nRUN echo hi").validate_base().is_ok());

        for bad in [
            "FROM alpine\nADD . /app",
            "FROM alpine\ncopy main.go /",
            "FROM alpine\nENTRYPOINT [\"sh\"]",
        ] {
            let err = Dockerfile::new(bad).validate_base().unwrap_err();
            assert!(matches!(err, BuildError::InvalidDockerfile(_)), "{}", bad);
        }
    }

    #[test]
    fn test_validate_base_rejects_empty() {
        for empty in ["", "\n\n", "# just a comment\n"] {
            assert!(matches!(
                Dockerfile::new(empty).validate_base(),
                Err(BuildError::InvalidDockerfile(msg)) if msg.contains("empty")
            ));
        }
    }

    #[test]
    fn test_validate_base_joins_continuation_lines() {
        let df = Dockerfile::new("FROM alpine\nRUN apk add --no-cache \\\n    copy \\\n    git\n");
        assert!(df.validate_base().is_ok());

        let df = Dockerfile::new("FROM alpine\nRUN echo hi \\\n  && make\nCOPY . /src");
        assert!(matches!(
            df.validate_base(),
            Err(BuildError::InvalidDockerfile(msg)) if msg.ends_with("COPY . /src")
        ));
    }

    #[test]
    fn test_validate_base_ignores_comments() {
        let df = Dockerfile::new("# ADD is added later\nFROM alpine");
        assert!(df.validate_base().is_ok());
    }

    #[test]
    fn test_synthesized_instructions() {
        let df = Dockerfile::new("FROM alpine\n")
            .add_all()
            .run(&Cmd::shell("echo hi"))
            .entrypoint(&Cmd::new(["/app/main"]));

        assert_eq!(
            df.as_str(),
            "FROM alpine\nADD . /\nRUN [\"sh\",\"-c\",\"echo hi\"]\nENTRYPOINT [\"/app/main\"]"
        );
    }

    #[test]
    fn test_from_existing() {
        let existing = ImageRef::parse("gcr.io/org/app:tilt-0123456789abcdef").unwrap();
        assert_eq!(
            Dockerfile::from_existing(&existing).as_str(),
            "FROM gcr.io/org/app:tilt-0123456789abcdef"
        );
    }

    #[test]
    fn test_strip_paths() {
        let df = Dockerfile::new("FROM base\nADD /src/gone /app/gone\nCOPY keep /keep\nRUN ls");
        let stripped = df.strip_paths(&[mapping("/src/gone", "/app/gone")]);
        assert_eq!(stripped.as_str(), "FROM base\nCOPY keep /keep\nRUN ls");

        assert_eq!(df.strip_paths(&[]), df);
    }

    #[test]
    fn test_rm_paths_sorted() {
        let df = Dockerfile::new("FROM base").rm_paths(&[
            mapping("/src/b", "/app/b"),
            mapping("/src/a", "/app/a"),
        ]);
        assert_eq!(df.as_str(), "FROM base\nRUN rm -rf /app/a /app/b");
    }
}

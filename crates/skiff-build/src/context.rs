use crate::dockerfile::Dockerfile;
use crate::error::{BuildError, BuildResult};
use flate2::Compression;
use flate2::write::GzEncoder;
use skiff_core::PathMapping;
use std::io;
use std::path::Path;
use tar::Builder;

/// アーカイブ内の Dockerfile の配置先
pub const DOCKERFILE_PATH: &str = "Dockerfile";

pub struct ContextBuilder;

impl ContextBuilder {
    /// ローカルに存在しなくなったパスを列挙
    pub fn missing_local_paths(paths: &[PathMapping]) -> BuildResult<Vec<PathMapping>> {
        let mut missing = Vec::new();
        for p in paths {
            if !is_live(&p.local_path)? {
                missing.push(p.clone());
            }
        }
        Ok(missing)
    }

    /// ビルドコンテキストをtar.gzアーカイブとして作成
    ///
    /// 各パスはコンテナ内パスに配置し、最後に Dockerfile を追加する。
    /// 存在しないパスは読み飛ばす。
    pub fn create_context(dockerfile: &Dockerfile, paths: &[PathMapping]) -> BuildResult<Vec<u8>> {
        tracing::debug!("Creating build context from {} paths", paths.len());

        // tarアーカイブの作成
        let mut archive_data = Vec::new();
        {
            let encoder = GzEncoder::new(&mut archive_data, Compression::default());
            let mut tar = Builder::new(encoder);
            tar.follow_symlinks(false);

            for p in paths {
                Self::append_path(&mut tar, p)?;
            }

            // Dockerfileを "Dockerfile" として追加
            let content = dockerfile.as_str().as_bytes();
            let mut header = tar::Header::new_gnu();
            header.set_path(DOCKERFILE_PATH).map_err(|e| {
                BuildError::InvalidConfig(format!("Failed to set Dockerfile path: {}", e))
            })?;
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();

            tar.append(&header, content).map_err(BuildError::Io)?;

            tar.into_inner()?.finish()?;
        }

        tracing::debug!("Build context created: {} bytes", archive_data.len());

        // コンテキストサイズの警告
        Self::check_context_size(archive_data.len());

        Ok(archive_data)
    }

    fn append_path<W: io::Write>(tar: &mut Builder<W>, p: &PathMapping) -> BuildResult<()> {
        let metadata = match std::fs::symlink_metadata(&p.local_path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("Skipping missing path: {}", p.local_path.display());
                return Ok(());
            }
            Err(e) => return Err(BuildError::Io(e)),
        };

        let dest = p.container_path.trim_start_matches('/');
        if metadata.is_dir() {
            let dest = if dest.is_empty() { "." } else { dest };
            tar.append_dir_all(dest, &p.local_path)?;
        } else {
            if dest.is_empty() {
                return Err(BuildError::InvalidConfig(format!(
                    "Cannot place file {} at container root",
                    p.local_path.display()
                )));
            }
            tar.append_path_with_name(&p.local_path, dest)?;
        }
        Ok(())
    }

    /// コンテキストサイズのチェックと警告
    fn check_context_size(size: usize) {
        const MAX_CONTEXT_SIZE: usize = 500 * 1024 * 1024; // 500MB

        if size > MAX_CONTEXT_SIZE {
            tracing::warn!(
                "警告: ビルドコンテキストが大きすぎます（{}MB）\n\
                 マウントするパスを絞り込むことを推奨します。",
                size / 1024 / 1024
            );
        }
    }
}

/// パスが存在するか（NotFound 以外のエラーはそのまま返す）
fn is_live(path: &Path) -> BuildResult<bool> {
    match std::fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(BuildError::Io(e)),
    }
}

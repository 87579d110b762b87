//! ビルドコンテキスト（tar.gz）の作成

use crate::error::Result;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::path::Path;
use tar::Builder;

/// コンテキスト外の Dockerfile を入れる際のエントリ名
const EXTERNAL_DOCKERFILE_NAME: &str = ".buildflow.Dockerfile";
/// コンテキストから除外するディレクトリ
const EXCLUDED_DIRS: [&str; 1] = [".git"];

/// エンジンに送るビルドコンテキスト
#[derive(Debug)]
pub struct BuildContext {
    pub archive: Vec<u8>,
    /// アーカイブ内での Dockerfile のパス
    pub dockerfile: String,
}

impl BuildContext {
    /// ディレクトリを tar.gz 化する
    ///
    /// Dockerfile がコンテキスト内にあればその相対パスを、
    /// 外にあれば専用の名前でアーカイブに追加して使う。
    pub fn create(context_dir: &Path, dockerfile: &Path) -> Result<Self> {
        tracing::debug!("Creating build context from: {}", context_dir.display());

        let mut archive = Vec::new();
        let dockerfile_name;
        {
            let encoder = GzEncoder::new(&mut archive, Compression::default());
            let mut tar = Builder::new(encoder);
            tar.follow_symlinks(false);

            append_tree(&mut tar, context_dir, Path::new(""))?;

            dockerfile_name = match dockerfile.strip_prefix(context_dir) {
                Ok(rel) if dockerfile.is_file() => rel.to_string_lossy().into_owned(),
                _ => {
                    let content = std::fs::read(dockerfile)?;
                    let mut header = tar::Header::new_gnu();
                    header.set_size(content.len() as u64);
                    header.set_mode(0o644);
                    tar.append_data(&mut header, EXTERNAL_DOCKERFILE_NAME, &content[..])?;
                    EXTERNAL_DOCKERFILE_NAME.to_string()
                }
            };

            tar.into_inner()?.finish()?;
        }

        tracing::debug!("Build context created: {} bytes", archive.len());
        check_context_size(archive.len());

        Ok(Self {
            archive,
            dockerfile: dockerfile_name,
        })
    }
}

fn append_tree<W: std::io::Write>(tar: &mut Builder<W>, root: &Path, rel: &Path) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(root.join(rel))?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        let rel_path = rel.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if rel.as_os_str().is_empty() && EXCLUDED_DIRS.iter().any(|d| name == *d) {
                continue;
            }
            tar.append_dir(&rel_path, entry.path())?;
            append_tree(tar, root, &rel_path)?;
        } else {
            tar.append_path_with_name(entry.path(), &rel_path)?;
        }
    }
    Ok(())
}

fn check_context_size(size: usize) {
    const MAX_CONTEXT_SIZE: usize = 500 * 1024 * 1024;

    if size > MAX_CONTEXT_SIZE {
        tracing::warn!(
            "ビルドコンテキストが大きすぎます（{}MB）。.git 以外の不要なファイルがないか確認してください",
            size / 1024 / 1024
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn unpack(archive: Vec<u8>) -> tempfile::TempDir {
        let out = tempdir().unwrap();
        let decoder = flate2::read::GzDecoder::new(std::io::Cursor::new(archive));
        tar::Archive::new(decoder).unpack(out.path()).unwrap();
        out
    }

    #[test]
    fn test_create_context_with_inner_dockerfile() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM alpine\n").unwrap();
        fs::create_dir_all(dir.path().join("src/bin")).unwrap();
        fs::write(dir.path().join("src/bin/app.sh"), "echo hi").unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref: refs/heads/main").unwrap();

        let context = BuildContext::create(dir.path(), &dir.path().join("Dockerfile")).unwrap();
        assert_eq!(context.dockerfile, "Dockerfile");

        let out = unpack(context.archive);
        assert!(out.path().join("Dockerfile").exists());
        assert!(out.path().join("src/bin/app.sh").exists());
        assert!(!out.path().join(".git").exists());
    }

    #[test]
    fn test_create_context_with_external_dockerfile() {
        let context_dir = tempdir().unwrap();
        fs::write(context_dir.path().join("data.txt"), "x").unwrap();
        let other = tempdir().unwrap();
        fs::write(other.path().join("Containerfile"), "FROM scratch\n").unwrap();

        let context =
            BuildContext::create(context_dir.path(), &other.path().join("Containerfile")).unwrap();
        assert_eq!(context.dockerfile, EXTERNAL_DOCKERFILE_NAME);

        let out = unpack(context.archive);
        let content = fs::read_to_string(out.path().join(EXTERNAL_DOCKERFILE_NAME)).unwrap();
        assert_eq!(content, "FROM scratch\n");
        assert!(out.path().join("data.txt").exists());
    }
}

use std::path::{Path, PathBuf};

use futures::future::BoxFuture;

use weft_core::error::{Result, WeftError};
use weft_core::traits::{NativeApi, ReadDirOptions};

/// `NativeApi` over the local filesystem.
///
/// Relative paths resolve against `base_dir` when one is set, otherwise
/// against the process working directory.
#[derive(Debug, Clone, Default)]
pub struct FsNativeApi {
    base_dir: Option<PathBuf>,
}

impl FsNativeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    fn resolve(&self, p: &str) -> PathBuf {
        let path = PathBuf::from(p);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        }
    }
}

fn io_error(path: &Path, e: std::io::Error) -> WeftError {
    WeftError::NativeApi(format!("{}: {}", path.display(), e))
}

impl NativeApi for FsNativeApi {
    fn create_dir(&self, path: String, recursive: bool) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let path = self.resolve(&path);
            let result = if recursive {
                tokio::fs::create_dir_all(&path).await
            } else {
                tokio::fs::create_dir(&path).await
            };
            result.map_err(|e| io_error(&path, e))
        })
    }

    fn read_dir(&self, path: String, options: ReadDirOptions) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let root = self.resolve(&path);
            let mut found = Vec::new();
            let mut pending = vec![root.clone()];

            while let Some(dir) = pending.pop() {
                let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| io_error(&dir, e))?;
                while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
                    let entry_path = entry.path();
                    let shown = if options.relative {
                        entry_path.strip_prefix(&root).unwrap_or(&entry_path).to_path_buf()
                    } else {
                        entry_path.clone()
                    };
                    let shown = shown.to_string_lossy().into_owned();
                    if options.ignores.iter().any(|pattern| shown.contains(pattern.as_str())) {
                        continue;
                    }

                    let is_dir = entry
                        .file_type()
                        .await
                        .map_err(|e| io_error(&entry_path, e))?
                        .is_dir();
                    if is_dir {
                        if options.recursive {
                            pending.push(entry_path);
                        }
                        if options.include_directories {
                            found.push(shown);
                        }
                    } else {
                        found.push(shown);
                    }
                }
            }

            found.sort();
            Ok(found)
        })
    }

    fn read_text_file(&self, path: String) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let path = self.resolve(&path);
            tokio::fs::read_to_string(&path).await.map_err(|e| io_error(&path, e))
        })
    }

    fn read_binary_file(&self, path: String) -> BoxFuture<'_, Result<Vec<u8>>> {
        Box::pin(async move {
            let path = self.resolve(&path);
            tokio::fs::read(&path).await.map_err(|e| io_error(&path, e))
        })
    }

    fn write_text_file(&self, path: String, data: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let path = self.resolve(&path);
            tokio::fs::write(&path, data).await.map_err(|e| io_error(&path, e))
        })
    }

    fn write_binary_file(&self, path: String, data: Vec<u8>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let path = self.resolve(&path);
            tokio::fs::write(&path, data).await.map_err(|e| io_error(&path, e))
        })
    }

    fn exists(&self, path: String) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let path = self.resolve(&path);
            tokio::fs::try_exists(&path).await.map_err(|e| io_error(&path, e))
        })
    }

    fn join(&self, parts: &[&str]) -> String {
        parts
            .iter()
            .collect::<PathBuf>()
            .to_string_lossy()
            .into_owned()
    }

    /// Appends ` (1)`, ` (2)`, ... before the extension until the name is free.
    fn unique_filename(&self, path: String) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            if !self.exists(path.clone()).await? {
                return Ok(path);
            }

            let original = PathBuf::from(&path);
            let stem = original
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let extension = original
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default();

            let mut n = 1;
            loop {
                let candidate = original
                    .with_file_name(format!("{stem} ({n}){extension}"))
                    .to_string_lossy()
                    .into_owned();
                if !self.exists(candidate.clone()).await? {
                    return Ok(candidate);
                }
                n += 1;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_dir_options() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub/node_modules")).unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("sub/node_modules/c.txt"), "c").unwrap();

        let api = FsNativeApi::with_base_dir(dir.path());
        let flat = api
            .read_dir(".".into(), ReadDirOptions { relative: true, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(flat, vec!["a.txt"]);

        let deep = api
            .read_dir(
                ".".into(),
                ReadDirOptions {
                    recursive: true,
                    relative: true,
                    ignores: vec!["node_modules".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(deep, vec!["a.txt".to_string(), api.join(&["sub", "b.txt"])]);
    }

    #[tokio::test]
    async fn test_unique_filename_adds_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let api = FsNativeApi::new();
        let path = api.join(&[dir.path().to_str().unwrap(), "report.md"]);

        assert_eq!(api.unique_filename(path.clone()).await.unwrap(), path);
        api.write_text_file(path.clone(), "x".into()).await.unwrap();
        let next = api.unique_filename(path).await.unwrap();
        assert!(next.ends_with("report (1).md"));
    }
}

//! 文件夹拖入展开
//!
//! 负责:
//! - 递归扫描本地文件夹（walkdir）
//! - 保留目录结构：相对路径以被拖入的文件夹名开头
//! - 跳过忽略列表中的系统文件

use crate::uploader::task::{FileSource, UploadItem};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 文件夹扫描配置
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// 是否跟随符号链接
    pub follow_symlinks: bool,
    /// 最大文件数量，超过此数量将停止扫描
    pub max_files: Option<usize>,
    /// 跳过隐藏文件（以.开头的文件和文件夹）
    pub skip_hidden: bool,
    /// 忽略的文件名（如 .DS_Store）
    pub ignored_names: Vec<String>,
}

/// 文件夹扫描器
#[derive(Debug, Clone, Default)]
pub struct FolderScanner {
    options: ScanOptions,
}

impl FolderScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ScanOptions) -> Self {
        Self { options }
    }

    fn is_ignored(&self, name: &str) -> bool {
        (self.options.skip_hidden && name.starts_with('.'))
            || self.options.ignored_names.iter().any(|n| n == name)
    }

    /// 展开拖入的路径列表：文件直接入列，文件夹递归展开
    pub fn expand<P: AsRef<Path>>(&self, paths: &[P]) -> Result<Vec<UploadItem>> {
        let mut items = Vec::new();

        for path in paths {
            let path = path.as_ref();
            let metadata = std::fs::metadata(path)
                .with_context(|| format!("读取文件元数据失败: {}", path.display()))?;

            if metadata.is_dir() {
                items.extend(self.scan(path)?);
            } else {
                let name = file_name(path);
                if self.is_ignored(&name) {
                    debug!("跳过忽略文件: {}", path.display());
                    continue;
                }
                items.push(UploadItem::single(FileSource::new(
                    path.to_path_buf(),
                    name,
                    metadata.len(),
                )));
            }

            if let Some(max_files) = self.options.max_files {
                if items.len() >= max_files {
                    warn!("已达到最大文件数量限制 ({}), 停止扫描", max_files);
                    items.truncate(max_files);
                    break;
                }
            }
        }

        Ok(items)
    }

    /// 递归扫描文件夹
    ///
    /// 返回的相对路径形如 `<文件夹名>/<子目录>/<文件名>`，按相对路径排序
    pub fn scan<P: AsRef<Path>>(&self, root_path: P) -> Result<Vec<UploadItem>> {
        let root_path = root_path.as_ref();

        if !root_path.is_dir() {
            anyhow::bail!("扫描路径不是文件夹: {}", root_path.display());
        }

        info!("开始扫描文件夹: {}", root_path.display());

        let root_name = file_name(root_path);
        let mut items = Vec::new();

        let walker = WalkDir::new(root_path)
            .follow_links(self.options.follow_symlinks)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !self.is_ignored(&entry.file_name().to_string_lossy()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("读取目录条目失败，跳过: {}", e);
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let size = entry
                .metadata()
                .with_context(|| format!("读取文件元数据失败: {}", entry.path().display()))?
                .len();
            let relative = relative_logical(&root_name, root_path, entry.path());
            let path: PathBuf = entry.into_path();
            let name = file_name(&path);

            items.push(UploadItem::new(FileSource::new(path, name, size), relative));

            if let Some(max_files) = self.options.max_files {
                if items.len() >= max_files {
                    warn!("已达到最大文件数量限制 ({}), 停止扫描", max_files);
                    break;
                }
            }
        }

        items.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        info!(
            "文件夹扫描完成: {} 个文件，总大小 {}",
            items.len(),
            format_bytes(items.iter().map(|i| i.source.size).sum())
        );

        Ok(items)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `<根目录名>/<相对路径>`，统一使用 `/` 分隔
fn relative_logical(root_name: &str, root: &Path, path: &Path) -> String {
    let mut segments = vec![root_name.to_string()];
    if let Ok(rel) = path.strip_prefix(root) {
        segments.extend(rel.components().map(|c| c.as_os_str().to_string_lossy().into_owned()));
    }
    segments.retain(|s| !s.is_empty());
    segments.join("/")
}

/// 格式化字节大小
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// 创建测试目录结构:
    /// photos/
    /// ├── a.jpg
    /// ├── .DS_Store
    /// ├── .hidden
    /// └── 2024/
    ///     ├── b.jpg
    ///     └── Thumbs.db
    fn create_test_folder() -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("photos");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("a.jpg"), "aaaa").unwrap();
        fs::write(root.join(".DS_Store"), "x").unwrap();
        fs::write(root.join(".hidden"), "h").unwrap();
        fs::create_dir(root.join("2024")).unwrap();
        fs::write(root.join("2024/b.jpg"), "bbbbbb").unwrap();
        fs::write(root.join("2024/Thumbs.db"), "t").unwrap();
        (temp_dir, root)
    }

    fn ignoring_os_files() -> ScanOptions {
        ScanOptions {
            ignored_names: vec![".DS_Store".to_string(), "Thumbs.db".to_string()],
            ..ScanOptions::default()
        }
    }

    #[test]
    fn test_scan_keeps_folder_name_prefix() {
        let (_tmp, root) = create_test_folder();
        let scanner = FolderScanner::with_options(ignoring_os_files());

        let items = scanner.scan(&root).unwrap();
        let paths: Vec<&str> = items.iter().map(|i| i.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["photos/.hidden", "photos/2024/b.jpg", "photos/a.jpg"]);

        let b = items.iter().find(|i| i.source.name == "b.jpg").unwrap();
        assert_eq!(b.source.size, 6);
    }

    #[test]
    fn test_skip_hidden() {
        let (_tmp, root) = create_test_folder();
        let scanner = FolderScanner::with_options(ScanOptions {
            skip_hidden: true,
            ..ignoring_os_files()
        });

        let items = scanner.scan(&root).unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_expand_mixed_paths() {
        let (tmp, root) = create_test_folder();
        let single = tmp.path().join("notes.txt");
        fs::write(&single, "n").unwrap();
        let ignored = tmp.path().join("desktop.ini");
        fs::write(&ignored, "i").unwrap();

        let mut options = ignoring_os_files();
        options.ignored_names.push("desktop.ini".to_string());
        options.skip_hidden = true;
        let scanner = FolderScanner::with_options(options);

        let items = scanner.expand(&[single, ignored, root]).unwrap();
        let paths: Vec<&str> = items.iter().map(|i| i.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["notes.txt", "photos/2024/b.jpg", "photos/a.jpg"]);
    }

    #[test]
    fn test_max_files_limit() {
        let (_tmp, root) = create_test_folder();
        let scanner = FolderScanner::with_options(ScanOptions {
            max_files: Some(1),
            ..ignoring_os_files()
        });

        assert_eq!(scanner.scan(&root).unwrap().len(), 1);
    }

    #[test]
    fn test_scan_file_not_folder() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("f.txt");
        fs::write(&file, "x").unwrap();
        assert!(FolderScanner::new().scan(&file).is_err());
        assert!(FolderScanner::new().expand(&[tmp.path().join("missing")]).is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }
}

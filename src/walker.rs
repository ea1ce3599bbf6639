use std::path::{Path, PathBuf};

use crate::{error::Result, extract::DocumentFormat};

/// A discovered document file.
#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    /// Path relative to the ingested root directory.
    pub relative_path: PathBuf,
    /// Fully resolved absolute path.
    pub absolute_path: PathBuf,
    pub format: DocumentFormat,
}

/// Recursively walk a directory and discover ingestible documents.
///
/// Skips hidden files/directories (names starting with `.`) and files
/// whose extension is not a [`DocumentFormat`]. Results are sorted by
/// relative path.
pub fn discover_files(root: &Path) -> Result<Vec<DiscoveredFile>> {
    let canonical_root = root.canonicalize()?;
    let mut results = Vec::new();
    walk_dir(&canonical_root, &canonical_root, &mut results)?;
    results.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(results)
}

fn walk_dir(
    root: &Path,
    current: &Path,
    results: &mut Vec<DiscoveredFile>,
) -> Result<()> {
    let entries = std::fs::read_dir(current)?;

    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();

        if name.starts_with('.') {
            continue;
        }

        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            walk_dir(root, &entry.path(), results)?;
        } else if file_type.is_symlink() {
            let resolved = match entry.path().canonicalize() {
                Ok(p) => p,
                Err(_) => continue, // broken symlink
            };
            // Directory links are not followed, which also rules out cycles.
            if resolved.is_file()
                && let Some(format) = DocumentFormat::from_path(&resolved)
            {
                results.push(discovered(root, &entry.path(), resolved, format));
            }
        } else if file_type.is_file()
            && let Some(format) = DocumentFormat::from_path(&entry.path())
        {
            let abs = entry.path().canonicalize()?;
            results.push(discovered(root, &entry.path(), abs, format));
        }
    }

    Ok(())
}

fn discovered(
    root: &Path,
    original_path: &Path,
    absolute_path: PathBuf,
    format: DocumentFormat,
) -> DiscoveredFile {
    let relative_path = original_path
        .strip_prefix(root)
        .unwrap_or(original_path)
        .to_path_buf();

    DiscoveredFile {
        relative_path,
        absolute_path,
        format,
    }
}

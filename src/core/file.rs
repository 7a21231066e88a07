use crate::error::{EngineError, Result};
use crate::protocol::TransferFile;
use mime_guess::from_path;
use std::path::{Path, PathBuf};
use tokio::fs;

pub fn get_mime_type(path: &Path) -> String {
    from_path(path).first_or_octet_stream().to_string()
}

/// Build transfer metadata for a single file on disk
pub async fn build_transfer_file(path: &Path) -> Result<TransferFile> {
    let metadata = fs::metadata(path).await.map_err(EngineError::from_disk)?;

    if !metadata.is_file() {
        return Err(EngineError::config(format!(
            "Not a regular file: {}",
            path.display()
        )));
    }

    let name = path
        .file_name()
        .ok_or_else(|| EngineError::config(format!("Invalid file path: {}", path.display())))?
        .to_string_lossy()
        .to_string();

    let mut file = TransferFile::new(name, metadata.len());
    file.mime_type = Some(get_mime_type(path));
    Ok(file)
}

/// Walk a directory and build metadata for every regular file inside.
///
/// `relative_path` entries are rooted at the directory's own name so the
/// receiver reproduces the folder structure under its download dir.
/// Symlinks are skipped.
pub async fn collect_directory(dir: &Path) -> Result<Vec<(PathBuf, TransferFile)>> {
    let root_name = dir
        .file_name()
        .ok_or_else(|| EngineError::config(format!("Invalid directory: {}", dir.display())))?
        .to_string_lossy()
        .to_string();

    let mut out = Vec::new();
    let mut stack = vec![(dir.to_path_buf(), PathBuf::from(&root_name))];

    while let Some((abs, rel)) = stack.pop() {
        let mut entries = fs::read_dir(&abs).await.map_err(EngineError::from_disk)?;
        while let Some(entry) = entries.next_entry().await.map_err(EngineError::from_disk)? {
            let path = entry.path();
            let file_type = entry.file_type().await.map_err(EngineError::from_disk)?;
            let child_rel = rel.join(entry.file_name());

            if file_type.is_dir() {
                stack.push((path, child_rel));
            } else if file_type.is_file() {
                let mut file = build_transfer_file(&path).await?;
                file.relative_path = child_rel.to_string_lossy().to_string();
                out.push((path, file));
            } else {
                tracing::debug!("Skipping non-regular entry {}", path.display());
            }
        }
    }

    if out.is_empty() {
        return Err(EngineError::config(format!(
            "Directory contains no files: {}",
            dir.display()
        )));
    }

    // Deterministic offer order regardless of filesystem iteration order
    out.sort_by(|a, b| a.1.relative_path.cmp(&b.1.relative_path));
    Ok(out)
}

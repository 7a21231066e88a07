use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{File, OpenOptions};

/// Strip any path components from a received file name; fall back to the
/// file id when nothing safe remains.
pub fn sanitize_file_name(name: &str, fallback: &str) -> String {
    let trimmed = name.trim();
    let file_name = Path::new(trimmed)
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.trim())
        .filter(|n| !n.is_empty() && *n != "." && *n != "..");

    file_name
        .map(|n| n.to_string())
        .unwrap_or_else(|| fallback.to_string())
}

/// A sender-supplied relative path reduced to plain normal components.
/// Absolute paths, `..` and drive prefixes are rejected.
pub fn safe_relative(path: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

fn split_file_name(name: &str) -> (&str, &str) {
    if let Some((stem, ext)) = name.rsplit_once('.') {
        if !stem.is_empty() {
            return (stem, ext);
        }
    }
    (name, "")
}

/// Create the destination file, resolving name conflicts by appending
/// ` (1)`, ` (2)`, ... before the extension. Uses create-new semantics so an
/// existing file is never overwritten, even under concurrent receives.
pub async fn open_unique_file(
    dest_dir: &Path,
    base_name: &str,
) -> Result<(PathBuf, File), std::io::Error> {
    let (stem, ext) = split_file_name(base_name);

    for index in 0..1000 {
        let candidate = if index == 0 {
            base_name.to_string()
        } else if ext.is_empty() {
            format!("{} ({})", stem, index)
        } else {
            format!("{} ({}).{}", stem, index, ext)
        };

        let path = dest_dir.join(&candidate);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }

    Err(std::io::Error::new(
        ErrorKind::AlreadyExists,
        "Too many filename conflicts",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_directories() {
        assert_eq!(sanitize_file_name("report.txt", "f1"), "report.txt");
        assert_eq!(sanitize_file_name("../../etc/passwd", "f1"), "passwd");
        assert_eq!(sanitize_file_name("dir/inner.txt", "f1"), "inner.txt");
        assert_eq!(sanitize_file_name("..", "f1"), "f1");
        assert_eq!(sanitize_file_name("   ", "f1"), "f1");
    }

    #[test]
    fn test_safe_relative() {
        assert_eq!(
            safe_relative("album/sub/b.txt"),
            Some(PathBuf::from("album/sub/b.txt"))
        );
        assert_eq!(safe_relative("./a/b"), Some(PathBuf::from("a/b")));
        assert_eq!(safe_relative("../escape"), None);
        assert_eq!(safe_relative("/absolute"), None);
        assert_eq!(safe_relative(""), None);
    }

    #[tokio::test]
    async fn test_conflicts_get_numeric_disambiguator() {
        let dir = tempfile::tempdir().unwrap();

        let (first, _) = open_unique_file(dir.path(), "report.txt").await.unwrap();
        assert_eq!(first.file_name().unwrap(), "report.txt");

        let (second, _) = open_unique_file(dir.path(), "report.txt").await.unwrap();
        assert_eq!(second.file_name().unwrap(), "report (1).txt");

        let (third, _) = open_unique_file(dir.path(), "report.txt").await.unwrap();
        assert_eq!(third.file_name().unwrap(), "report (2).txt");
    }

    #[tokio::test]
    async fn test_conflict_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        open_unique_file(dir.path(), "Makefile").await.unwrap();
        let (second, _) = open_unique_file(dir.path(), "Makefile").await.unwrap();
        assert_eq!(second.file_name().unwrap(), "Makefile (1)");
    }

    #[tokio::test]
    async fn test_hidden_file_keeps_leading_dot() {
        let dir = tempfile::tempdir().unwrap();
        open_unique_file(dir.path(), ".env").await.unwrap();
        let (second, _) = open_unique_file(dir.path(), ".env").await.unwrap();
        // ".env" has no stem, so the suffix goes after the whole name
        assert_eq!(second.file_name().unwrap(), ".env (1)");
    }
}

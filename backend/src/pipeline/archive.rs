//! Deterministic tar archives for engines whose dump tool writes a directory tree.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Archive `root` into `output`. Entries are sorted and carry no mtimes or owners,
/// so the same tree always produces the same bytes.
pub fn write_tree<W: Write>(root: &Path, output: W) -> io::Result<W> {
    let mut builder = tar::Builder::new(output);
    builder.mode(tar::HeaderMode::Deterministic);
    builder.follow_symlinks(false);

    let mut entries = Vec::new();
    collect(root, root, &mut entries)?;
    entries.sort();

    for relative in entries {
        let full = root.join(&relative);
        if full.is_dir() {
            builder.append_dir(&relative, &full)?;
        } else {
            builder.append_path_with_name(&full, &relative)?;
        }
    }
    builder.into_inner()
}

fn collect(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|e| io::Error::other(e.to_string()))?
            .to_path_buf();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            out.push(relative);
            collect(root, &path, out)?;
        } else if file_type.is_file() {
            out.push(relative);
        }
    }
    Ok(())
}

/// Unpack a tar stream into `dest`. Entries that would land outside `dest` are skipped.
pub fn extract<R: Read>(input: R, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(input);
    archive.set_preserve_permissions(false);
    archive.set_overwrite(true);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.unpack_in(dest)? {
            tracing::warn!(path = ?entry.path().ok(), "Skipping archive entry outside the restore directory");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("shop/orders")).unwrap();
        fs::write(dir.path().join("shop/orders.bson"), b"bson bytes").unwrap();
        fs::write(dir.path().join("shop/orders.metadata.json"), b"{}").unwrap();
        fs::write(dir.path().join("shop/orders/extra.bson"), b"more").unwrap();
        fs::write(dir.path().join("admin.bson"), b"admin").unwrap();
        dir
    }

    #[test]
    fn test_archive_is_deterministic() {
        let tree = sample_tree();
        let first = write_tree(tree.path(), Vec::new()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(tree.path().join("admin.bson"), b"admin").unwrap();
        let second = write_tree(tree.path(), Vec::new()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_extract_restores_tree() {
        let tree = sample_tree();
        let archive = write_tree(tree.path(), Vec::new()).unwrap();

        let out = tempfile::tempdir().unwrap();
        extract(archive.as_slice(), out.path()).unwrap();
        assert_eq!(fs::read(out.path().join("shop/orders.bson")).unwrap(), b"bson bytes");
        assert_eq!(fs::read(out.path().join("shop/orders/extra.bson")).unwrap(), b"more");
        assert_eq!(fs::read(out.path().join("admin.bson")).unwrap(), b"admin");
    }

    #[test]
    fn test_empty_tree() {
        let tree = tempfile::tempdir().unwrap();
        let archive = write_tree(tree.path(), Vec::new()).unwrap();
        let out = tempfile::tempdir().unwrap();
        extract(archive.as_slice(), out.path()).unwrap();
        assert_eq!(fs::read_dir(out.path()).unwrap().count(), 0);
    }
}

//! Common filesystem utilities.

use std::io;
use std::path::Path;

/// Ensure a file's parent directory exists.
pub fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Copy a file or a whole directory tree. Returns the number of files copied.
pub fn copy_tree(src: &Path, dest: &Path) -> io::Result<u64> {
    if src.is_dir() {
        std::fs::create_dir_all(dest)?;
        let mut count = 0;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            count += copy_tree(&entry.path(), &dest.join(entry.file_name()))?;
        }
        Ok(count)
    } else {
        ensure_parent_dir(dest)?;
        std::fs::copy(src, dest)?;
        Ok(1)
    }
}

/// Move a file or directory, falling back to copy+remove across filesystems.
pub fn move_path(src: &Path, dest: &Path) -> io::Result<()> {
    ensure_parent_dir(dest)?;
    match std::fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_tree(src, dest)?;
            remove_path(src)
        }
    }
}

/// Remove a file or directory tree if it exists.
pub fn remove_path(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else if path.exists() {
        std::fs::remove_file(path)
    } else {
        Ok(())
    }
}

/// Remove and recreate a directory, leaving it empty.
pub fn reset_dir(path: &Path) -> io::Result<()> {
    if path.exists() {
        std::fs::remove_dir_all(path)?;
    }
    std::fs::create_dir_all(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_tree_copies_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("a/b")).unwrap();
        std::fs::write(src.join("top.txt"), "1").unwrap();
        std::fs::write(src.join("a/b/deep.txt"), "2").unwrap();

        let dest = dir.path().join("dest");
        let copied = copy_tree(&src, &dest).unwrap();
        assert_eq!(copied, 2);
        assert_eq!(std::fs::read_to_string(dest.join("a/b/deep.txt")).unwrap(), "2");
    }

    #[test]
    fn move_path_replaces_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("file.txt");
        std::fs::write(&src, "x").unwrap();
        let dest = dir.path().join("sub/file.txt");

        move_path(&src, &dest).unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "x");
    }

    #[test]
    fn reset_dir_empties_and_recreates() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("work");
        std::fs::create_dir_all(target.join("junk")).unwrap();

        reset_dir(&target).unwrap();
        assert!(target.exists());
        assert_eq!(std::fs::read_dir(&target).unwrap().count(), 0);
    }
}

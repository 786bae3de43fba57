//! Pure path helpers exposed to scripts as the `path` module.

use std::path::Path;

/// Join two path components.
pub fn join(a: &str, b: &str) -> String {
    Path::new(a).join(b).to_string_lossy().to_string()
}

/// The final component of a path.
pub fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// The parent of a path.
pub fn dirname(path: &str) -> String {
    Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// The file name with its last extension removed.
pub fn stem(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// The last extension, without the dot.
pub fn extension(path: &str) -> String {
    Path::new(path)
        .extension()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_helpers() {
        assert_eq!(join("a/b", "c.txt"), "a/b/c.txt");
        assert_eq!(basename("a/b/c.txt"), "c.txt");
        assert_eq!(dirname("a/b/c.txt"), "a/b");
        assert_eq!(stem("a/b/tool.tar.gz"), "tool.tar");
        assert_eq!(extension("a/b/tool.tar.gz"), "gz");
        assert_eq!(extension("a/b/README"), "");
    }
}

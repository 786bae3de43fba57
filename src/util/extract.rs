//! Native archive extraction.
//!
//! Format is sniffed from the file name. Entries with unsafe paths (absolute,
//! or containing `..`) are rejected outright.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

/// Archive formats the engine can unpack without external tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    TarXz,
    TarBz2,
    TarZst,
    Tar,
    Zip,
}

impl ArchiveFormat {
    /// Sniff the format from a file name, `None` for non-archives.
    pub fn sniff(name: &str) -> Option<ArchiveFormat> {
        let lower = name.to_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if lower.ends_with(".tar.xz") || lower.ends_with(".txz") {
            Some(ArchiveFormat::TarXz)
        } else if lower.ends_with(".tar.bz2") || lower.ends_with(".tbz2") {
            Some(ArchiveFormat::TarBz2)
        } else if lower.ends_with(".tar.zst") {
            Some(ArchiveFormat::TarZst)
        } else if lower.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else if lower.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else {
            None
        }
    }
}

/// True iff the file name looks like an archive we can extract.
pub fn is_archive(name: &str) -> bool {
    ArchiveFormat::sniff(name).is_some()
}

/// Extract `archive` into `dest`, stripping `strip` leading path components
/// from each entry. Returns the number of files produced.
pub fn extract(archive: &Path, dest: &Path, strip: usize) -> Result<u64, String> {
    let name = archive
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let format = ArchiveFormat::sniff(&name)
        .ok_or_else(|| format!("unrecognised archive format: {name}"))?;

    let file =
        File::open(archive).map_err(|e| format!("cannot open {}: {e}", archive.display()))?;
    let reader = BufReader::new(file);

    match format {
        ArchiveFormat::TarGz => extract_tar(flate2::read::GzDecoder::new(reader), dest, strip),
        ArchiveFormat::TarXz => extract_tar(xz2::read::XzDecoder::new(reader), dest, strip),
        ArchiveFormat::TarBz2 => extract_tar(bzip2::read::BzDecoder::new(reader), dest, strip),
        ArchiveFormat::TarZst => {
            let decoder = zstd::stream::read::Decoder::new(reader)
                .map_err(|e| format!("zstd init error: {e}"))?;
            extract_tar(decoder, dest, strip)
        }
        ArchiveFormat::Tar => extract_tar(reader, dest, strip),
        ArchiveFormat::Zip => extract_zip(archive, dest, strip),
    }
}

/// Drop `strip` leading components; `None` when the entry is consumed whole.
fn strip_components(path: &Path, strip: usize) -> Option<PathBuf> {
    let stripped: PathBuf = path.components().skip(strip).collect();
    if stripped.as_os_str().is_empty() {
        None
    } else {
        Some(stripped)
    }
}

fn reject_unsafe(path: &Path) -> Result<(), String> {
    if path.is_absolute() || path.components().any(|c| c == Component::ParentDir) {
        return Err(format!("archive contains unsafe path: {}", path.display()));
    }
    Ok(())
}

fn extract_tar<R: Read>(reader: R, dest: &Path, strip: usize) -> Result<u64, String> {
    let mut archive = tar::Archive::new(reader);
    let mut files = 0u64;

    for entry in archive.entries().map_err(|e| format!("tar read error: {e}"))? {
        let mut entry = entry.map_err(|e| format!("tar entry error: {e}"))?;
        let path = entry
            .path()
            .map_err(|e| format!("tar path error: {e}"))?
            .into_owned();
        reject_unsafe(&path)?;

        let Some(stripped) = strip_components(&path, strip) else {
            continue;
        };
        let full_path = dest.join(&stripped);

        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("cannot create directory {}: {e}", parent.display()))?;
        }
        entry
            .unpack(&full_path)
            .map_err(|e| format!("unpack error for {}: {e}", path.display()))?;
        if full_path.is_file() {
            files += 1;
        }
    }

    Ok(files)
}

fn extract_zip(archive_path: &Path, dest: &Path, strip: usize) -> Result<u64, String> {
    let file = File::open(archive_path)
        .map_err(|e| format!("cannot open {}: {e}", archive_path.display()))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| format!("zip read error: {e}"))?;
    let mut files = 0u64;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| format!("zip entry error: {e}"))?;

        let Some(safe) = entry.enclosed_name() else {
            continue;
        };
        let Some(stripped) = strip_components(&safe, strip) else {
            continue;
        };
        let outpath = dest.join(&stripped);

        if entry.is_dir() {
            std::fs::create_dir_all(&outpath)
                .map_err(|e| format!("cannot create directory {}: {e}", outpath.display()))?;
        } else {
            if let Some(parent) = outpath.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("cannot create directory {}: {e}", parent.display()))?;
            }
            let mut outfile = File::create(&outpath)
                .map_err(|e| format!("cannot create {}: {e}", outpath.display()))?;
            std::io::copy(&mut entry, &mut outfile)
                .map_err(|e| format!("write error for {}: {e}", outpath.display()))?;
            files += 1;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Some(mode) = entry.unix_mode() {
                    std::fs::set_permissions(&outpath, std::fs::Permissions::from_mode(mode)).ok();
                }
            }
        }
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_tar_gz(dir: &Path, entries: &[(&str, &str)]) -> PathBuf {
        let archive_path = dir.join("fixture.tar.gz");
        let file = File::create(&archive_path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            // Write the path bytes directly: `set_path`/`append_data` reject
            // `..` components, but the extractor's own rejection is what
            // this fixture needs to exercise.
            let name_field = &mut header.as_old_mut().name;
            let bytes = name.as_bytes();
            name_field[..bytes.len()].copy_from_slice(bytes);
            header.set_cksum();
            builder.append(&header, content.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
        archive_path
    }

    #[test]
    fn sniffs_known_formats() {
        assert_eq!(ArchiveFormat::sniff("a.tar.gz"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::sniff("a.tgz"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::sniff("a.tar.zst"), Some(ArchiveFormat::TarZst));
        assert_eq!(ArchiveFormat::sniff("a.zip"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::sniff("a.txt"), None);
        assert!(!is_archive("README.md"));
    }

    #[test]
    fn extracts_and_counts_files() {
        let dir = tempfile::tempdir().unwrap();
        let archive = make_tar_gz(
            dir.path(),
            &[("pkg-1.0/bin/tool", "bin"), ("pkg-1.0/README", "docs")],
        );

        let dest = dir.path().join("out");
        let count = extract(&archive, &dest, 0).unwrap();
        assert_eq!(count, 2);
        assert_eq!(
            std::fs::read_to_string(dest.join("pkg-1.0/bin/tool")).unwrap(),
            "bin"
        );
    }

    #[test]
    fn strip_drops_leading_components() {
        let dir = tempfile::tempdir().unwrap();
        let archive = make_tar_gz(
            dir.path(),
            &[("pkg-1.0/bin/tool", "bin"), ("pkg-1.0/README", "docs")],
        );

        let dest = dir.path().join("out");
        let count = extract(&archive, &dest, 1).unwrap();
        assert_eq!(count, 2);
        assert!(dest.join("bin/tool").is_file());
        assert!(dest.join("README").is_file());
        assert!(!dest.join("pkg-1.0").exists());
    }

    #[test]
    fn zip_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("fixture.zip");
        let file = File::create(&archive_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let opts = zip::write::SimpleFileOptions::default();
        writer.start_file("data/a.txt", opts).unwrap();
        writer.write_all(b"alpha").unwrap();
        writer.finish().unwrap();

        let dest = dir.path().join("out");
        let count = extract(&archive_path, &dest, 0).unwrap();
        assert_eq!(count, 1);
        assert_eq!(std::fs::read_to_string(dest.join("data/a.txt")).unwrap(), "alpha");
    }

    #[test]
    fn rejects_parent_dir_entries() {
        let dir = tempfile::tempdir().unwrap();
        let archive = make_tar_gz(dir.path(), &[("../escape.txt", "bad")]);
        let dest = dir.path().join("out");
        let err = extract(&archive, &dest, 0).unwrap_err();
        assert!(err.contains("unsafe path"));
    }
}

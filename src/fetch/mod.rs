//! Fetch transports.
//!
//! The engine only speaks to transports through [`Transport`]; http and
//! local-file transports ship in-tree, anything else (git, s3) plugs in at
//! engine construction.

use std::io::{Read, Write};
use std::path::Path;

use crate::output;
use crate::util::fs::ensure_parent_dir;

/// A way to materialise one source URL as a local file.
pub trait Transport: Send + Sync {
    /// True iff this transport handles `source`.
    fn handles(&self, source: &str) -> bool;

    /// Download `source` into `dest`, overwriting it. Returns bytes written.
    fn fetch(&self, source: &str, dest: &Path) -> Result<u64, String>;
}

/// Streaming HTTP/HTTPS transport over ureq.
pub struct HttpTransport;

impl Transport for HttpTransport {
    fn handles(&self, source: &str) -> bool {
        source.starts_with("http://") || source.starts_with("https://")
    }

    fn fetch(&self, source: &str, dest: &Path) -> Result<u64, String> {
        ensure_parent_dir(dest).map_err(|e| format!("cannot create destination: {e}"))?;

        let filename = dest
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "download".to_string());
        let pb = output::download_spinner(&format!("downloading {filename}"));

        let response = ureq::get(source)
            .call()
            .map_err(|e| format!("download failed: {e}"))?;

        if let Some(len) = response
            .header("content-length")
            .and_then(|s| s.parse().ok())
        {
            output::upgrade_to_bytes(&pb, len);
        }

        let mut file =
            std::fs::File::create(dest).map_err(|e| format!("cannot create file: {e}"))?;
        let mut reader = response.into_reader();
        let mut buffer = [0u8; 8192];
        let mut total = 0u64;

        loop {
            let n = reader.read(&mut buffer).map_err(|e| format!("read error: {e}"))?;
            if n == 0 {
                break;
            }
            file.write_all(&buffer[..n])
                .map_err(|e| format!("write error: {e}"))?;
            total += n as u64;
            pb.set_position(total);
        }

        pb.finish_and_clear();
        Ok(total)
    }
}

/// Local-path transport: `file://` URLs and bare filesystem paths.
pub struct FileTransport;

impl FileTransport {
    fn strip(source: &str) -> &str {
        source.strip_prefix("file://").unwrap_or(source)
    }
}

impl Transport for FileTransport {
    fn handles(&self, source: &str) -> bool {
        source.starts_with("file://") || !source.contains("://")
    }

    fn fetch(&self, source: &str, dest: &Path) -> Result<u64, String> {
        let src = Path::new(Self::strip(source));
        if !src.is_file() {
            return Err(format!("no such file: {}", src.display()));
        }
        ensure_parent_dir(dest).map_err(|e| format!("cannot create destination: {e}"))?;
        std::fs::copy(src, dest).map_err(|e| format!("copy failed: {e}"))
    }
}

/// The default transport set, consulted in order.
pub fn default_transports() -> Vec<Box<dyn Transport>> {
    vec![Box::new(HttpTransport), Box::new(FileTransport)]
}

/// Dispatch `source` to the first transport that handles it.
pub fn fetch_with(
    transports: &[Box<dyn Transport>],
    source: &str,
    dest: &Path,
) -> Result<u64, String> {
    for transport in transports {
        if transport.handles(source) {
            return transport.fetch(source, dest);
        }
    }
    Err(format!("no transport handles '{source}'"))
}

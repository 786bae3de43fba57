//! Filesystem bindings: `copy`, `move`, `remove`, `extract`, `extract_all`.
//!
//! Relative paths resolve against the current phase's working directory.

use std::path::{Path, PathBuf};

use rhai::{EvalAltResult, Map};

use crate::bindings::context::{PhaseContext, with_context};
use crate::error::{Error, FilesystemError, ScriptError};
use crate::util::extract as archive;
use crate::util::fs as fsutil;

fn io_err(ctx: &PhaseContext, op: &'static str, path: PathBuf, e: std::io::Error) -> Error {
    FilesystemError::Io {
        identity: ctx.identity(),
        op,
        path,
        source: e,
    }
    .into()
}

/// When the destination is an existing directory, land inside it under the
/// source's basename.
fn target_in_dir(src: &Path, dst: &Path) -> PathBuf {
    if dst.is_dir() {
        match src.file_name() {
            Some(name) => dst.join(name),
            None => dst.to_path_buf(),
        }
    } else {
        dst.to_path_buf()
    }
}

/// `copy(src, dst)` - file or tree; copying a file into an existing
/// directory targets `<dir>/<basename>`.
pub fn copy(src: &str, dst: &str) -> Result<(), Box<EvalAltResult>> {
    with_context("copy", |ctx| {
        let src = ctx.resolve(src);
        if !src.exists() {
            return Err(FilesystemError::SourceMissing {
                identity: ctx.identity(),
                path: src,
            }
            .into());
        }
        let dst = target_in_dir(&src, &ctx.resolve(dst));
        fsutil::copy_tree(&src, &dst).map_err(|e| io_err(ctx, "copy", dst, e))?;
        Ok(())
    })
}

/// `move(src, dst)` - refuses to overwrite an existing destination.
pub fn move_path(src: &str, dst: &str) -> Result<(), Box<EvalAltResult>> {
    with_context("move", |ctx| {
        let src = ctx.resolve(src);
        if !src.exists() {
            return Err(FilesystemError::SourceMissing {
                identity: ctx.identity(),
                path: src,
            }
            .into());
        }
        let dst = target_in_dir(&src, &ctx.resolve(dst));
        if dst.exists() {
            return Err(FilesystemError::DestinationExists {
                identity: ctx.identity(),
                path: dst,
            }
            .into());
        }
        fsutil::move_path(&src, &dst).map_err(|e| io_err(ctx, "move", dst, e))?;
        Ok(())
    })
}

/// `remove(path)` - file or tree; missing paths are fine.
pub fn remove(path: &str) -> Result<(), Box<EvalAltResult>> {
    with_context("remove", |ctx| {
        let path = ctx.resolve(path);
        fsutil::remove_path(&path).map_err(|e| io_err(ctx, "remove", path, e))?;
        Ok(())
    })
}

fn strip_from(opts: &Map, ctx: &PhaseContext, binding: &'static str) -> Result<usize, Error> {
    let mut strip = 0usize;
    for (key, value) in opts.iter() {
        match key.as_str() {
            "strip" => {
                let v = value.as_int().map_err(|_| {
                    Error::from(ScriptError::BadArgument {
                        identity: ctx.identity(),
                        binding,
                        reason: "'strip' must be an integer".to_string(),
                    })
                })?;
                if v < 0 {
                    return Err(ScriptError::BadArgument {
                        identity: ctx.identity(),
                        binding,
                        reason: format!("'strip' must be >= 0, got {v}"),
                    }
                    .into());
                }
                strip = v as usize;
            }
            other => {
                return Err(ScriptError::UnknownOption {
                    identity: ctx.identity(),
                    binding,
                    key: other.to_string(),
                }
                .into());
            }
        }
    }
    Ok(strip)
}

fn extract_impl(ctx: &PhaseContext, archive_path: &str, dest: &str, strip: usize) -> Result<i64, Error> {
    let src = ctx.resolve(archive_path);
    if !src.is_file() {
        return Err(FilesystemError::SourceMissing {
            identity: ctx.identity(),
            path: src,
        }
        .into());
    }
    let dest = ctx.resolve(dest);
    std::fs::create_dir_all(&dest).map_err(|e| io_err(ctx, "mkdir", dest.clone(), e))?;
    let count = archive::extract(&src, &dest, strip).map_err(|reason| FilesystemError::Archive {
        identity: ctx.identity(),
        path: src,
        reason,
    })?;
    Ok(count as i64)
}

/// `extract(archive, dest)` - returns the number of files produced.
pub fn extract(archive_path: &str, dest: &str) -> Result<i64, Box<EvalAltResult>> {
    with_context("extract", |ctx| extract_impl(ctx, archive_path, dest, 0))
}

/// `extract(archive, dest, #{ strip: 1 })`.
pub fn extract_opts(archive_path: &str, dest: &str, opts: Map) -> Result<i64, Box<EvalAltResult>> {
    with_context("extract", |ctx| {
        let strip = strip_from(&opts, ctx, "extract")?;
        extract_impl(ctx, archive_path, dest, strip)
    })
}

fn extract_all_impl(ctx: &PhaseContext, src_dir: &str, dest_dir: &str, strip: usize) -> Result<i64, Error> {
    let src = ctx.resolve(src_dir);
    if !src.is_dir() {
        return Err(FilesystemError::NotADirectory {
            identity: ctx.identity(),
            path: src,
        }
        .into());
    }
    let dest = ctx.resolve(dest_dir);
    std::fs::create_dir_all(&dest).map_err(|e| io_err(ctx, "mkdir", dest.clone(), e))?;

    let mut total = 0i64;
    let entries = std::fs::read_dir(&src).map_err(|e| io_err(ctx, "read_dir", src.clone(), e))?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    for file in files {
        let name = file
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        if archive::is_archive(&name) {
            total += archive::extract(&file, &dest, strip).map_err(|reason| {
                FilesystemError::Archive {
                    identity: ctx.identity(),
                    path: file.clone(),
                    reason,
                }
            })? as i64;
        }
    }
    Ok(total)
}

/// `extract_all(src_dir, dest_dir)` - unpack every archive in a directory.
pub fn extract_all(src_dir: &str, dest_dir: &str) -> Result<i64, Box<EvalAltResult>> {
    with_context("extract_all", |ctx| extract_all_impl(ctx, src_dir, dest_dir, 0))
}

/// `extract_all(src_dir, dest_dir, #{ strip: 1 })`.
pub fn extract_all_opts(src_dir: &str, dest_dir: &str, opts: Map) -> Result<i64, Box<EvalAltResult>> {
    with_context("extract_all", |ctx| {
        let strip = strip_from(&opts, ctx, "extract_all")?;
        extract_all_impl(ctx, src_dir, dest_dir, strip)
    })
}

//! Fetch-phase bindings: `fetch`, `commit_fetch`, `verify_hash`.

use std::collections::HashSet;
use std::path::Path;

use rhai::{Array, Dynamic, EvalAltResult, Map};

use crate::bindings::context::{PhaseContext, with_context};
use crate::error::{Error, FetchError, FilesystemError, ScriptError};
use crate::output;
use crate::phase::Phase;
use crate::util::fs as fsutil;
use crate::util::hash;

/// One source to download: where from, and an optional expected digest.
struct SourceItem {
    url: String,
    sha256: Option<String>,
}

/// Pick a basename that does not collide with the names already produced by
/// this call. The numeric suffix goes before the last extension:
/// `file.txt` -> `file-2.txt`, `tool.tar.gz` -> `tool.tar-2.gz`,
/// extensionless files get a plain `-2`.
fn uniquify(base: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(base) {
        return base.to_string();
    }
    let (stem, ext) = match base.rfind('.') {
        Some(0) | None => (base, None),
        Some(dot) => (&base[..dot], Some(&base[dot + 1..])),
    };
    for counter in 2.. {
        let candidate = match ext {
            Some(ext) => format!("{stem}-{counter}.{ext}"),
            None => format!("{stem}-{counter}"),
        };
        if !taken.contains(&candidate) {
            return candidate;
        }
    }
    unreachable!("suffix counter is unbounded")
}

fn basename_of_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let base = trimmed.rsplit('/').next().unwrap_or(trimmed);
    if base.is_empty() {
        "download".to_string()
    } else {
        base.to_string()
    }
}

fn parse_item(value: &Dynamic, identity: &str) -> Result<SourceItem, Error> {
    if let Ok(url) = value.clone().into_immutable_string() {
        return Ok(SourceItem {
            url: url.to_string(),
            sha256: None,
        });
    }
    let map = value.read_lock::<Map>().ok_or_else(|| {
        Error::from(ScriptError::BadArgument {
            identity: identity.to_string(),
            binding: "fetch",
            reason: "each source must be a string or an object map".to_string(),
        })
    })?;
    for key in map.keys() {
        if !matches!(key.as_str(), "url" | "sha256") {
            return Err(ScriptError::UnknownOption {
                identity: identity.to_string(),
                binding: "fetch",
                key: key.to_string(),
            }
            .into());
        }
    }
    let url = map
        .get("url")
        .and_then(|v| v.clone().into_immutable_string().ok())
        .ok_or_else(|| {
            Error::from(ScriptError::BadArgument {
                identity: identity.to_string(),
                binding: "fetch",
                reason: "source map requires a 'url' string".to_string(),
            })
        })?;
    let sha256 = map
        .get("sha256")
        .and_then(|v| v.clone().into_immutable_string().ok())
        .map(|s| s.to_string());
    Ok(SourceItem {
        url: url.to_string(),
        sha256,
    })
}

/// Download one item to `dest_dir/<unique basename>`; returns the basename.
fn fetch_one(
    ctx: &PhaseContext,
    item: &SourceItem,
    dest_dir: &Path,
    taken: &mut HashSet<String>,
) -> Result<String, Error> {
    let identity = ctx.identity();
    let name = uniquify(&basename_of_url(&item.url), taken);
    let target = dest_dir.join(&name);
    let part = dest_dir.join(format!("{name}.part"));

    crate::fetch::fetch_with(ctx.engine.transports(), &item.url, &part).map_err(|reason| {
        FetchError::Transport {
            identity: identity.clone(),
            url: item.url.clone(),
            reason,
        }
    })?;

    if let Some(expected) = &item.sha256 {
        let actual = hash::sha256_file(&part).map_err(|e| FilesystemError::Io {
            identity: identity.clone(),
            op: "hash",
            path: part.clone(),
            source: e,
        })?;
        if actual != expected.to_lowercase() {
            let _ = fsutil::remove_path(&part);
            return Err(FetchError::HashMismatch {
                identity,
                file: name,
                expected: expected.to_lowercase(),
                actual,
            }
            .into());
        }
    }

    if target.exists() {
        // A file from an earlier run may already sit at the target; keep it
        // when identical, reject when it differs.
        let same = files_equal(&part, &target, &identity)?;
        let _ = fsutil::remove_path(&part);
        if !same {
            return Err(FetchError::DestinationConflict {
                identity,
                dest: target.display().to_string(),
            }
            .into());
        }
        output::detail(&format!("{name} already fetched"));
    } else {
        std::fs::rename(&part, &target).map_err(|e| FilesystemError::Io {
            identity: identity.clone(),
            op: "rename",
            path: target.clone(),
            source: e,
        })?;
    }

    taken.insert(name.clone());
    Ok(name)
}

fn files_equal(a: &Path, b: &Path, identity: &str) -> Result<bool, Error> {
    let digest = |p: &Path| {
        hash::sha256_file(p).map_err(|e| FilesystemError::Io {
            identity: identity.to_string(),
            op: "hash",
            path: p.to_path_buf(),
            source: e,
        })
    };
    Ok(digest(a)? == digest(b)?)
}

fn fetch_items(items: Vec<SourceItem>, opts: Option<&Map>) -> Result<Vec<String>, Box<EvalAltResult>> {
    with_context("fetch", |ctx| {
        ctx.require_phase("fetch", &[Phase::Fetch])?;
        let identity = ctx.identity();

        let mut dest = ".".to_string();
        if let Some(opts) = opts {
            for (key, value) in opts.iter() {
                match key.as_str() {
                    "dest" => {
                        dest = value
                            .clone()
                            .into_immutable_string()
                            .map_err(|_| {
                                Error::from(ScriptError::BadArgument {
                                    identity: identity.clone(),
                                    binding: "fetch",
                                    reason: "'dest' must be a string".to_string(),
                                })
                            })?
                            .to_string();
                    }
                    other => {
                        return Err(ScriptError::UnknownOption {
                            identity: identity.clone(),
                            binding: "fetch",
                            key: other.to_string(),
                        }
                        .into());
                    }
                }
            }
        }

        let dest_dir = ctx.resolve(&dest);
        std::fs::create_dir_all(&dest_dir).map_err(|e| FilesystemError::Io {
            identity: identity.clone(),
            op: "mkdir",
            path: dest_dir.clone(),
            source: e,
        })?;

        let mut taken = HashSet::new();
        let mut names = Vec::with_capacity(items.len());
        for item in &items {
            names.push(fetch_one(ctx, item, &dest_dir, &mut taken)?);
        }
        Ok(names)
    })
}

/// Engine-side declarative fetch: a recipe's top-level `sources` list,
/// downloaded into the phase's working directory with the same renaming and
/// verification rules as the `fetch` binding.
pub(crate) fn fetch_sources(
    sources: &[(String, Option<String>)],
) -> Result<Vec<String>, Box<EvalAltResult>> {
    let items = sources
        .iter()
        .map(|(url, sha256)| SourceItem {
            url: url.clone(),
            sha256: sha256.clone(),
        })
        .collect();
    fetch_items(items, None)
}

/// `fetch("https://.../a.tar.gz")` - download one source, return its basename.
pub fn fetch_str(source: &str) -> Result<String, Box<EvalAltResult>> {
    let item = SourceItem {
        url: source.to_string(),
        sha256: None,
    };
    Ok(fetch_items(vec![item], None)?.remove(0))
}

/// `fetch(source, #{ dest: "D", sha256: "..." })`.
pub fn fetch_str_opts(source: &str, opts: Map) -> Result<String, Box<EvalAltResult>> {
    let sha256 = opts
        .get("sha256")
        .and_then(|v| v.clone().into_immutable_string().ok())
        .map(|s| s.to_string());
    let mut rest = opts;
    rest.remove("sha256");
    let item = SourceItem {
        url: source.to_string(),
        sha256,
    };
    Ok(fetch_items(vec![item], Some(&rest))?.remove(0))
}

/// `fetch([src, src, ...])` - basenames are returned in input order.
pub fn fetch_array(sources: Array) -> Result<Array, Box<EvalAltResult>> {
    fetch_array_opts(sources, Map::new())
}

/// `fetch([...], #{ dest: "D" })`.
pub fn fetch_array_opts(sources: Array, opts: Map) -> Result<Array, Box<EvalAltResult>> {
    let identity = with_context("fetch", |ctx| Ok(ctx.identity()))?;
    let items = sources
        .iter()
        .map(|v| parse_item(v, &identity).map_err(Error::into_eval))
        .collect::<Result<Vec<_>, _>>()?;
    let names = fetch_items(items, Some(&opts))?;
    Ok(names.into_iter().map(Dynamic::from).collect())
}

/// Move one staged file from tmp_dir to fetch_dir, verifying first.
fn commit_one(ctx: &PhaseContext, file: &str, sha256: Option<&str>) -> Result<(), Error> {
    let identity = ctx.identity();
    let staging = ctx.staging("commit_fetch")?;
    let src = staging.tmp.join(file);
    if !src.is_file() {
        return Err(FetchError::MissingStaged {
            identity,
            file: file.to_string(),
        }
        .into());
    }
    if let Some(expected) = sha256 {
        let actual = hash::sha256_file(&src).map_err(|e| FilesystemError::Io {
            identity: identity.clone(),
            op: "hash",
            path: src.clone(),
            source: e,
        })?;
        if actual != expected.to_lowercase() {
            return Err(FetchError::HashMismatch {
                identity,
                file: file.to_string(),
                expected: expected.to_lowercase(),
                actual,
            }
            .into());
        }
    }
    let dest = staging.fetch.join(file);
    fsutil::ensure_parent_dir(&dest).map_err(|e| FilesystemError::Io {
        identity: identity.clone(),
        op: "mkdir",
        path: dest.clone(),
        source: e,
    })?;
    std::fs::rename(&src, &dest).map_err(|e| FilesystemError::Io {
        identity,
        op: "rename",
        path: dest,
        source: e,
    })?;
    Ok(())
}

fn commit_value(ctx: &PhaseContext, value: &Dynamic) -> Result<(), Error> {
    if let Ok(name) = value.clone().into_immutable_string() {
        return commit_one(ctx, &name, None);
    }
    let identity = ctx.identity();
    let map = value.read_lock::<Map>().ok_or_else(|| {
        Error::from(ScriptError::BadArgument {
            identity: identity.clone(),
            binding: "commit_fetch",
            reason: "each entry must be a file name or an object map".to_string(),
        })
    })?;
    let file = map
        .get("file")
        .and_then(|v| v.clone().into_immutable_string().ok())
        .ok_or_else(|| {
            Error::from(ScriptError::BadArgument {
                identity: identity.clone(),
                binding: "commit_fetch",
                reason: "entry map requires a 'file' string".to_string(),
            })
        })?;
    let sha256 = map
        .get("sha256")
        .and_then(|v| v.clone().into_immutable_string().ok());
    commit_one(ctx, &file, sha256.as_deref())
}

/// `commit_fetch("src.tar.gz")` - promote a staged download into fetch_dir.
pub fn commit_fetch_str(file: &str) -> Result<(), Box<EvalAltResult>> {
    with_context("commit_fetch", |ctx| {
        ctx.require_phase("commit_fetch", &[Phase::Fetch])?;
        commit_one(ctx, file, None)
    })
}

/// `commit_fetch([#{ file: "a", sha256: "..." }, "b"])`.
pub fn commit_fetch_array(files: Array) -> Result<(), Box<EvalAltResult>> {
    with_context("commit_fetch", |ctx| {
        ctx.require_phase("commit_fetch", &[Phase::Fetch])?;
        for value in &files {
            commit_value(ctx, value)?;
        }
        Ok(())
    })
}

/// `verify_hash(path, sha256)` - true iff the file digest matches.
pub fn verify_hash(path: &str, sha256: &str) -> Result<bool, Box<EvalAltResult>> {
    with_context("verify_hash", |ctx| {
        let resolved = ctx.resolve(path);
        hash::sha256_matches(&resolved, sha256).map_err(|e| {
            FilesystemError::Io {
                identity: ctx.identity(),
                op: "hash",
                path: resolved,
                source: e,
            }
            .into()
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taken(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn uniquify_inserts_suffix_before_last_extension() {
        assert_eq!(uniquify("file.txt", &taken(&[])), "file.txt");
        assert_eq!(uniquify("file.txt", &taken(&["file.txt"])), "file-2.txt");
        assert_eq!(
            uniquify("file.txt", &taken(&["file.txt", "file-2.txt"])),
            "file-3.txt"
        );
        assert_eq!(
            uniquify("tool.tar.gz", &taken(&["tool.tar.gz"])),
            "tool.tar-2.gz"
        );
    }

    #[test]
    fn uniquify_handles_extensionless_and_dotfiles() {
        assert_eq!(uniquify("file", &taken(&["file"])), "file-2");
        assert_eq!(uniquify("file", &taken(&["file", "file-2"])), "file-3");
        // A leading dot is not an extension separator.
        assert_eq!(uniquify(".profile", &taken(&[".profile"])), ".profile-2");
    }

    #[test]
    fn url_basenames() {
        assert_eq!(basename_of_url("https://x.test/a/b/tool.tar.gz"), "tool.tar.gz");
        assert_eq!(basename_of_url("https://x.test/dir/"), "dir");
        assert_eq!(basename_of_url("lone"), "lone");
    }
}

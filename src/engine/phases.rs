//! Phase bodies for the worker loop.
//!
//! Before any body runs, the worker waits for every dependency edge whose
//! `needed_by` is at or before the phase. Script phase functions execute
//! with the phase context installed; recipes without a function get the
//! declarative default where one exists (sources download, archive
//! extraction, stage-to-install copy).

use std::path::PathBuf;
use std::sync::Arc;

use rhai::{Array, Dynamic, Map, module_resolvers::FileModuleResolver};

use super::Engine;
use crate::bindings::context::{ContextGuard, PhaseContext, StagingDirs};
use crate::error::{DependencyAccessError, Error, FilesystemError, Result, ScriptError};
use crate::output;
use crate::phase::Phase;
use crate::recipe::{Recipe, RecipeType};
use crate::util::extract as archive;
use crate::util::fs as fsutil;

/// How one phase body left the pipeline.
pub enum PhaseOutcome {
    Advanced,
    /// The check phase found the recipe already installed; everything up to
    /// completion is skipped.
    Skipped,
}

pub fn run_phase(engine: &Arc<Engine>, recipe: &Arc<Recipe>, phase: Phase) -> Result<PhaseOutcome> {
    output::phase(&recipe.identity(), phase.name());
    match phase {
        Phase::None => unreachable!("the none sentinel has no body"),
        Phase::RecipeFetch => {
            super::fetch_recipe::run(engine, recipe)?;
            Ok(PhaseOutcome::Advanced)
        }
        Phase::Check => {
            wait_dependencies(engine, recipe, phase)?;
            check(engine, recipe)
        }
        Phase::Fetch => {
            wait_dependencies(engine, recipe, phase)?;
            fetch(engine, recipe)?;
            Ok(PhaseOutcome::Advanced)
        }
        Phase::Stage => {
            wait_dependencies(engine, recipe, phase)?;
            stage(engine, recipe)?;
            Ok(PhaseOutcome::Advanced)
        }
        Phase::Build => {
            wait_dependencies(engine, recipe, phase)?;
            call_script_fn(engine, recipe, Phase::Build, "build")?;
            Ok(PhaseOutcome::Advanced)
        }
        Phase::Install => {
            wait_dependencies(engine, recipe, phase)?;
            install(engine, recipe)?;
            Ok(PhaseOutcome::Advanced)
        }
        Phase::Deploy => {
            wait_dependencies(engine, recipe, phase)?;
            call_script_fn(engine, recipe, Phase::Deploy, "deploy")?;
            Ok(PhaseOutcome::Advanced)
        }
        Phase::Completion => {
            completion(engine, recipe)?;
            Ok(PhaseOutcome::Advanced)
        }
    }
}

/// Drive and await every dependency the phase may observe: each edge with
/// `needed_by <= phase` is raised and awaited at its own `needed_by`. A
/// dependency can legitimately be reached-but-unfinished here; `asset()`
/// and `product()` surface that as a distinct not-completed error.
fn wait_dependencies(engine: &Arc<Engine>, recipe: &Arc<Recipe>, phase: Phase) -> Result<()> {
    let owner = recipe.identity();
    let targets: Vec<(crate::key::RecipeKey, Phase)> = {
        let state = recipe.state.lock().expect("recipe state poisoned");
        state
            .dependencies
            .iter()
            .filter(|d| d.needed_by <= phase)
            .map(|d| (d.key.clone(), d.needed_by))
            .chain(
                state
                    .product_dependencies
                    .iter()
                    .filter(|p| p.needed_by <= phase)
                    .map(|p| (p.provider.clone(), p.needed_by)),
            )
            .collect()
    };

    for (key, needed_by) in targets {
        let Some(child) = engine.find_exact(&key.canonical()) else {
            return Err(DependencyAccessError::NotDeclared {
                owner,
                query: key.canonical(),
            }
            .into());
        };
        engine.ensure_recipe_at_phase(&child, needed_by, Vec::new());
        if child.coord.wait_for(needed_by).is_err() {
            return Err(DependencyAccessError::DependencyFailed {
                owner,
                identity: child.identity(),
            }
            .into());
        }
    }
    Ok(())
}

/// The phase context everything in a phase body sees.
fn phase_context(engine: &Arc<Engine>, recipe: &Arc<Recipe>, phase: Phase) -> PhaseContext {
    let state = recipe.state.lock().expect("recipe state poisoned");
    let dirs = state.lock.as_ref().map(|lock| StagingDirs {
        fetch: lock.fetch_dir(),
        tmp: lock.tmp_dir(),
        stage: lock.stage_dir(),
        install: lock.install_dir(),
    });
    let run_dir = match (&dirs, phase) {
        (Some(d), Phase::Fetch) => d.fetch.clone(),
        (Some(d), _) => d.stage.clone(),
        (None, _) => state.script_dir.clone(),
    };
    PhaseContext {
        engine: Arc::clone(engine),
        recipe: Arc::clone(recipe),
        phase,
        run_dir,
        dirs,
    }
}

fn has_fn(recipe: &Arc<Recipe>, name: &str) -> bool {
    let state = recipe.state.lock().expect("recipe state poisoned");
    state
        .script
        .as_ref()
        .is_some_and(|s| s.ast.iter_functions().any(|f| f.name == name))
}

/// Call a script phase function if the recipe defines it. The script state
/// moves out of the record for the duration of the call; bindings find the
/// engine and recipe through the installed context instead.
fn call_script_fn(
    engine: &Arc<Engine>,
    recipe: &Arc<Recipe>,
    phase: Phase,
    name: &str,
) -> Result<Option<Dynamic>> {
    if !has_fn(recipe, name) {
        return Ok(None);
    }
    let identity = recipe.identity();
    let (mut script, script_dir) = {
        let mut state = recipe.state.lock().expect("recipe state poisoned");
        let script = state.script.take().ok_or_else(|| ScriptError::Eval {
            identity: identity.clone(),
            phase,
            reason: "script state missing".to_string(),
        })?;
        (script, state.script_dir.clone())
    };

    let mut rh = crate::bindings::new_engine();
    let mut resolver = FileModuleResolver::new();
    resolver.set_base_path(&script_dir);
    rh.set_module_resolver(resolver);

    let _guard = ContextGuard::install(phase_context(engine, recipe, phase));
    let outcome = rh.call_fn::<Dynamic>(&mut script.scope, &script.ast, name, ());

    let mut state = recipe.state.lock().expect("recipe state poisoned");
    state.script = Some(script);
    drop(state);

    match outcome {
        Ok(value) => Ok(Some(value)),
        Err(e) => Err(ScriptError::Eval {
            identity,
            phase,
            reason: e.to_string(),
        }
        .into()),
    }
}

/// Check phase: a promoted cache entry short-circuits; otherwise an optional
/// `check()` predicate decides whether the work phases can be skipped.
fn check(engine: &Arc<Engine>, recipe: &Arc<Recipe>) -> Result<PhaseOutcome> {
    let identity = recipe.identity();
    let already_installed = {
        let state = recipe.state.lock().expect("recipe state poisoned");
        state.rtype == Some(RecipeType::CacheManaged)
            && state
                .lock
                .as_ref()
                .is_some_and(|lock| lock.installed_result().is_some())
    };
    if already_installed {
        output::skip(&format!("{identity} already installed, skipping"));
        recipe.state.lock().expect("recipe state poisoned").skip_work = true;
        return Ok(PhaseOutcome::Skipped);
    }

    if let Some(value) = call_script_fn(engine, recipe, Phase::Check, "check")? {
        let installed = value.as_bool().map_err(|got| ScriptError::BadArgument {
            identity: identity.clone(),
            binding: "check",
            reason: format!("check() must return a boolean, got {got}"),
        })?;
        if installed {
            output::skip(&format!("{identity} reports installed, skipping"));
            recipe.state.lock().expect("recipe state poisoned").skip_work = true;
            return Ok(PhaseOutcome::Skipped);
        }
    }
    Ok(PhaseOutcome::Advanced)
}

/// Fetch phase: a `fetch()` function wins; otherwise the declarative
/// `sources` list downloads into fetch_dir.
fn fetch(engine: &Arc<Engine>, recipe: &Arc<Recipe>) -> Result<()> {
    if recipe.rtype() == RecipeType::BundleOnly {
        return Ok(());
    }
    if call_script_fn(engine, recipe, Phase::Fetch, "fetch")?.is_some() {
        return Ok(());
    }

    let sources = declared_sources(recipe)?;
    if sources.is_empty() {
        return Ok(());
    }
    let _guard = ContextGuard::install(phase_context(engine, recipe, Phase::Fetch));
    crate::bindings::fetch::fetch_sources(&sources).map_err(|e| {
        Error::from(ScriptError::Eval {
            identity: recipe.identity(),
            phase: Phase::Fetch,
            reason: e.to_string(),
        })
    })?;
    Ok(())
}

/// The top-level `sources` declaration as (url, sha256) pairs.
fn declared_sources(recipe: &Arc<Recipe>) -> Result<Vec<(String, Option<String>)>> {
    let identity = recipe.identity();
    let list = {
        let state = recipe.state.lock().expect("recipe state poisoned");
        state
            .script
            .as_ref()
            .and_then(|s| s.scope.get_value::<Array>("sources"))
    };
    let Some(list) = list else {
        return Ok(Vec::new());
    };

    let bad = |reason: String| ScriptError::BadArgument {
        identity: identity.clone(),
        binding: "sources",
        reason,
    };
    let mut sources = Vec::with_capacity(list.len());
    for entry in &list {
        if let Ok(url) = entry.clone().into_immutable_string() {
            sources.push((url.to_string(), None));
            continue;
        }
        let map = entry
            .read_lock::<Map>()
            .ok_or_else(|| bad("each source must be a string or an object map".to_string()))?;
        for key in map.keys() {
            if !matches!(key.as_str(), "url" | "sha256") {
                return Err(ScriptError::UnknownOption {
                    identity: identity.clone(),
                    binding: "sources",
                    key: key.to_string(),
                }
                .into());
            }
        }
        let url = map
            .get("url")
            .and_then(|v| v.clone().into_immutable_string().ok())
            .ok_or_else(|| bad("source map requires a 'url' string".to_string()))?;
        let sha256 = map
            .get("sha256")
            .and_then(|v| v.clone().into_immutable_string().ok())
            .map(|s| s.to_string());
        sources.push((url.to_string(), sha256));
    }
    Ok(sources)
}

/// Stage phase: a `stage()` function wins; otherwise every archive in
/// fetch_dir unpacks into stage_dir and plain files copy across.
fn stage(engine: &Arc<Engine>, recipe: &Arc<Recipe>) -> Result<()> {
    if recipe.rtype() == RecipeType::BundleOnly {
        return Ok(());
    }
    if call_script_fn(engine, recipe, Phase::Stage, "stage")?.is_some() {
        return Ok(());
    }

    let identity = recipe.identity();
    let (fetch_dir, stage_dir) = {
        let state = recipe.state.lock().expect("recipe state poisoned");
        match state.lock.as_ref() {
            Some(lock) => (lock.fetch_dir(), lock.stage_dir()),
            None => return Ok(()),
        }
    };

    let mut entries: Vec<PathBuf> = std::fs::read_dir(&fetch_dir)
        .map_err(|e| FilesystemError::Io {
            identity: identity.clone(),
            op: "read_dir",
            path: fetch_dir.clone(),
            source: e,
        })?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    entries.sort();

    for file in entries {
        let name = file
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        if archive::is_archive(&name) {
            archive::extract(&file, &stage_dir, 0).map_err(|reason| FilesystemError::Archive {
                identity: identity.clone(),
                path: file.clone(),
                reason,
            })?;
        } else {
            fsutil::copy_tree(&file, &stage_dir.join(&name)).map_err(|e| FilesystemError::Io {
                identity: identity.clone(),
                op: "copy",
                path: file.clone(),
                source: e,
            })?;
        }
    }
    Ok(())
}

/// Install phase: rewrite install_dir (dropping any stale promotion marker
/// first), then compute the result hash.
fn install(engine: &Arc<Engine>, recipe: &Arc<Recipe>) -> Result<()> {
    let identity = recipe.identity();
    if recipe.rtype() != RecipeType::BundleOnly {
        let (stage_dir, install_dir) = {
            let state = recipe.state.lock().expect("recipe state poisoned");
            let lock = state.lock.as_ref().expect("workspace recipes hold a lock");
            lock.clear_marker()?;
            (lock.stage_dir(), lock.install_dir())
        };
        fsutil::reset_dir(&install_dir).map_err(|e| FilesystemError::Io {
            identity: identity.clone(),
            op: "reset",
            path: install_dir.clone(),
            source: e,
        })?;

        if call_script_fn(engine, recipe, Phase::Install, "install")?.is_none() {
            fsutil::copy_tree(&stage_dir, &install_dir).map_err(|e| FilesystemError::Io {
                identity: identity.clone(),
                op: "copy",
                path: stage_dir,
                source: e,
            })?;
        }
    }

    let hash = compute_result_hash(engine, recipe)?;
    recipe.state.lock().expect("recipe state poisoned").result_hash = Some(hash);
    Ok(())
}

/// result_hash = digest of the canonical identity plus every dependency's
/// identity and result hash, in sorted order. Stable across runs with an
/// unchanged graph.
fn compute_result_hash(engine: &Arc<Engine>, recipe: &Arc<Recipe>) -> Result<String> {
    let owner = recipe.identity();
    let mut targets: Vec<_> = {
        let state = recipe.state.lock().expect("recipe state poisoned");
        state
            .dependencies
            .iter()
            .map(|d| d.key.clone())
            .chain(state.product_dependencies.iter().map(|p| p.provider.clone()))
            .collect()
    };
    targets.sort();
    targets.dedup();

    let mut hasher = blake3::Hasher::new();
    hasher.update(owner.as_bytes());
    for key in targets {
        let Some(child) = engine.find_exact(&key.canonical()) else {
            continue;
        };
        // Every effective dependency finishes before its hash folds in.
        engine.ensure_recipe_at_phase(&child, Phase::Completion, Vec::new());
        if child.coord.wait_for(Phase::Completion).is_err() {
            return Err(DependencyAccessError::DependencyFailed {
                owner,
                identity: child.identity(),
            }
            .into());
        }
        let dep_hash = {
            let state = child.state.lock().expect("recipe state poisoned");
            state.result_hash.clone().unwrap_or_default()
        };
        hasher.update(b"\0");
        hasher.update(key.canonical().as_bytes());
        hasher.update(b"=");
        hasher.update(dep_hash.as_bytes());
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Completion: promote (or purge) the workspace, publish the asset path and
/// release the entry lock.
fn completion(engine: &Arc<Engine>, recipe: &Arc<Recipe>) -> Result<()> {
    let identity = recipe.identity();

    let needs_hash = {
        let state = recipe.state.lock().expect("recipe state poisoned");
        state.result_hash.is_none()
    };
    if needs_hash {
        // The install phase was skipped; the hash still finalises the entry.
        let hash = compute_result_hash(engine, recipe)?;
        recipe.state.lock().expect("recipe state poisoned").result_hash = Some(hash);
    }

    let mut state = recipe.state.lock().expect("recipe state poisoned");
    match state.rtype.unwrap_or(RecipeType::CacheManaged) {
        RecipeType::CacheManaged => {
            let result_hash = state.result_hash.clone().unwrap_or_default();
            if let Some(lock) = state.lock.as_mut() {
                lock.promote(&result_hash)?;
                let installed = lock.install_dir();
                state.asset_path = Some(installed);
            }
            state.lock = None;
        }
        RecipeType::UserManaged | RecipeType::BundleOnly => {
            // Ephemeral workspaces purge on lock release; bundles hold none.
            state.lock = None;
        }
    }
    drop(state);

    output::success(&format!("{identity} complete"));
    Ok(())
}

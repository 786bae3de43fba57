//! Phase context for script bindings.
//!
//! Every binding requires an installed phase context: which engine and
//! recipe are running, which phase, the phase's working directory and the
//! staging dirs of the held cache lock. The context lives in a thread local
//! for the duration of one phase body, installed by an RAII guard on the
//! worker thread.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::engine::Engine;
use crate::error::{Error, ScriptError};
use crate::phase::Phase;
use crate::recipe::Recipe;

/// Staging directories of the recipe's cache entry, copied out of the lock.
#[derive(Debug, Clone)]
pub struct StagingDirs {
    pub fetch: PathBuf,
    pub tmp: PathBuf,
    pub stage: PathBuf,
    pub install: PathBuf,
}

/// Everything a binding may observe about the running phase.
#[derive(Clone)]
pub struct PhaseContext {
    pub engine: Arc<Engine>,
    pub recipe: Arc<Recipe>,
    pub phase: Phase,
    /// Relative paths in bindings resolve against this: fetch_dir during
    /// fetch, stage_dir thereafter.
    pub run_dir: PathBuf,
    /// `None` when the recipe holds no cache entry (bundle-only).
    pub dirs: Option<StagingDirs>,
}

impl PhaseContext {
    pub fn identity(&self) -> String {
        self.recipe.identity()
    }

    /// Resolve a script-supplied path against the phase's working directory.
    /// Absolute paths pass through unchanged.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.run_dir.join(p)
        }
    }

    /// The staging dirs, or a structured error for lock-requiring bindings.
    pub fn staging(&self, binding: &'static str) -> Result<&StagingDirs, Error> {
        self.dirs.as_ref().ok_or_else(|| {
            ScriptError::NoCacheLock {
                identity: self.identity(),
                binding,
            }
            .into()
        })
    }

    /// Enforce that the current phase is one of `allowed`.
    pub fn require_phase(&self, binding: &'static str, allowed: &[Phase]) -> Result<(), Error> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(ScriptError::WrongPhase {
                identity: self.identity(),
                binding,
                phase: self.phase,
            }
            .into())
        }
    }
}

thread_local! {
    static CONTEXT: RefCell<Option<PhaseContext>> = const { RefCell::new(None) };
}

/// Installs a phase context for the duration of one phase body.
pub struct ContextGuard(());

impl ContextGuard {
    pub fn install(ctx: PhaseContext) -> ContextGuard {
        CONTEXT.with(|c| *c.borrow_mut() = Some(ctx));
        ContextGuard(())
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CONTEXT.with(|c| *c.borrow_mut() = None);
    }
}

/// Run a binding body with the current phase context.
///
/// Raises a structured error when no phase is executing on this thread, so
/// bindings called from top-level script code fail loudly instead of acting
/// on half-initialised state.
pub fn with_context<F, R>(binding: &'static str, f: F) -> Result<R, Box<rhai::EvalAltResult>>
where
    F: FnOnce(&PhaseContext) -> Result<R, Error>,
{
    CONTEXT.with(|c| {
        let ctx = c.borrow();
        let ctx = ctx.as_ref().ok_or_else(|| {
            Error::from(ScriptError::NoPhaseContext { binding }).into_eval()
        })?;
        f(ctx).map_err(Error::into_eval)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindings_fail_without_context() {
        let err = with_context("fetch", |_| Ok(())).unwrap_err();
        assert!(err.to_string().contains("outside a recipe phase"));
    }
}

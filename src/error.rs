//! Engine error types.
//!
//! Every failure surfaced by the engine names the offending recipe identity
//! and, where it applies, the phase it happened in. Script bindings convert
//! these into Rhai runtime errors at the boundary; worker threads record them
//! on the recipe and the engine reports a stable composite at join time.

use std::path::PathBuf;

use thiserror::Error;

use crate::phase::Phase;

/// Graph construction and settlement failures.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("reference '{query}' from {owner} is ambiguous: matches {}", matches.join(", "))]
    AmbiguousReference {
        owner: String,
        query: String,
        matches: Vec<String>,
    },

    #[error("reference '{query}' from {owner} matches no recipe in the graph")]
    MissingReference { owner: String, query: String },

    #[error("weak dependency settlement did not converge; unresolved: {}", unresolved.join(", "))]
    SettlementStalled { unresolved: Vec<String> },

    #[error("recipe {identity} already registered with source '{existing}', conflicting source '{requested}'")]
    ConflictingSpec {
        identity: String,
        existing: String,
        requested: String,
    },

    #[error("alias '{alias}' already bound to {existing}, cannot rebind to {requested}")]
    AliasConflict {
        alias: String,
        existing: String,
        requested: String,
    },
}

/// Illegal observations of dependencies from recipe scripts.
#[derive(Error, Debug)]
pub enum DependencyAccessError {
    #[error("{owner}: '{query}' is not a declared dependency")]
    NotDeclared { owner: String, query: String },

    #[error("{owner}: dependency '{query}' needed_by {needed_by} but accessed during {current}")]
    PhaseOrder {
        owner: String,
        query: String,
        needed_by: Phase,
        current: Phase,
    },

    #[error("{owner}: dependency {identity} is user-managed and has no installed path")]
    UserManaged { owner: String, identity: String },

    #[error("{owner}: dependency {identity} has not completed")]
    NotCompleted { owner: String, identity: String },

    #[error("{owner}: dependency {identity} failed")]
    DependencyFailed { owner: String, identity: String },

    #[error("{owner}: product '{product}' constrained to provider {expected} but declared by {actual}")]
    ProviderMismatch {
        owner: String,
        product: String,
        expected: String,
        actual: String,
    },

    #[error("{owner}: no provider declares product '{product}'")]
    MissingProduct { owner: String, product: String },
}

/// Fetch-phase failures.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("{identity}: transport failed for '{url}': {reason}")]
    Transport {
        identity: String,
        url: String,
        reason: String,
    },

    #[error("{identity}: sha256 mismatch for '{file}'\n  expected: {expected}\n  got:      {actual}")]
    HashMismatch {
        identity: String,
        file: String,
        expected: String,
        actual: String,
    },

    #[error("{identity}: destination '{dest}' already holds a different file")]
    DestinationConflict { identity: String, dest: String },

    #[error("{identity}: no source named '{file}' in the staging area")]
    MissingStaged { identity: String, file: String },
}

/// Shell step failures from `run()`.
#[derive(Error, Debug)]
pub enum ShellError {
    #[error("{identity} ({phase}): command exited with exit code {code}\n  command: {command}")]
    NonZeroExit {
        identity: String,
        phase: Phase,
        command: String,
        code: i32,
    },

    #[error("{identity} ({phase}): command terminated by signal\n  command: {command}")]
    Signalled {
        identity: String,
        phase: Phase,
        command: String,
    },

    #[error("{identity} ({phase}): command failed to start: {reason}\n  command: {command}")]
    Spawn {
        identity: String,
        phase: Phase,
        command: String,
        reason: String,
    },
}

/// Filesystem binding failures.
#[derive(Error, Debug)]
pub enum FilesystemError {
    #[error("{identity}: source does not exist: {path}")]
    SourceMissing { identity: String, path: PathBuf },

    #[error("{identity}: refusing to overwrite existing destination: {path}")]
    DestinationExists { identity: String, path: PathBuf },

    #[error("{identity}: expected a directory: {path}")]
    NotADirectory { identity: String, path: PathBuf },

    #[error("{identity}: {op} failed for {path}: {source}")]
    Io {
        identity: String,
        op: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{identity}: cannot extract '{path}': {reason}")]
    Archive {
        identity: String,
        path: PathBuf,
        reason: String,
    },
}

/// Cache entry failures.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache entry for {identity} is locked by another process (lock: {lock_path})")]
    LockHeld {
        identity: String,
        lock_path: PathBuf,
    },

    #[error("cannot prepare cache entry for {identity}: {source}")]
    Prepare {
        identity: String,
        source: std::io::Error,
    },

    #[error("{identity}: cache entry already installed with result hash {existing}, expected {computed}")]
    ResultHashMismatch {
        identity: String,
        existing: String,
        computed: String,
    },
}

/// Binding misuse from recipe scripts.
#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("'{binding}' called outside a recipe phase")]
    NoPhaseContext { binding: &'static str },

    #[error("{identity}: '{binding}' is not available during {phase}")]
    WrongPhase {
        identity: String,
        binding: &'static str,
        phase: Phase,
    },

    #[error("{identity}: '{binding}' requires an active cache entry lock")]
    NoCacheLock {
        identity: String,
        binding: &'static str,
    },

    #[error("unknown phase name '{0}'")]
    UnknownPhase(String),

    #[error("{identity}: bad argument to '{binding}': {reason}")]
    BadArgument {
        identity: String,
        binding: &'static str,
        reason: String,
    },

    #[error("{identity}: unknown option key '{key}' for '{binding}'")]
    UnknownOption {
        identity: String,
        binding: &'static str,
        key: String,
    },

    #[error("cannot load recipe script '{path}': {reason}")]
    Load { path: String, reason: String },

    #[error("{identity} ({phase}): script error: {reason}")]
    Eval {
        identity: String,
        phase: Phase,
        reason: String,
    },

    #[error("invalid recipe identity '{text}': {reason}")]
    BadIdentity { text: String, reason: String },
}

/// Any failure a recipe worker can hit.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    DependencyAccess(#[from] DependencyAccessError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Shell(#[from] ShellError),
    #[error(transparent)]
    Filesystem(#[from] FilesystemError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Script(#[from] ScriptError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Composite failure raised by `run_full`: the first failure of every failed
/// recipe, sorted by identity so output is stable run to run.
#[derive(Error, Debug)]
#[error("{} recipe(s) failed:\n{}", failures.len(), failures.iter().map(|(id, e)| format!("  {id}: {e}")).collect::<Vec<_>>().join("\n"))]
pub struct RunError {
    pub failures: Vec<(String, Error)>,
}

impl Error {
    /// Render into a Rhai runtime error at the binding boundary.
    pub fn into_eval(self) -> Box<rhai::EvalAltResult> {
        self.to_string().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_names_full_path() {
        let err = GraphError::Cycle {
            path: vec![
                "local.a@v1".into(),
                "local.b@v1".into(),
                "local.c@v1".into(),
                "local.a@v1".into(),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("local.a@v1 -> local.b@v1 -> local.c@v1 -> local.a@v1"));
    }

    #[test]
    fn phase_order_message_names_both_phases() {
        let err = DependencyAccessError::PhaseOrder {
            owner: "local.a@v1".into(),
            query: "local.lib@v1".into(),
            needed_by: Phase::Build,
            current: Phase::Stage,
        };
        let msg = err.to_string();
        assert!(msg.contains("build"));
        assert!(msg.contains("stage"));
    }

    #[test]
    fn run_error_lists_failures_in_given_order() {
        let err = RunError {
            failures: vec![
                (
                    "local.a@v1".into(),
                    Error::Shell(ShellError::NonZeroExit {
                        identity: "local.a@v1".into(),
                        phase: Phase::Build,
                        command: "false".into(),
                        code: 1,
                    }),
                ),
                (
                    "local.b@v1".into(),
                    Error::Graph(GraphError::MissingReference {
                        owner: "local.b@v1".into(),
                        query: "tool".into(),
                    }),
                ),
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("2 recipe(s) failed"));
        assert!(msg.find("local.a@v1").unwrap() < msg.find("local.b@v1").unwrap());
        assert!(msg.contains("exit code"));
    }
}

//! Per-instance recipe records.
//!
//! A [`Recipe`] is created once per canonical identity (the engine memoises
//! on the key) and carries everything a worker accumulates on the way to
//! completion: the loaded script, the bound dependency edges, declared
//! products, the cache entry lock and the final result hash.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use rhai::{AST, Scope};

use crate::cache::EntryLock;
use crate::coord::ExecutionContext;
use crate::key::RecipeKey;
use crate::phase::Phase;
use crate::spec::{DependencySpec, RecipeSpec};

/// How a recipe's workspace relates to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipeType {
    /// Normal recipe: workspace promotes to a persistent asset.
    CacheManaged,
    /// `let kind = "user"`: ephemeral workspace, no persistent asset.
    UserManaged,
    /// Dependencies only, no phase bodies and no workspace.
    BundleOnly,
}

/// The recipe's compiled script plus the scope its top level ran in.
#[derive(Debug)]
pub struct ScriptState {
    pub ast: AST,
    pub scope: Scope<'static>,
}

/// A settled direct dependency edge.
#[derive(Debug, Clone)]
pub struct BoundDependency {
    /// The dependency as the author wrote it (query or canonical spec).
    pub declared: String,
    pub key: RecipeKey,
    pub needed_by: Phase,
}

/// A settled product edge.
#[derive(Debug, Clone)]
pub struct BoundProduct {
    pub product: String,
    /// Provider identity constraint, as written, if the edge carried one.
    pub constraint: Option<String>,
    pub provider: RecipeKey,
    pub needed_by: Phase,
}

/// A declared product value: a path under install_dir, or a literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProductValue {
    RelativePath(String),
    Literal(String),
}

/// Mutable per-recipe state, guarded by one mutex. Workers own their recipe's
/// progress; other threads only read settled fields.
#[derive(Default, Debug)]
pub struct RecipeState {
    pub script: Option<ScriptState>,
    pub lock: Option<EntryLock>,
    /// Direct dependencies in declaration order, as written.
    pub declared: Vec<DependencySpec>,
    /// Strong edges bound during recipe_fetch plus weak/reference edges bound
    /// at settlement.
    pub dependencies: Vec<BoundDependency>,
    /// Weak and reference edges awaiting settlement.
    pub unsettled: Vec<DependencySpec>,
    pub product_dependencies: Vec<BoundProduct>,
    /// Products this recipe declares; frozen after recipe_fetch.
    pub products: BTreeMap<String, ProductValue>,
    pub rtype: Option<RecipeType>,
    pub result_hash: Option<String>,
    /// Installed location; empty for user-managed and bundle-only recipes.
    pub asset_path: Option<PathBuf>,
    /// Directory of the recipe script, for resolving dependency sources.
    pub script_dir: PathBuf,
    /// Set by the check phase: remaining phase bodies are skipped.
    pub skip_work: bool,
}

/// One recipe instance. Shared via `Arc`; the engine registry keeps every
/// instance alive for the duration of the run.
#[derive(Debug)]
pub struct Recipe {
    pub key: RecipeKey,
    pub spec: RecipeSpec,
    pub coord: ExecutionContext,
    pub state: Mutex<RecipeState>,
}

impl Recipe {
    pub fn new(spec: RecipeSpec) -> Recipe {
        Recipe {
            key: spec.key.clone(),
            spec,
            coord: ExecutionContext::new(),
            state: Mutex::new(RecipeState::default()),
        }
    }

    pub fn identity(&self) -> String {
        self.key.canonical()
    }

    /// The recipe's type; `CacheManaged` until recipe_fetch classifies it.
    pub fn rtype(&self) -> RecipeType {
        self.state
            .lock()
            .expect("recipe state poisoned")
            .rtype
            .unwrap_or(RecipeType::CacheManaged)
    }

    /// The bound edge for a direct dependency key, if any.
    pub fn edge_for(&self, key: &RecipeKey) -> Option<BoundDependency> {
        self.state
            .lock()
            .expect("recipe state poisoned")
            .dependencies
            .iter()
            .find(|d| &d.key == key)
            .cloned()
    }
}

//! The recipe engine.
//!
//! Owns the recipe registry and alias table, memoises recipe instances by
//! canonical identity, spawns one worker thread per recipe and coordinates
//! them through the resumable phase protocol. `resolve_graph` settles the
//! dependency graph; `run_full` drives every registered recipe to completion
//! and collects the result map.

mod fetch_recipe;
mod phases;
mod settle;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};

use crate::cache::Cache;
use crate::error::{Error, GraphError, Result, RunError};
use crate::fetch::Transport;
use crate::key::{Query, RecipeKey};
use crate::output;
use crate::phase::Phase;
use crate::recipe::Recipe;
use crate::shell::ShellConfig;
use crate::spec::RecipeSpec;

/// Engine construction parameters.
pub struct EngineConfig {
    pub cache_root: PathBuf,
    pub default_shell: ShellConfig,
    pub transports: Vec<Box<dyn Transport>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            cache_root: Cache::default_root(),
            default_shell: ShellConfig::default(),
            transports: crate::fetch::default_transports(),
        }
    }
}

/// What one completed recipe produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeResult {
    /// Installed location; `None` for user-managed and bundle-only recipes.
    pub asset_path: Option<PathBuf>,
    pub result_hash: String,
}

struct Registry {
    /// Insertion order is the match order for fuzzy queries.
    recipes: Vec<Arc<Recipe>>,
    by_canonical: HashMap<String, usize>,
    aliases: HashMap<String, String>,
}

pub struct Engine {
    cache: Cache,
    default_shell: ShellConfig,
    transports: Vec<Box<dyn Transport>>,
    registry: Mutex<Registry>,
    /// Recipes whose recipe_fetch has been started but not finished; the
    /// settlement barrier waits for this to reach zero.
    pending_fetches: Mutex<usize>,
    fetches_drained: Condvar,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Arc<Engine>> {
        let cache = Cache::open(&config.cache_root).map_err(|source| {
            Error::from(crate::error::CacheError::Prepare {
                identity: config.cache_root.display().to_string(),
                source,
            })
        })?;
        Ok(Arc::new(Engine {
            cache,
            default_shell: config.default_shell,
            transports: config.transports,
            registry: Mutex::new(Registry {
                recipes: Vec::new(),
                by_canonical: HashMap::new(),
                aliases: HashMap::new(),
            }),
            pending_fetches: Mutex::new(0),
            fetches_drained: Condvar::new(),
        }))
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn default_shell(&self) -> &ShellConfig {
        &self.default_shell
    }

    pub fn transports(&self) -> &[Box<dyn Transport>] {
        &self.transports
    }

    /// Return the recipe for this configuration, creating it on first sight.
    /// This is the memoisation point: one instance per canonical identity,
    /// process-wide. A second configuration with the same identity but a
    /// different source is a conflict.
    pub fn ensure_recipe(&self, spec: RecipeSpec) -> Result<Arc<Recipe>> {
        let canonical = spec.key.canonical();
        let mut guard = self.registry.lock().expect("registry poisoned");
        let registry = &mut *guard;

        let recipe = match registry.by_canonical.get(&canonical).copied() {
            Some(index) => {
                let existing = &registry.recipes[index];
                if let (Some(a), Some(b)) = (&existing.spec.source, &spec.source) {
                    if a != b {
                        return Err(GraphError::ConflictingSpec {
                            identity: canonical,
                            existing: a.clone(),
                            requested: b.clone(),
                        }
                        .into());
                    }
                }
                Arc::clone(existing)
            }
            None => {
                let recipe = Arc::new(Recipe::new(spec.clone()));
                let index = registry.recipes.len();
                registry.by_canonical.insert(canonical.clone(), index);
                registry.recipes.push(Arc::clone(&recipe));
                recipe
            }
        };

        if let Some(alias) = &spec.alias {
            Self::bind_alias(registry, alias, &canonical)?;
        }
        Ok(recipe)
    }

    /// Bind a user-facing short name to a canonical identity. Alias -> key
    /// is injective: rebinding to a different key fails.
    pub fn register_alias(&self, alias: &str, key: &RecipeKey) -> Result<()> {
        let mut registry = self.registry.lock().expect("registry poisoned");
        Self::bind_alias(&mut registry, alias, &key.canonical())
    }

    fn bind_alias(registry: &mut Registry, alias: &str, canonical: &str) -> Result<()> {
        match registry.aliases.get(alias) {
            Some(existing) if existing != canonical => Err(GraphError::AliasConflict {
                alias: alias.to_string(),
                existing: existing.clone(),
                requested: canonical.to_string(),
            }
            .into()),
            Some(_) => Ok(()),
            None => {
                registry.aliases.insert(alias.to_string(), canonical.to_string());
                Ok(())
            }
        }
    }

    /// Exact lookup: alias first, then canonical identity.
    pub fn find_exact(&self, name: &str) -> Option<Arc<Recipe>> {
        let registry = self.registry.lock().expect("registry poisoned");
        let canonical = registry.aliases.get(name).cloned();
        let key = canonical.as_deref().unwrap_or(name);
        registry
            .by_canonical
            .get(key)
            .map(|&index| Arc::clone(&registry.recipes[index]))
    }

    /// Fuzzy lookup, in registration order. An alias hit short-circuits.
    pub fn find_matches(&self, query: &str) -> Vec<Arc<Recipe>> {
        let registry = self.registry.lock().expect("registry poisoned");
        if let Some(canonical) = registry.aliases.get(query) {
            if let Some(&index) = registry.by_canonical.get(canonical) {
                return vec![Arc::clone(&registry.recipes[index])];
            }
        }
        let parsed = Query::parse(query);
        registry
            .recipes
            .iter()
            .filter(|r| parsed.matches(&r.key))
            .cloned()
            .collect()
    }

    pub fn all_recipes(&self) -> Vec<Arc<Recipe>> {
        self.registry.lock().expect("registry poisoned").recipes.clone()
    }

    /// Raise a recipe's target phase, spawning its worker on first raise.
    /// `ancestors` is the recipe_fetch ancestor chain used for cycle
    /// detection; it is only consulted on the spawning raise.
    pub fn ensure_recipe_at_phase(
        self: &Arc<Self>,
        recipe: &Arc<Recipe>,
        phase: Phase,
        ancestors: Vec<RecipeKey>,
    ) {
        let target = phase.max(Phase::RecipeFetch);
        if recipe.coord.raise_target(target) == crate::coord::RaiseOutcome::SpawnWorker {
            recipe.coord.set_ancestors(ancestors);
            {
                let mut pending = self.pending_fetches.lock().expect("fetch counter poisoned");
                *pending += 1;
            }
            let engine = Arc::clone(self);
            let worker_recipe = Arc::clone(recipe);
            let handle = std::thread::spawn(move || worker_loop(engine, worker_recipe));
            recipe.coord.set_worker(handle);
        }
    }

    fn fetch_done(&self) {
        let mut pending = self.pending_fetches.lock().expect("fetch counter poisoned");
        *pending -= 1;
        if *pending == 0 {
            self.fetches_drained.notify_all();
        }
    }

    /// The settlement barrier: block until no recipe_fetch is outstanding.
    fn wait_recipe_fetches(&self) {
        let mut pending = self.pending_fetches.lock().expect("fetch counter poisoned");
        while *pending > 0 {
            pending = self
                .fetches_drained
                .wait(pending)
                .expect("fetch counter poisoned");
        }
    }

    /// Build and settle the dependency graph for `roots`.
    ///
    /// Loads every reachable recipe (recipe_fetch), then runs the weak
    /// settlement fixed point and validates reference and product edges.
    /// Per-recipe failures (cycles, load errors) stay on their recipes and
    /// surface in `run_full`'s composite error.
    pub fn resolve_graph(self: &Arc<Self>, roots: &[RecipeSpec]) -> Result<Vec<Arc<Recipe>>> {
        for spec in roots {
            let recipe = self.ensure_recipe(spec.clone())?;
            self.ensure_recipe_at_phase(&recipe, Phase::RecipeFetch, Vec::new());
        }
        self.wait_recipe_fetches();
        settle::settle(self)?;
        Ok(self.all_recipes())
    }

    /// Resolve the graph, drive every recipe to completion, join the
    /// workers and collect the results. On any failure, raises a composite
    /// error listing each recipe's first failure, sorted by identity.
    pub fn run_full(
        self: &Arc<Self>,
        roots: &[RecipeSpec],
    ) -> std::result::Result<BTreeMap<String, RecipeResult>, RunError> {
        let single = |identity: String, error: Error| RunError {
            failures: vec![(identity, error)],
        };
        let recipes = self
            .resolve_graph(roots)
            .map_err(|e| single("<graph>".to_string(), e))?;

        for recipe in &recipes {
            self.ensure_recipe_at_phase(recipe, Phase::Completion, Vec::new());
        }
        for recipe in &recipes {
            if let Some(handle) = recipe.coord.take_worker() {
                let _ = handle.join();
            }
        }

        let mut ordered: Vec<&Arc<Recipe>> = recipes.iter().collect();
        ordered.sort_by_key(|r| r.identity());

        let mut failures = Vec::new();
        let mut results = BTreeMap::new();
        for recipe in ordered {
            let identity = recipe.identity();
            if let Some(error) = recipe.coord.take_error() {
                failures.push((identity, error));
            } else if recipe.coord.is_failed() {
                failures.push((
                    identity.clone(),
                    Error::from(crate::error::DependencyAccessError::DependencyFailed {
                        owner: identity,
                        identity: "<upstream>".to_string(),
                    }),
                ));
            } else {
                let state = recipe.state.lock().expect("recipe state poisoned");
                results.insert(
                    identity,
                    RecipeResult {
                        asset_path: state.asset_path.clone(),
                        result_hash: state.result_hash.clone().unwrap_or_default(),
                    },
                );
            }
        }

        if failures.is_empty() {
            Ok(results)
        } else {
            Err(RunError { failures })
        }
    }
}

/// The per-recipe worker: run one phase at a time between `current` and
/// `target`, suspending when the target is reached and resuming when another
/// thread raises it.
fn worker_loop(engine: Arc<Engine>, recipe: Arc<Recipe>) {
    // Counted into the settlement barrier at spawn; drained exactly once.
    let mut fetch_counted = true;
    let mut drain = |counted: &mut bool| {
        if *counted {
            engine.fetch_done();
            *counted = false;
        }
    };

    loop {
        let Some(next) = recipe.coord.next_phase() else {
            break;
        };
        match phases::run_phase(&engine, &recipe, next) {
            Ok(phases::PhaseOutcome::Advanced) => {
                recipe.coord.complete_phase(next);
                if next == Phase::RecipeFetch {
                    drain(&mut fetch_counted);
                }
                if next == Phase::Completion {
                    break;
                }
            }
            Ok(phases::PhaseOutcome::Skipped) => {
                recipe.coord.skip_to_deploy();
            }
            Err(error) => {
                output::error(&error.to_string());
                recipe.coord.fail(error);
                break;
            }
        }
    }
    // Whatever path ended the loop, the barrier must not wait on us.
    drain(&mut fetch_counted);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_engine() -> (tempfile::TempDir, Arc<Engine>) {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(EngineConfig {
            cache_root: dir.path().to_path_buf(),
            ..EngineConfig::default()
        })
        .unwrap();
        (dir, engine)
    }

    fn spec(text: &str, source: &str) -> RecipeSpec {
        RecipeSpec::new(RecipeKey::parse(text).unwrap(), source)
    }

    #[test]
    fn ensure_recipe_memoises_by_canonical_identity() {
        let (_dir, engine) = test_engine();
        let a = engine.ensure_recipe(spec("local.a@v1", "a.rhai")).unwrap();
        let b = engine.ensure_recipe(spec("local.a@v1", "a.rhai")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(engine.all_recipes().len(), 1);
    }

    #[test]
    fn conflicting_sources_are_rejected() {
        let (_dir, engine) = test_engine();
        engine.ensure_recipe(spec("local.a@v1", "a.rhai")).unwrap();
        let err = engine
            .ensure_recipe(spec("local.a@v1", "other.rhai"))
            .unwrap_err();
        assert!(err.to_string().contains("conflicting source"));
    }

    #[test]
    fn options_make_distinct_instances() {
        let (_dir, engine) = test_engine();
        engine
            .ensure_recipe(spec("local.a@v1{variant=x}", "a.rhai"))
            .unwrap();
        engine
            .ensure_recipe(spec("local.a@v1{variant=y}", "a.rhai"))
            .unwrap();
        assert_eq!(engine.all_recipes().len(), 2);
    }

    #[test]
    fn aliases_are_injective() {
        let (_dir, engine) = test_engine();
        let a = engine.ensure_recipe(spec("local.a@v1", "a.rhai")).unwrap();
        let b = engine.ensure_recipe(spec("local.b@v1", "b.rhai")).unwrap();
        engine.register_alias("tool", &a.key).unwrap();
        engine.register_alias("tool", &a.key).unwrap();
        let err = engine.register_alias("tool", &b.key).unwrap_err();
        assert!(err.to_string().contains("already bound"));
    }

    #[test]
    fn find_exact_resolves_aliases() {
        let (_dir, engine) = test_engine();
        let a = engine.ensure_recipe(spec("local.a@v1", "a.rhai")).unwrap();
        engine.register_alias("tool", &a.key).unwrap();
        assert!(Arc::ptr_eq(&engine.find_exact("tool").unwrap(), &a));
        assert!(Arc::ptr_eq(&engine.find_exact("local.a@v1").unwrap(), &a));
        assert!(engine.find_exact("missing").is_none());
    }

    #[test]
    fn find_matches_returns_insertion_order() {
        let (_dir, engine) = test_engine();
        engine
            .ensure_recipe(spec("local.python@r4{version=3.14}", "p1.rhai"))
            .unwrap();
        engine
            .ensure_recipe(spec("vendor.python@v1", "p2.rhai"))
            .unwrap();

        let matches = engine.find_matches("python");
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].identity(), "local.python@r4{version=3.14}");
        assert_eq!(matches[1].identity(), "vendor.python@v1");

        assert_eq!(engine.find_matches("local.python").len(), 1);
        assert!(engine.find_matches("ruby").is_empty());
    }
}

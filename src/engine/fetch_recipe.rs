//! The recipe_fetch phase: load the script, read its declarations, register
//! children and take the cache entry lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rhai::{Array, Dynamic, Map, Scope, module_resolvers::FileModuleResolver};

use super::Engine;
use crate::error::{Error, FetchError, GraphError, Result, ScriptError};
use crate::key::RecipeKey;
use crate::manifest::resolve_source;
use crate::phase::Phase;
use crate::recipe::{BoundDependency, ProductValue, Recipe, RecipeType, ScriptState};
use crate::shell::platform_tag;
use crate::spec::DependencySpec;

/// The phase functions a recipe script may define.
const PHASE_FNS: [&str; 6] = ["check", "fetch", "stage", "build", "install", "deploy"];

pub fn run(engine: &Arc<Engine>, recipe: &Arc<Recipe>) -> Result<()> {
    let identity = recipe.identity();

    let source = recipe.spec.source.clone().ok_or_else(|| ScriptError::Load {
        path: identity.clone(),
        reason: "recipe configuration has no source".to_string(),
    })?;
    let script_path = materialise_source(engine, &identity, &source)?;
    let script_dir = script_path
        .parent()
        .unwrap_or(Path::new("."))
        .to_path_buf();
    let script = std::fs::read_to_string(&script_path).map_err(|e| ScriptError::Load {
        path: script_path.display().to_string(),
        reason: e.to_string(),
    })?;

    // Compile with the script-visible constants in scope so they fold into
    // function bodies, then run the top level to collect declarations.
    let mut rh = crate::bindings::new_engine();
    let mut resolver = FileModuleResolver::new();
    resolver.set_base_path(&script_dir);
    rh.set_module_resolver(resolver);

    // IDENTITY and PLATFORM are strings, which the optimizer folds into
    // function bodies at compile time. OPTIONS is a map and therefore only
    // visible to top-level code; ENVY_SHELL lives in a static module so
    // phase functions can reach it as ENVY_SHELL::BASH.
    let mut scope = Scope::new();
    scope.push_constant("IDENTITY", identity.clone());
    scope.push_constant("OPTIONS", options_map(&recipe.key));
    scope.push_constant("PLATFORM", platform_tag().to_string());

    let eval_err = |reason: String| ScriptError::Eval {
        identity: identity.clone(),
        phase: Phase::RecipeFetch,
        reason,
    };
    let ast = rh
        .compile_with_scope(&scope, &script)
        .map_err(|e| eval_err(e.to_string()))?;
    rh.run_ast_with_scope(&mut scope, &ast)
        .map_err(|e| eval_err(e.to_string()))?;

    // Declarations.
    let declared = parse_dependencies(&scope, &identity)?;
    let products = parse_products(&scope, &identity)?;
    let alias = scope.get_value::<String>("alias");
    let has_sources = scope.get_value::<Array>("sources").is_some_and(|s| !s.is_empty());
    let has_phase_fn = PHASE_FNS
        .iter()
        .any(|name| ast.iter_functions().any(|f| f.name == *name));

    let rtype = classify(&scope, &identity, &declared, has_phase_fn, has_sources)?;

    // Register strong children, walking the ancestor chain for cycles.
    let mut chain = recipe.coord.ancestors();
    chain.push(recipe.key.clone());

    let mut bound = Vec::new();
    let mut unsettled = Vec::new();
    for dep in &declared {
        match dep {
            DependencySpec::Strong { spec, needed_by } => {
                if let Some(position) = chain.iter().position(|k| k == &spec.key) {
                    let mut path: Vec<String> =
                        chain[position..].iter().map(|k| k.canonical()).collect();
                    path.push(spec.key.canonical());
                    return Err(GraphError::Cycle { path }.into());
                }
                let mut child_spec = spec.clone();
                if let Some(src) = &child_spec.source {
                    child_spec.source = Some(resolve_source(src, &script_dir));
                }
                let child = engine.ensure_recipe(child_spec)?;
                engine.ensure_recipe_at_phase(&child, Phase::RecipeFetch, chain.clone());
                bound.push(BoundDependency {
                    declared: spec.key.canonical(),
                    key: child.key.clone(),
                    needed_by: *needed_by,
                });
            }
            other => unsettled.push(other.clone()),
        }
    }

    if let Some(alias) = alias.as_deref().or(recipe.spec.alias.as_deref()) {
        engine.register_alias(alias, &recipe.key)?;
    }

    // Cache-managed and user-managed recipes own a workspace from here to
    // completion; bundles never touch the cache.
    let lock = match rtype {
        RecipeType::BundleOnly => None,
        RecipeType::CacheManaged => Some(engine.cache().lock_entry(&recipe.key)?),
        RecipeType::UserManaged => {
            let mut lock = engine.cache().lock_entry(&recipe.key)?;
            lock.set_ephemeral();
            Some(lock)
        }
    };

    let mut state = recipe.state.lock().expect("recipe state poisoned");
    state.script = Some(ScriptState { ast, scope });
    state.declared = declared;
    state.dependencies = bound;
    state.unsettled = unsettled;
    state.products = products;
    state.rtype = Some(rtype);
    state.script_dir = script_dir;
    state.lock = lock;
    Ok(())
}

/// A recipe source may be a URL; those land in the recipe file cache under
/// the cache root, keyed by the source string.
fn materialise_source(engine: &Arc<Engine>, identity: &str, source: &str) -> Result<PathBuf> {
    if !source.contains("://") || source.starts_with("file://") {
        return Ok(PathBuf::from(
            source.strip_prefix("file://").unwrap_or(source),
        ));
    }
    let basename = source.rsplit('/').next().unwrap_or("recipe.rhai");
    let digest = blake3::hash(source.as_bytes()).to_hex();
    let cached = engine
        .cache()
        .recipes_dir()
        .join(format!("{}-{basename}", &digest[..16]));
    if !cached.is_file() {
        crate::fetch::fetch_with(engine.transports(), source, &cached).map_err(|reason| {
            FetchError::Transport {
                identity: identity.to_string(),
                url: source.to_string(),
                reason,
            }
        })?;
    }
    Ok(cached)
}

fn parse_dependencies(scope: &Scope, identity: &str) -> Result<Vec<DependencySpec>> {
    let Some(list) = scope.get_value::<Array>("dependencies") else {
        return Ok(Vec::new());
    };
    list.iter()
        .map(|entry| DependencySpec::from_dynamic(entry, identity).map_err(Error::from))
        .collect()
}

/// Product values: a plain string is a path under install_dir, a
/// `#{ literal: .. }` map or a non-string scalar is a literal value.
fn parse_products(
    scope: &Scope,
    identity: &str,
) -> Result<std::collections::BTreeMap<String, ProductValue>> {
    let mut products = std::collections::BTreeMap::new();
    let Some(map) = scope.get_value::<Map>("products") else {
        return Ok(products);
    };
    for (name, value) in map.iter() {
        let parsed = if let Ok(text) = value.clone().into_immutable_string() {
            ProductValue::RelativePath(text.to_string())
        } else if let Some(inner) = value.read_lock::<Map>() {
            let literal = inner.get("literal").ok_or_else(|| ScriptError::BadArgument {
                identity: identity.to_string(),
                binding: "products",
                reason: format!("product '{name}' map requires a 'literal' value"),
            })?;
            ProductValue::Literal(render_literal(literal))
        } else {
            ProductValue::Literal(render_literal(value))
        };
        products.insert(name.to_string(), parsed);
    }
    Ok(products)
}

fn render_literal(value: &Dynamic) -> String {
    if let Ok(text) = value.clone().into_immutable_string() {
        text.to_string()
    } else {
        value.to_string()
    }
}

fn classify(
    scope: &Scope,
    identity: &str,
    declared: &[DependencySpec],
    has_phase_fn: bool,
    has_sources: bool,
) -> Result<RecipeType> {
    match scope.get_value::<String>("kind").as_deref() {
        Some("user") => Ok(RecipeType::UserManaged),
        Some("cache") | None => {
            if !has_phase_fn && !has_sources && !declared.is_empty() {
                Ok(RecipeType::BundleOnly)
            } else {
                Ok(RecipeType::CacheManaged)
            }
        }
        Some(other) => Err(ScriptError::BadArgument {
            identity: identity.to_string(),
            binding: "kind",
            reason: format!("expected \"user\" or \"cache\", got \"{other}\""),
        }
        .into()),
    }
}

fn options_map(key: &RecipeKey) -> Map {
    let mut map = Map::new();
    for (name, value) in &key.options {
        let dynamic = match value {
            crate::key::OptionValue::Bool(b) => Dynamic::from(*b),
            crate::key::OptionValue::Int(i) => Dynamic::from(*i),
            crate::key::OptionValue::Str(s) => Dynamic::from(s.clone()),
        };
        map.insert(name.as_str().into(), dynamic);
    }
    map
}


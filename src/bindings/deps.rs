//! Dependency-observation bindings: `asset`, `product`, `loadenv_spec`.
//!
//! All three see a dependency only when it is strongly reachable: following
//! bound edges from the current recipe, matching the query as written with
//! the fuzzy rules. The binding phase is the earliest `needed_by` of any
//! first-hop edge that reaches the match; observing earlier is an error.

use std::collections::HashSet;
use std::sync::Arc;

use rhai::{EvalAltResult, Map, Module, Scope};

use crate::bindings::context::{PhaseContext, with_context};
use crate::error::{DependencyAccessError, Error, ScriptError};
use crate::key::{Query, RecipeKey};
use crate::phase::Phase;
use crate::recipe::{ProductValue, Recipe, RecipeType};

/// Walk bound edges from `start`, collecting every reachable identity.
fn reachable_from(ctx: &PhaseContext, start: &RecipeKey) -> Vec<RecipeKey> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut queue = vec![start.clone()];
    let mut order = Vec::new();
    while let Some(key) = queue.pop() {
        if !seen.insert(key.canonical()) {
            continue;
        }
        order.push(key.clone());
        if let Some(recipe) = ctx.engine.find_exact(&key.canonical()) {
            let state = recipe.state.lock().expect("recipe state poisoned");
            for edge in &state.dependencies {
                queue.push(edge.key.clone());
            }
        }
    }
    order
}

/// Resolve `query` to a strongly reachable dependency and its binding phase.
fn resolve_reachable(ctx: &PhaseContext, query_text: &str) -> Result<(Arc<Recipe>, Phase), Error> {
    let owner = ctx.identity();
    let query = Query::parse(query_text);

    let first_hops = {
        let state = ctx.recipe.state.lock().expect("recipe state poisoned");
        state.dependencies.clone()
    };

    let mut target: Option<RecipeKey> = None;
    let mut reach_sets = Vec::with_capacity(first_hops.len());
    for edge in &first_hops {
        let reachable = reachable_from(ctx, &edge.key);
        if target.is_none() {
            target = reachable.iter().find(|k| query.matches(k)).cloned();
        }
        reach_sets.push(reachable);
    }

    let Some(target) = target else {
        return Err(DependencyAccessError::NotDeclared {
            owner,
            query: query_text.to_string(),
        }
        .into());
    };

    // The binding phase is the earliest needed_by over every first hop that
    // can reach the match.
    let binding = first_hops
        .iter()
        .zip(&reach_sets)
        .filter(|(_, reachable)| reachable.iter().any(|k| k == &target))
        .map(|(edge, _)| edge.needed_by)
        .min()
        .expect("target came from a first hop");

    if ctx.phase < binding {
        return Err(DependencyAccessError::PhaseOrder {
            owner,
            query: query_text.to_string(),
            needed_by: binding,
            current: ctx.phase,
        }
        .into());
    }

    let recipe = ctx
        .engine
        .find_exact(&target.canonical())
        .expect("reachable recipe is registered");
    Ok((recipe, binding))
}

fn require_completed(owner: &str, dep: &Recipe) -> Result<(), Error> {
    if dep.coord.current() < Phase::Completion {
        return Err(DependencyAccessError::NotCompleted {
            owner: owner.to_string(),
            identity: dep.identity(),
        }
        .into());
    }
    Ok(())
}

fn install_dir_of(owner: &str, dep: &Recipe) -> Result<std::path::PathBuf, Error> {
    if dep.rtype() != RecipeType::CacheManaged {
        return Err(DependencyAccessError::UserManaged {
            owner: owner.to_string(),
            identity: dep.identity(),
        }
        .into());
    }
    let state = dep.state.lock().expect("recipe state poisoned");
    state.asset_path.clone().ok_or_else(|| {
        DependencyAccessError::NotCompleted {
            owner: owner.to_string(),
            identity: dep.identity(),
        }
        .into()
    })
}

/// `asset("local.lib@v1")` - the resolved install directory of a strongly
/// reachable dependency. (`package` is a reserved word in Rhai, so the
/// binding carries the asset name.)
pub fn asset(query: &str) -> Result<String, Box<EvalAltResult>> {
    with_context("asset", |ctx| {
        let owner = ctx.identity();
        let (dep, _) = resolve_reachable(ctx, query)?;
        require_completed(&owner, &dep)?;
        let dir = install_dir_of(&owner, &dep)?;
        Ok(dir.display().to_string())
    })
}

/// `product("cc")` - the provider's declared product value; paths resolve
/// under the provider's install directory.
pub fn product(name: &str) -> Result<String, Box<EvalAltResult>> {
    with_context("product", |ctx| {
        let owner = ctx.identity();

        let edge = {
            let state = ctx.recipe.state.lock().expect("recipe state poisoned");
            state
                .product_dependencies
                .iter()
                .find(|p| p.product == name)
                .cloned()
        };
        let Some(edge) = edge else {
            return Err(DependencyAccessError::NotDeclared {
                owner,
                query: format!("product:{name}"),
            }
            .into());
        };

        if ctx.phase < edge.needed_by {
            return Err(DependencyAccessError::PhaseOrder {
                owner,
                query: format!("product:{name}"),
                needed_by: edge.needed_by,
                current: ctx.phase,
            }
            .into());
        }

        // Settlement binds within the constraint; re-check here so a
        // constrained edge never hands out another provider's value.
        if let Some(constraint) = &edge.constraint {
            if !Query::parse(constraint).matches(&edge.provider) {
                return Err(DependencyAccessError::ProviderMismatch {
                    owner,
                    product: name.to_string(),
                    expected: constraint.clone(),
                    actual: edge.provider.canonical(),
                }
                .into());
            }
        }

        let provider = ctx
            .engine
            .find_exact(&edge.provider.canonical())
            .ok_or_else(|| {
                Error::from(DependencyAccessError::MissingProduct {
                    owner: owner.clone(),
                    product: name.to_string(),
                })
            })?;
        require_completed(&owner, &provider)?;

        let value = {
            let state = provider.state.lock().expect("recipe state poisoned");
            state.products.get(name).cloned()
        };
        match value {
            Some(ProductValue::Literal(value)) => Ok(value),
            Some(ProductValue::RelativePath(rel)) => {
                let dir = install_dir_of(&owner, &provider)?;
                Ok(dir.join(rel).display().to_string())
            }
            None => Err(DependencyAccessError::MissingProduct {
                owner,
                product: name.to_string(),
            }
            .into()),
        }
    })
}

/// `loadenv_spec("local.lib@v1", "lib.helpers")` - evaluate
/// `lib/helpers.rhai` from the dependency's installed tree in a sandbox and
/// return its top-level variables.
pub fn loadenv_spec(query: &str, module_path: &str) -> Result<Map, Box<EvalAltResult>> {
    let (script, path_display) = with_context("loadenv_spec", |ctx| {
        let owner = ctx.identity();
        let (dep, _) = resolve_reachable(ctx, query)?;
        require_completed(&owner, &dep)?;
        let dir = install_dir_of(&owner, &dep)?;

        let rel = format!("{}.rhai", module_path.replace('.', "/"));
        let path = dir.join(rel);
        let script = std::fs::read_to_string(&path).map_err(|e| {
            Error::from(ScriptError::Load {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
        })?;
        Ok((script, path.display().to_string()))
    })?;

    // Evaluate as a fresh module: the sub-script sees the engine's bindings
    // and the standard library, but no mutable state of the caller.
    let engine = crate::bindings::new_engine();
    let ast = engine
        .compile(&script)
        .map_err(|e| format!("cannot compile {path_display}: {e}"))?;
    let module = Module::eval_ast_as_new(Scope::new(), &ast, &engine)?;

    let mut result = Map::new();
    for (name, value) in module.iter_var() {
        result.insert(name.into(), value.clone());
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_path_maps_dots_to_slashes() {
        let rel = format!("{}.rhai", "lib.helpers".replace('.', "/"));
        assert_eq!(rel, "lib/helpers.rhai");
    }
}

//! Graph settlement: the fixed-point pass that binds weak, reference and
//! product edges once the initial recipe_fetch wave has drained.
//!
//! Weak edges always make progress (bind to a strong match or materialise
//! their fallback), and materialised fallbacks can introduce further weak
//! edges, so the loop runs until an iteration changes nothing. Reference and
//! product edges retry across iterations; whatever is still unbound at the
//! fixed point is an error on the owning recipe.

use std::collections::HashMap;
use std::sync::Arc;

use super::Engine;
use crate::error::{DependencyAccessError, Error, GraphError, Result};
use crate::key::{Query, RecipeKey};
use crate::manifest::resolve_source;
use crate::phase::Phase;
use crate::recipe::{BoundDependency, BoundProduct, Recipe};
use crate::spec::DependencySpec;

/// Safety valve: no real graph needs anywhere near this many passes.
const MAX_ITERATIONS: usize = 10_000;

pub fn settle(engine: &Arc<Engine>) -> Result<()> {
    for _ in 0..MAX_ITERATIONS {
        let mut progressed = false;

        for recipe in engine.all_recipes() {
            if recipe.coord.is_failed() {
                continue;
            }
            if let Err(error) = settle_recipe(engine, &recipe, &mut progressed) {
                recipe.coord.fail(error);
                progressed = true;
            }
        }

        // Materialised fallbacks need their recipe_fetch before the next
        // pass can see their declarations.
        engine.wait_recipe_fetches();

        if !progressed {
            report_unbound(engine);
            detect_cycles(engine);
            return Ok(());
        }
    }

    let unresolved = engine
        .all_recipes()
        .iter()
        .flat_map(|r| {
            let state = r.state.lock().expect("recipe state poisoned");
            state
                .unsettled
                .iter()
                .map(|d| d.display_query())
                .collect::<Vec<_>>()
        })
        .collect();
    Err(GraphError::SettlementStalled { unresolved }.into())
}

/// Take one pass over a recipe's unsettled edges. Bound edges leave the
/// list; edges that cannot bind yet stay for the next iteration.
fn settle_recipe(
    engine: &Arc<Engine>,
    recipe: &Arc<Recipe>,
    progressed: &mut bool,
) -> Result<()> {
    let owner = recipe.identity();
    let unsettled = {
        let mut state = recipe.state.lock().expect("recipe state poisoned");
        std::mem::take(&mut state.unsettled)
    };
    if unsettled.is_empty() {
        return Ok(());
    }

    let mut remaining = Vec::new();
    for dep in unsettled {
        match &dep {
            DependencySpec::Weak {
                query,
                fallback,
                needed_by,
            } => {
                let matched = engine
                    .find_matches(query)
                    .into_iter()
                    .find(|m| m.key != recipe.key);
                let target = match matched {
                    // A strong match wins; the fallback is discarded.
                    Some(found) => found.key.clone(),
                    None => {
                        let mut spec = fallback.clone();
                        if let Some(src) = &spec.source {
                            let base = {
                                let state =
                                    recipe.state.lock().expect("recipe state poisoned");
                                state.script_dir.clone()
                            };
                            spec.source = Some(resolve_source(src, &base));
                        }
                        let child = engine.ensure_recipe(spec)?;
                        engine.ensure_recipe_at_phase(
                            &child,
                            Phase::RecipeFetch,
                            vec![recipe.key.clone()],
                        );
                        child.key.clone()
                    }
                };
                bind(recipe, query.clone(), target, *needed_by);
                *progressed = true;
            }

            DependencySpec::Reference { query, needed_by } => {
                let matches: Vec<_> = engine
                    .find_matches(query)
                    .into_iter()
                    .filter(|m| m.key != recipe.key)
                    .collect();
                match matches.len() {
                    // A later fallback may still materialise a match.
                    0 => remaining.push(dep.clone()),
                    1 => {
                        bind(recipe, query.clone(), matches[0].key.clone(), *needed_by);
                        *progressed = true;
                    }
                    _ => {
                        return Err(GraphError::AmbiguousReference {
                            owner,
                            query: query.clone(),
                            matches: matches.iter().map(|m| m.identity()).collect(),
                        }
                        .into());
                    }
                }
            }

            DependencySpec::Product {
                product,
                provider,
                needed_by,
            } => {
                // Collect declarers first; the constraint narrows them
                // afterwards so a declarer outside the constraint is seen
                // as a mismatch at the fixed point, not as "no provider".
                let declaring = declarers_of(engine, recipe, product);
                let chosen = match provider {
                    Some(constraint) => {
                        let query = Query::parse(constraint);
                        declaring.iter().find(|c| query.matches(&c.key)).cloned()
                    }
                    None => declaring.first().cloned(),
                };
                match chosen {
                    Some(found) => {
                        let mut state = recipe.state.lock().expect("recipe state poisoned");
                        state.product_dependencies.push(BoundProduct {
                            product: product.clone(),
                            constraint: provider.clone(),
                            provider: found.key.clone(),
                            needed_by: *needed_by,
                        });
                        *progressed = true;
                    }
                    None => remaining.push(dep.clone()),
                }
            }

            DependencySpec::Strong { .. } => {
                unreachable!("strong edges bind during recipe_fetch")
            }
        }
    }

    let mut state = recipe.state.lock().expect("recipe state poisoned");
    state.unsettled.extend(remaining);
    Ok(())
}

/// Every other recipe that declares `product`, in registration order.
fn declarers_of(engine: &Arc<Engine>, owner: &Arc<Recipe>, product: &str) -> Vec<Arc<Recipe>> {
    engine
        .all_recipes()
        .into_iter()
        .filter(|c| {
            c.key != owner.key
                && c.state
                    .lock()
                    .expect("recipe state poisoned")
                    .products
                    .contains_key(product)
        })
        .collect()
}

fn bind(recipe: &Arc<Recipe>, declared: String, key: RecipeKey, needed_by: Phase) {
    let mut state = recipe.state.lock().expect("recipe state poisoned");
    state.dependencies.push(BoundDependency {
        declared,
        key,
        needed_by,
    });
}

/// At the fixed point, any edge still unbound is an error on its owner.
fn report_unbound(engine: &Arc<Engine>) {
    for recipe in engine.all_recipes() {
        if recipe.coord.is_failed() {
            continue;
        }
        let owner = recipe.identity();
        let leftovers = {
            let mut state = recipe.state.lock().expect("recipe state poisoned");
            std::mem::take(&mut state.unsettled)
        };
        for dep in leftovers {
            let error: Error = match dep {
                DependencySpec::Reference { query, .. } => {
                    GraphError::MissingReference {
                        owner: owner.clone(),
                        query,
                    }
                    .into()
                }
                DependencySpec::Product {
                    product, provider, ..
                } => {
                    // A declarer outside the constraint is a mismatch, not
                    // a missing product.
                    let declaring = declarers_of(engine, &recipe, &product);
                    match (&provider, declaring.first()) {
                        (Some(constraint), Some(actual)) => {
                            DependencyAccessError::ProviderMismatch {
                                owner: owner.clone(),
                                product,
                                expected: constraint.clone(),
                                actual: actual.identity(),
                            }
                            .into()
                        }
                        _ => DependencyAccessError::MissingProduct {
                            owner: owner.clone(),
                            product,
                        }
                        .into(),
                    }
                }
                other => GraphError::SettlementStalled {
                    unresolved: vec![other.display_query()],
                }
                .into(),
            };
            recipe.coord.fail(error);
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum NodeState {
    Unprocessed,
    Processing,
    Processed,
}

/// Settlement can bind an edge back into an ancestor, which the recipe_fetch
/// ancestor chain cannot see. One structural pass catches those before any
/// worker waits on the cycle.
fn detect_cycles(engine: &Arc<Engine>) {
    let recipes = engine.all_recipes();
    let mut states: HashMap<String, NodeState> = recipes
        .iter()
        .map(|r| (r.identity(), NodeState::Unprocessed))
        .collect();

    for start in &recipes {
        if states[&start.identity()] != NodeState::Unprocessed {
            continue;
        }
        // Iterative DFS; the stack holds each node with its pending edges.
        let mut stack: Vec<(Arc<Recipe>, Vec<RecipeKey>, usize)> = Vec::new();
        let edges = edges_of(start);
        states.insert(start.identity(), NodeState::Processing);
        stack.push((Arc::clone(start), edges, 0));

        while !stack.is_empty() {
            enum Step {
                Pop(String),
                Visit(RecipeKey),
            }
            let step = {
                let (node, edges, next) = stack.last_mut().expect("stack non-empty");
                if *next >= edges.len() {
                    Step::Pop(node.identity())
                } else {
                    let key = edges[*next].clone();
                    *next += 1;
                    Step::Visit(key)
                }
            };
            match step {
                Step::Pop(identity) => {
                    states.insert(identity, NodeState::Processed);
                    stack.pop();
                }
                Step::Visit(child_key) => {
                    let Some(child) = engine.find_exact(&child_key.canonical()) else {
                        continue;
                    };
                    match states[&child.identity()] {
                        NodeState::Unprocessed => {
                            states.insert(child.identity(), NodeState::Processing);
                            let child_edges = edges_of(&child);
                            stack.push((child, child_edges, 0));
                        }
                        NodeState::Processing => {
                            // Back edge: the cycle is the stack from the
                            // child onward.
                            let mut path: Vec<String> = stack
                                .iter()
                                .skip_while(|(n, _, _)| n.key != child.key)
                                .map(|(n, _, _)| n.identity())
                                .collect();
                            path.push(child.identity());
                            child.coord.fail(GraphError::Cycle { path }.into());
                            states.insert(child.identity(), NodeState::Processed);
                        }
                        NodeState::Processed => {}
                    }
                }
            }
        }
    }
}

fn edges_of(recipe: &Arc<Recipe>) -> Vec<RecipeKey> {
    let state = recipe.state.lock().expect("recipe state poisoned");
    state
        .dependencies
        .iter()
        .map(|d| d.key.clone())
        .chain(state.product_dependencies.iter().map(|p| p.provider.clone()))
        .collect()
}

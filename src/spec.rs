//! Recipe configurations and dependency declarations.
//!
//! A [`RecipeSpec`] is the interned configuration a recipe is created from:
//! its key, the script source it loads from, and an optional alias. A
//! [`DependencySpec`] is one entry of a script's `dependencies` list, parsed
//! from the Rhai object map exactly as the author wrote it.

use std::collections::BTreeMap;

use rhai::{Dynamic, Map};

use crate::error::ScriptError;
use crate::key::{OptionValue, Query, RecipeKey};
use crate::phase::Phase;

/// The `needed_by` default: a parent may observe a dependency from `check`.
pub const DEFAULT_NEEDED_BY: Phase = Phase::Check;

/// An interned recipe configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeSpec {
    pub key: RecipeKey,
    /// Location of the recipe script. Two specs with the same key but
    /// different sources conflict at registration time.
    pub source: Option<String>,
    pub alias: Option<String>,
}

impl RecipeSpec {
    pub fn new(key: RecipeKey, source: impl Into<String>) -> Self {
        Self {
            key,
            source: Some(source.into()),
            alias: None,
        }
    }

    /// Parse a spec from a Rhai object map:
    /// `#{ spec: "local.tool@v1", source: "t.rhai", options: #{..}, alias: ".." }`.
    pub fn from_map(map: &Map, owner: &str) -> Result<RecipeSpec, ScriptError> {
        let spec_text = get_str(map, "spec", "dependencies", owner)?
            .ok_or_else(|| bad(owner, "recipe config requires a 'spec' string"))?;
        let mut key = RecipeKey::parse(&spec_text)?;
        if let Some(options) = map.get("options") {
            let folded = fold_options(options, owner)?;
            key.options.extend(folded);
        }
        Ok(RecipeSpec {
            key,
            source: get_str(map, "source", "dependencies", owner)?,
            alias: get_str(map, "alias", "dependencies", owner)?,
        })
    }
}

/// One declared dependency edge, in the four flavours of the graph model.
#[derive(Debug, Clone)]
pub enum DependencySpec {
    /// `#{ spec: "local.b@v1", source: "b.rhai", options: #{..} }` - creates
    /// an exact recipe during recipe_fetch.
    Strong { spec: RecipeSpec, needed_by: Phase },
    /// `#{ spec: "tool", weak: #{ spec: .., source: .. } }` - the query is
    /// matched during settlement; the fallback materialises only if nothing
    /// strong matches.
    Weak {
        query: String,
        fallback: RecipeSpec,
        needed_by: Phase,
    },
    /// `#{ spec: "tool" }` - must bind to an existing match at settlement.
    Reference { query: String, needed_by: Phase },
    /// `#{ product: "cc", provider: "local.gcc@v13" }` - binds by product
    /// name, optionally constrained to one provider identity.
    Product {
        product: String,
        provider: Option<String>,
        needed_by: Phase,
    },
}

impl DependencySpec {
    pub fn needed_by(&self) -> Phase {
        match self {
            DependencySpec::Strong { needed_by, .. }
            | DependencySpec::Weak { needed_by, .. }
            | DependencySpec::Reference { needed_by, .. }
            | DependencySpec::Product { needed_by, .. } => *needed_by,
        }
    }

    /// The dependency as the author wrote it, for error messages.
    pub fn display_query(&self) -> String {
        match self {
            DependencySpec::Strong { spec, .. } => spec.key.canonical(),
            DependencySpec::Weak { query, .. } | DependencySpec::Reference { query, .. } => {
                query.clone()
            }
            DependencySpec::Product { product, .. } => format!("product:{product}"),
        }
    }

    /// Parse one entry of a script's `dependencies` array.
    pub fn from_dynamic(value: &Dynamic, owner: &str) -> Result<DependencySpec, ScriptError> {
        let map = value
            .read_lock::<Map>()
            .ok_or_else(|| bad(owner, "each dependency must be an object map"))?;

        for key in map.keys() {
            match key.as_str() {
                "spec" | "source" | "options" | "alias" | "weak" | "product" | "provider"
                | "needed_by" => {}
                other => {
                    return Err(ScriptError::UnknownOption {
                        identity: owner.to_string(),
                        binding: "dependencies",
                        key: other.to_string(),
                    });
                }
            }
        }

        let needed_by = match get_str(&map, "needed_by", "dependencies", owner)? {
            Some(name) => Phase::parse(&name)?,
            None => DEFAULT_NEEDED_BY,
        };

        if let Some(product) = get_str(&map, "product", "dependencies", owner)? {
            if map.contains_key("spec") || map.contains_key("weak") {
                return Err(bad(owner, "a product edge cannot also carry 'spec' or 'weak'"));
            }
            return Ok(DependencySpec::Product {
                product,
                provider: get_str(&map, "provider", "dependencies", owner)?,
                needed_by,
            });
        }

        let spec_text = get_str(&map, "spec", "dependencies", owner)?
            .ok_or_else(|| bad(owner, "a dependency requires 'spec' or 'product'"))?;

        if let Some(weak) = map.get("weak") {
            let weak_map = weak
                .read_lock::<Map>()
                .ok_or_else(|| bad(owner, "'weak' must be a recipe config map"))?;
            let fallback = RecipeSpec::from_map(&weak_map, owner)?;
            if Query::parse(&spec_text) == Query::Never {
                return Err(bad(owner, "weak edge query matches nothing as written"));
            }
            return Ok(DependencySpec::Weak {
                query: spec_text,
                fallback,
                needed_by,
            });
        }

        if map.contains_key("source") || map.contains_key("options") {
            // Strong atomic edge: fully-qualified spec plus its script source.
            let spec = RecipeSpec::from_map(&map, owner)?;
            return Ok(DependencySpec::Strong { spec, needed_by });
        }

        if Query::parse(&spec_text) == Query::Never {
            return Err(bad(owner, "reference query matches nothing as written"));
        }
        Ok(DependencySpec::Reference {
            query: spec_text,
            needed_by,
        })
    }
}

fn bad(owner: &str, reason: &str) -> ScriptError {
    ScriptError::BadArgument {
        identity: owner.to_string(),
        binding: "dependencies",
        reason: reason.to_string(),
    }
}

fn get_str(
    map: &Map,
    field: &str,
    binding: &'static str,
    owner: &str,
) -> Result<Option<String>, ScriptError> {
    match map.get(field) {
        None => Ok(None),
        Some(v) => v
            .clone()
            .into_immutable_string()
            .map(|s| Some(s.to_string()))
            .map_err(|got| ScriptError::BadArgument {
                identity: owner.to_string(),
                binding,
                reason: format!("'{field}' must be a string, got {got}"),
            }),
    }
}

/// Convert a Rhai option map into deterministic option values.
pub fn fold_options(value: &Dynamic, owner: &str) -> Result<BTreeMap<String, OptionValue>, ScriptError> {
    let map = value
        .read_lock::<Map>()
        .ok_or_else(|| bad(owner, "'options' must be an object map"))?;
    let mut folded = BTreeMap::new();
    for (k, v) in map.iter() {
        let value = if let Some(b) = v.clone().try_cast::<bool>() {
            OptionValue::Bool(b)
        } else if let Some(i) = v.clone().try_cast::<i64>() {
            OptionValue::Int(i)
        } else if let Ok(s) = v.clone().into_immutable_string() {
            OptionValue::Str(s.to_string())
        } else {
            return Err(bad(
                owner,
                &format!("option '{k}' must be a string, integer or boolean"),
            ));
        };
        folded.insert(k.to_string(), value);
    }
    Ok(folded)
}

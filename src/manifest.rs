//! Manifest loading.
//!
//! The manifest is the narrow interface between the front-end and the
//! engine: a list of root recipe configurations, an optional cache root and
//! an optional default shell.
//!
//! ```toml
//! cache_root = "/home/me/.cache/envy"
//!
//! [default_shell]
//! choice = "bash"
//!
//! [[recipe]]
//! spec = "local.tool@v1"
//! source = "recipes/tool.rhai"
//! alias = "tool"
//!
//! [recipe.options]
//! variant = "release"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, ScriptError};
use crate::key::{OptionValue, RecipeKey};
use crate::shell::ShellConfig;
use crate::spec::RecipeSpec;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    cache_root: Option<PathBuf>,
    default_shell: Option<ShellConfig>,
    #[serde(default, rename = "recipe")]
    recipes: Vec<RawRecipe>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRecipe {
    spec: String,
    source: String,
    alias: Option<String>,
    #[serde(default)]
    options: BTreeMap<String, toml::Value>,
}

/// A loaded manifest: the engine's root inputs.
#[derive(Debug)]
pub struct Manifest {
    pub cache_root: Option<PathBuf>,
    pub default_shell: ShellConfig,
    pub roots: Vec<RecipeSpec>,
}

impl Manifest {
    /// Load a manifest file. Relative recipe sources resolve against the
    /// manifest's own directory.
    pub fn load(path: &Path) -> Result<Manifest, Error> {
        let text = std::fs::read_to_string(path).map_err(|e| ScriptError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let base = path.parent().unwrap_or(Path::new("."));
        Manifest::parse(&text, base)
    }

    /// Parse manifest text, resolving relative sources against `base`.
    pub fn parse(text: &str, base: &Path) -> Result<Manifest, Error> {
        let raw: RawManifest = toml::from_str(text).map_err(|e| ScriptError::Load {
            path: "manifest".to_string(),
            reason: e.to_string(),
        })?;

        let mut roots = Vec::with_capacity(raw.recipes.len());
        for recipe in raw.recipes {
            let mut key = RecipeKey::parse(&recipe.spec)?;
            for (name, value) in recipe.options {
                key.options.insert(name.clone(), toml_option(&name, value)?);
            }
            let source = resolve_source(&recipe.source, base);
            roots.push(RecipeSpec {
                key,
                source: Some(source),
                alias: recipe.alias,
            });
        }

        Ok(Manifest {
            cache_root: raw.cache_root,
            default_shell: raw.default_shell.unwrap_or_default(),
            roots,
        })
    }
}

fn toml_option(name: &str, value: toml::Value) -> Result<OptionValue, Error> {
    match value {
        toml::Value::String(s) => Ok(OptionValue::Str(s)),
        toml::Value::Integer(i) => Ok(OptionValue::Int(i)),
        toml::Value::Boolean(b) => Ok(OptionValue::Bool(b)),
        other => Err(ScriptError::BadIdentity {
            text: name.to_string(),
            reason: format!("option must be a string, integer or boolean, got {other}"),
        }
        .into()),
    }
}

/// Resolve a recipe source against a base directory. URLs and absolute
/// paths pass through unchanged.
pub fn resolve_source(source: &str, base: &Path) -> String {
    if source.contains("://") || Path::new(source).is_absolute() {
        source.to_string()
    } else {
        base.join(source).display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::ShellConfig;

    #[test]
    fn parses_roots_with_options() {
        let text = r#"
            [default_shell]
            choice = "bash"

            [[recipe]]
            spec = "local.tool@v1"
            source = "recipes/tool.rhai"
            alias = "tool"

            [recipe.options]
            variant = "release"
            jobs = 4

            [[recipe]]
            spec = "local.lib@v2"
            source = "/abs/lib.rhai"
        "#;
        let manifest = Manifest::parse(text, Path::new("/proj")).unwrap();
        assert_eq!(manifest.roots.len(), 2);
        assert_eq!(
            manifest.roots[0].key.canonical(),
            "local.tool@v1{jobs=4,variant=release}"
        );
        assert_eq!(
            manifest.roots[0].source.as_deref(),
            Some("/proj/recipes/tool.rhai")
        );
        assert_eq!(manifest.roots[0].alias.as_deref(), Some("tool"));
        assert_eq!(manifest.roots[1].source.as_deref(), Some("/abs/lib.rhai"));
        assert_eq!(manifest.default_shell, ShellConfig::Choice("bash".into()));
    }

    #[test]
    fn default_shell_defaults_to_platform() {
        let manifest = Manifest::parse("", Path::new(".")).unwrap();
        assert_eq!(manifest.default_shell, ShellConfig::default());
        assert!(manifest.roots.is_empty());
    }

    #[test]
    fn bad_spec_is_rejected() {
        let text = r#"
            [[recipe]]
            spec = "tool"
            source = "t.rhai"
        "#;
        assert!(Manifest::parse(text, Path::new(".")).is_err());
    }

    #[test]
    fn unknown_manifest_keys_are_rejected() {
        assert!(Manifest::parse("lockfile = true", Path::new(".")).is_err());
    }

    #[test]
    fn url_sources_pass_through() {
        assert_eq!(
            resolve_source("https://example.com/r.rhai", Path::new("/proj")),
            "https://example.com/r.rhai"
        );
        assert_eq!(resolve_source("r.rhai", Path::new("/proj")), "/proj/r.rhai");
    }
}

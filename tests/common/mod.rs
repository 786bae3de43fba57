//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use envy::{Engine, EngineConfig, RecipeKey, RecipeSpec};
use tempfile::TempDir;

/// Create a test environment with a cache root and a recipes directory.
pub fn create_test_env() -> (TempDir, PathBuf, PathBuf) {
    let dir = TempDir::new().unwrap();
    let cache_root = dir.path().join("cache");
    let recipes_dir = dir.path().join("recipes");
    std::fs::create_dir_all(&recipes_dir).unwrap();
    (dir, cache_root, recipes_dir)
}

/// Write a recipe file and return its path.
pub fn write_recipe(recipes_dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = recipes_dir.join(format!("{name}.rhai"));
    std::fs::write(&path, content).unwrap();
    path
}

pub fn new_engine(cache_root: &Path) -> Arc<Engine> {
    Engine::new(EngineConfig {
        cache_root: cache_root.to_path_buf(),
        ..EngineConfig::default()
    })
    .unwrap()
}

/// A root configuration pointing at a recipe file.
pub fn root(spec: &str, source: &Path) -> RecipeSpec {
    RecipeSpec::new(
        RecipeKey::parse(spec).unwrap(),
        source.display().to_string(),
    )
}

//! envy CLI - run a recipe manifest against the shared cache
//!
//! Usage:
//!   envy run [--manifest envy.toml] [--cache-root <path>]
//!   envy resolve [--manifest envy.toml]
//!   envy asset <name> [--manifest envy.toml]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use std::path::PathBuf;

use envy::{Engine, EngineConfig, Manifest};

#[derive(Parser)]
#[command(name = "envy")]
#[command(about = "Cache-oriented package manager engine")]
#[command(version)]
struct Cli {
    /// Path to the manifest file
    #[arg(short, long, global = true, default_value = "envy.toml")]
    manifest: PathBuf,

    /// Cache root (overrides the manifest)
    #[arg(long, global = true, env = "ENVY_CACHE_ROOT")]
    cache_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every root recipe to completion
    Run,
    /// Load and settle the dependency graph without building
    Resolve,
    /// Print the installed path of one recipe (building it if needed)
    Asset {
        /// Recipe alias, bare name, or canonical identity
        name: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let manifest = Manifest::load(&cli.manifest)
        .with_context(|| format!("failed to load manifest {}", cli.manifest.display()))?;

    let cache_root = cli
        .cache_root
        .or_else(|| manifest.cache_root.clone())
        .unwrap_or_else(envy::cache::Cache::default_root);
    let engine = Engine::new(EngineConfig {
        cache_root,
        default_shell: manifest.default_shell.clone(),
        ..EngineConfig::default()
    })?;

    match cli.command {
        Commands::Run => {
            let results = engine.run_full(&manifest.roots)?;
            for (identity, result) in &results {
                match &result.asset_path {
                    Some(path) => println!("{} {}", identity.green(), path.display()),
                    None => println!("{} {}", identity.green(), "(no asset)".dimmed()),
                }
            }
            Ok(())
        }
        Commands::Resolve => {
            let recipes = engine.resolve_graph(&manifest.roots)?;
            let mut failed = false;
            for recipe in &recipes {
                if recipe.coord.is_failed() {
                    failed = true;
                    if let Some(error) = recipe.coord.take_error() {
                        eprintln!("{} {}", "error:".red().bold(), error);
                    }
                } else {
                    println!("{}", recipe.identity());
                }
            }
            if failed {
                bail!("graph resolution failed");
            }
            Ok(())
        }
        Commands::Asset { name } => {
            let results = engine.run_full(&manifest.roots)?;
            let recipe = engine
                .find_matches(&name)
                .into_iter()
                .next()
                .with_context(|| format!("no recipe matches '{name}'"))?;
            let result = results
                .get(&recipe.identity())
                .with_context(|| format!("{} did not complete", recipe.identity()))?;
            match &result.asset_path {
                Some(path) => {
                    println!("{}", path.display());
                    Ok(())
                }
                None => bail!("{} has no installed asset", recipe.identity()),
            }
        }
    }
}

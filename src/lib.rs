//! Cache-oriented package manager engine with Rhai recipe scripts.
//!
//! Recipes are Rhai scripts with a canonical identity
//! (`namespace.name@version{options}`). The engine memoises each identity
//! into one recipe instance, runs one worker thread per recipe, and drives
//! every recipe through a fixed phase pipeline
//! (recipe_fetch → check → fetch → stage → build → install → deploy →
//! completion) under a shared, user-wide content cache.
//!
//! # Example Recipe
//!
//! ```rhai
//! let dependencies = [
//!     #{ spec: "local.zlib@v1", source: "zlib.rhai", needed_by: "build" },
//! ];
//! let sources = [
//!     #{ url: "https://example.org/tool-1.4.tar.gz", sha256: "9f86d0..." },
//! ];
//! let products = #{ bin: "bin/tool" };
//!
//! fn build() {
//!     run("./configure && make", #{ cwd: "tool-1.4", shell: ENVY_SHELL::BASH });
//! }
//!
//! fn install() {
//!     move("tool-1.4/tool", path::join(install_dir(), "bin/tool"));
//! }
//! ```
//!
//! # Dependencies
//!
//! A dependency edge is strong (`spec` + `source`), weak with a fallback
//! (`spec` query + `weak` config), reference-only (`spec` query), or a
//! product edge (`product` name). Every edge carries `needed_by`, the
//! earliest phase in which the recipe may observe it; `asset()` and
//! `product()` enforce that ordering at call time.
//!
//! # Engine-Provided Functions
//!
//! - `fetch`, `commit_fetch`, `verify_hash` - fetch-phase downloads
//! - `extract`, `extract_all`, `copy`, `move`, `remove` - filesystem steps
//! - `asset`, `product`, `loadenv_spec` - dependency observation
//! - `run` - shell steps (`cwd`, `env`, `shell`, `capture`, `quiet`,
//!   `check`, `interactive`)
//! - `path::{join, basename, dirname, stem, extension}` - path helpers
//! - `fetch_dir()`, `tmp_dir()`, `stage_dir()`, `install_dir()` - the cache
//!   entry's staging areas
//!
//! Scripts also see `IDENTITY`, `OPTIONS`, `PLATFORM` and `ENVY_SHELL`.

pub mod bindings;
pub mod cache;
pub mod coord;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod key;
pub mod manifest;
pub mod output;
pub mod phase;
pub mod recipe;
pub mod shell;
pub mod spec;
pub mod util;

pub use engine::{Engine, EngineConfig, RecipeResult};
pub use error::{Error, RunError};
pub use key::{Query, RecipeKey};
pub use manifest::Manifest;
pub use phase::Phase;
pub use recipe::{Recipe, RecipeType};
pub use spec::{DependencySpec, RecipeSpec};

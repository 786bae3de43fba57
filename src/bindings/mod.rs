//! The script binding surface.
//!
//! Everything a recipe script can call is registered here. Phase-aware
//! bindings read the thread-local [`context::PhaseContext`] installed by the
//! worker for the duration of one phase body; calling them outside a phase
//! raises a structured error.

pub mod context;
pub mod deps;
pub mod fetch;
pub mod fsops;
pub mod paths;
pub mod run;

use rhai::{Engine, ImmutableString, Module};

/// Build a Rhai engine with the full binding surface registered.
pub fn new_engine() -> Engine {
    let mut engine = Engine::new();

    // Fetch phase
    engine.register_fn("fetch", fetch::fetch_str);
    engine.register_fn("fetch", fetch::fetch_str_opts);
    engine.register_fn("fetch", fetch::fetch_array);
    engine.register_fn("fetch", fetch::fetch_array_opts);
    engine.register_fn("commit_fetch", fetch::commit_fetch_str);
    engine.register_fn("commit_fetch", fetch::commit_fetch_array);
    engine.register_fn("verify_hash", fetch::verify_hash);

    // Filesystem
    engine.register_fn("copy", fsops::copy);
    engine.register_fn("move", fsops::move_path);
    engine.register_fn("remove", fsops::remove);
    engine.register_fn("extract", fsops::extract);
    engine.register_fn("extract", fsops::extract_opts);
    engine.register_fn("extract_all", fsops::extract_all);
    engine.register_fn("extract_all", fsops::extract_all_opts);

    // Dependency observation
    engine.register_fn("asset", deps::asset);
    engine.register_fn("product", deps::product);
    engine.register_fn("loadenv_spec", deps::loadenv_spec);

    // Shell steps
    engine.register_fn("run", run::run_str);
    engine.register_fn("run", run::run_str_opts);
    engine.register_fn("run", run::run_argv);
    engine.register_fn("run", run::run_argv_opts);

    // Staging directories of the held cache entry
    engine.register_fn("fetch_dir", staging_dir_fn("fetch_dir"));
    engine.register_fn("tmp_dir", staging_dir_fn("tmp_dir"));
    engine.register_fn("stage_dir", staging_dir_fn("stage_dir"));
    engine.register_fn("install_dir", staging_dir_fn("install_dir"));

    // Named shells, reachable from phase functions as ENVY_SHELL::BASH.
    let mut shells = Module::new();
    for choice in crate::shell::ShellChoice::ALL {
        shells.set_var(choice.constant(), choice.name().to_string());
    }
    engine.register_static_module("ENVY_SHELL", shells.into());

    // Pure path helpers, used as path::join(..) etc.
    let mut path_module = Module::new();
    path_module.set_native_fn("join", |a: ImmutableString, b: ImmutableString| {
        Ok(paths::join(&a, &b))
    });
    path_module.set_native_fn("basename", |p: ImmutableString| Ok(paths::basename(&p)));
    path_module.set_native_fn("dirname", |p: ImmutableString| Ok(paths::dirname(&p)));
    path_module.set_native_fn("stem", |p: ImmutableString| Ok(paths::stem(&p)));
    path_module.set_native_fn("extension", |p: ImmutableString| Ok(paths::extension(&p)));
    engine.register_static_module("path", path_module.into());

    engine
}

/// A binding returning one staging directory of the current cache entry.
fn staging_dir_fn(
    binding: &'static str,
) -> impl Fn() -> Result<String, Box<rhai::EvalAltResult>> + Clone + Send + Sync + 'static {
    move || {
        context::with_context(binding, |ctx| {
            let staging = ctx.staging(binding)?;
            let dir = match binding {
                "fetch_dir" => &staging.fetch,
                "tmp_dir" => &staging.tmp,
                "stage_dir" => &staging.stage,
                _ => &staging.install,
            };
            Ok(dir.display().to_string())
        })
    }
}

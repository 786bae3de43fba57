//! Script binding behaviour exercised through real recipe runs.

mod common;

use common::{create_test_env, new_engine, root, write_recipe};

#[test]
fn fetch_renames_colliding_basenames_in_order() {
    let (_dir, cache_root, recipes) = create_test_env();
    let src = recipes.join("a.txt");
    std::fs::write(&src, "payload").unwrap();

    let a = write_recipe(
        &recipes,
        "a",
        &format!(
            r#"
fn fetch() {{
    let names = fetch(["file://{src}", "file://{src}", "file://{src}"], #{{ dest: "D" }});
    if names[0] != "a.txt" {{ throw "first was " + names[0]; }}
    if names[1] != "a-2.txt" {{ throw "second was " + names[1]; }}
    if names[2] != "a-3.txt" {{ throw "third was " + names[2]; }}
}}
fn install() {{
    copy(path::join(fetch_dir(), "D"), install_dir());
}}
"#,
            src = src.display()
        ),
    );

    let engine = new_engine(&cache_root);
    let results = engine.run_full(&[root("local.a@v1", &a)]).unwrap();
    let asset = results["local.a@v1"].asset_path.clone().unwrap();
    for name in ["a.txt", "a-2.txt", "a-3.txt"] {
        assert!(asset.join("D").join(name).is_file(), "{name} missing");
    }
}

#[test]
fn fetch_verifies_sha256() {
    let (_dir, cache_root, recipes) = create_test_env();
    let src = recipes.join("a.txt");
    std::fs::write(&src, "payload").unwrap();

    let a = write_recipe(
        &recipes,
        "a",
        &format!(
            r#"
fn fetch() {{
    fetch([#{{ url: "file://{}", sha256: "0000000000000000000000000000000000000000000000000000000000000000" }}]);
}}
"#,
            src.display()
        ),
    );

    let engine = new_engine(&cache_root);
    let err = engine.run_full(&[root("local.a@v1", &a)]).unwrap_err();
    assert!(err.to_string().contains("sha256 mismatch"));
}

#[test]
fn early_dependency_access_names_both_phases() {
    let (_dir, cache_root, recipes) = create_test_env();
    write_recipe(&recipes, "lib", "fn build() {}\n");
    let a = write_recipe(
        &recipes,
        "a",
        r#"
let dependencies = [ #{ spec: "local.lib@v1", source: "lib.rhai", needed_by: "build" } ];
fn stage() {
    asset("local.lib@v1");
}
"#,
    );

    let engine = new_engine(&cache_root);
    let err = engine.run_full(&[root("local.a@v1", &a)]).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("needed_by build"), "got: {msg}");
    assert!(msg.contains("accessed during stage"), "got: {msg}");
}

#[test]
fn undeclared_dependency_access_is_an_error() {
    let (_dir, cache_root, recipes) = create_test_env();
    let other = write_recipe(&recipes, "other", "fn build() {}\n");
    let a = write_recipe(
        &recipes,
        "a",
        r#"
fn build() {
    asset("local.other@v1");
}
"#,
    );

    let engine = new_engine(&cache_root);
    let err = engine
        .run_full(&[root("local.a@v1", &a), root("local.other@v1", &other)])
        .unwrap_err();
    assert!(err.to_string().contains("not a declared dependency"));
}

#[test]
fn transitive_reachability_uses_first_hop_needed_by() {
    let (_dir, cache_root, recipes) = create_test_env();
    write_recipe(&recipes, "inner", "fn build() {}\n");
    let mid = write_recipe(
        &recipes,
        "mid",
        r#"
let dependencies = [ #{ spec: "local.inner@v1", source: "inner.rhai" } ];
fn build() {}
"#,
    );
    let a = write_recipe(
        &recipes,
        "a",
        r#"
let dependencies = [ #{ spec: "local.mid@v1", source: "mid.rhai" } ];
fn build() {
    let dir = asset("inner");
    if dir == "" { throw "no path"; }
}
"#,
    );

    // Complete the dependency subtree first; the second run resumes the
    // same memoised recipes, so asset() observes a finished dependency.
    let engine = new_engine(&cache_root);
    engine.run_full(&[root("local.mid@v1", &mid)]).unwrap();
    engine.run_full(&[root("local.a@v1", &a)]).unwrap();
}

#[test]
fn incomplete_dependency_access_is_an_error() {
    let (_dir, cache_root, recipes) = create_test_env();
    write_recipe(
        &recipes,
        "slow",
        r#"
fn build() {
    run("sleep 1", #{ quiet: true });
}
"#,
    );
    // The edge wait guarantees slow reached check, nothing more; its build
    // is still sleeping when the check body observes it.
    let a = write_recipe(
        &recipes,
        "a",
        r#"
let dependencies = [ #{ spec: "local.slow@v1", source: "slow.rhai" } ];
fn check() {
    asset("local.slow@v1");
    false
}
"#,
    );

    let engine = new_engine(&cache_root);
    let err = engine.run_full(&[root("local.a@v1", &a)]).unwrap_err();
    assert!(err.to_string().contains("has not completed"));
}

#[test]
fn user_managed_dependency_has_no_package_path() {
    let (_dir, cache_root, recipes) = create_test_env();
    let tool = write_recipe(
        &recipes,
        "tool",
        r#"
let kind = "user";
fn build() {}
"#,
    );
    let a = write_recipe(
        &recipes,
        "a",
        r#"
let dependencies = [ #{ spec: "local.tool@v1", source: "tool.rhai" } ];
fn build() {
    asset("local.tool@v1");
}
"#,
    );

    let engine = new_engine(&cache_root);
    engine.run_full(&[root("local.tool@v1", &tool)]).unwrap();
    let err = engine.run_full(&[root("local.a@v1", &a)]).unwrap_err();
    assert!(err.to_string().contains("user-managed"));
}

#[test]
fn products_resolve_paths_and_literals() {
    let (_dir, cache_root, recipes) = create_test_env();
    let gcc = write_recipe(
        &recipes,
        "gcc",
        r#"
let products = #{ cc: "bin/cc", release: #{ literal: "13" } };
fn install() {
    run("mkdir -p " + path::join(install_dir(), "bin"), #{ quiet: true });
    run("touch " + path::join(install_dir(), "bin/cc"), #{ quiet: true });
}
"#,
    );
    let a = write_recipe(
        &recipes,
        "a",
        r#"
let dependencies = [
    #{ spec: "local.gcc@v13", source: "gcc.rhai" },
    #{ product: "cc", provider: "local.gcc@v13", needed_by: "build" },
    #{ product: "release", needed_by: "build" },
];
fn build() {
    let cc = product("cc");
    if !cc.ends_with("bin/cc") { throw "cc was " + cc; }
    if product("release") != "13" { throw "bad release"; }
}
"#,
    );

    let engine = new_engine(&cache_root);
    engine.run_full(&[root("local.gcc@v13", &gcc)]).unwrap();
    engine.run_full(&[root("local.a@v1", &a)]).unwrap();
}

#[test]
fn constrained_product_with_wrong_declarer_is_a_mismatch() {
    let (_dir, cache_root, recipes) = create_test_env();
    write_recipe(
        &recipes,
        "gcc",
        r#"
let products = #{ cc: "bin/cc" };
fn build() {}
"#,
    );
    write_recipe(&recipes, "clang", "fn build() {}\n");
    let a = write_recipe(
        &recipes,
        "a",
        r#"
let dependencies = [
    #{ spec: "local.gcc@v13", source: "gcc.rhai" },
    #{ spec: "local.clang@v1", source: "clang.rhai" },
    #{ product: "cc", provider: "local.clang@v1", needed_by: "build" },
];
fn build() {}
"#,
    );

    let engine = new_engine(&cache_root);
    let err = engine.run_full(&[root("local.a@v1", &a)]).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("constrained to provider local.clang@v1"), "got: {msg}");
    assert!(msg.contains("declared by local.gcc@v13"), "got: {msg}");
}

#[test]
fn missing_product_is_an_error() {
    let (_dir, cache_root, recipes) = create_test_env();
    write_recipe(&recipes, "plain", "fn build() {}\n");
    let a = write_recipe(
        &recipes,
        "a",
        r#"
let dependencies = [
    #{ spec: "local.plain@v1", source: "plain.rhai" },
    #{ product: "cc" },
];
fn build() {}
"#,
    );

    let engine = new_engine(&cache_root);
    let err = engine.run_full(&[root("local.a@v1", &a)]).unwrap_err();
    assert!(err.to_string().contains("product 'cc'"));
}

#[test]
fn loadenv_spec_evaluates_installed_module() {
    let (_dir, cache_root, recipes) = create_test_env();
    let lib = write_recipe(
        &recipes,
        "lib",
        r#"
fn install() {
    run("mkdir -p " + path::join(install_dir(), "lib"), #{ quiet: true });
    run("echo 'let greeting = \"hello\";' > " + path::join(install_dir(), "lib/helpers.rhai"), #{ quiet: true });
}
"#,
    );
    let a = write_recipe(
        &recipes,
        "a",
        r#"
let dependencies = [ #{ spec: "local.lib@v1", source: "lib.rhai" } ];
fn build() {
    let env = loadenv_spec("local.lib@v1", "lib.helpers");
    if env.greeting != "hello" { throw "greeting was " + env.greeting; }
}
"#,
    );

    let engine = new_engine(&cache_root);
    engine.run_full(&[root("local.lib@v1", &lib)]).unwrap();
    engine.run_full(&[root("local.a@v1", &a)]).unwrap();
}

#[test]
fn run_captures_output_and_merges_env() {
    let (_dir, cache_root, recipes) = create_test_env();
    let a = write_recipe(
        &recipes,
        "a",
        r#"
fn build() {
    let out = run("echo $GREETING", #{ env: #{ GREETING: "hi" }, capture: true, quiet: true });
    if out.exit_code != 0 { throw "exit " + out.exit_code; }
    if out.stdout != "hi\n" { throw "stdout was " + out.stdout; }
}
"#,
    );

    let engine = new_engine(&cache_root);
    engine.run_full(&[root("local.a@v1", &a)]).unwrap();
}

#[test]
fn extract_unpacks_into_stage() {
    let (_dir, cache_root, recipes) = create_test_env();
    // Build a small tar.gz fixture with the system tar.
    let srcdir = recipes.join("payload");
    std::fs::create_dir_all(srcdir.join("pkg-1.0")).unwrap();
    std::fs::write(srcdir.join("pkg-1.0/data.txt"), "contents").unwrap();
    let status = std::process::Command::new("tar")
        .args(["czf", "fixture.tar.gz", "pkg-1.0"])
        .current_dir(&srcdir)
        .status()
        .unwrap();
    assert!(status.success());

    let archive = srcdir.join("fixture.tar.gz");
    let a = write_recipe(
        &recipes,
        "a",
        &format!(
            r#"
let sources = [ "file://{}" ];
fn stage() {{
    let count = extract(path::join(fetch_dir(), "fixture.tar.gz"), stage_dir(), #{{ strip: 1 }});
    if count != 1 {{ throw "extracted " + count; }}
}}
"#,
            archive.display()
        ),
    );

    let engine = new_engine(&cache_root);
    let results = engine.run_full(&[root("local.a@v1", &a)]).unwrap();
    let asset = results["local.a@v1"].asset_path.clone().unwrap();
    assert_eq!(std::fs::read_to_string(asset.join("data.txt")).unwrap(), "contents");
}

#[test]
fn move_refuses_to_overwrite() {
    let (_dir, cache_root, recipes) = create_test_env();
    let a = write_recipe(
        &recipes,
        "a",
        r#"
fn build() {
    run("echo one > first.txt; echo two > second.txt", #{ quiet: true });
    move("first.txt", "second.txt");
}
"#,
    );

    let engine = new_engine(&cache_root);
    let err = engine.run_full(&[root("local.a@v1", &a)]).unwrap_err();
    assert!(err.to_string().contains("refusing to overwrite"));
}

#[test]
fn commit_fetch_moves_staged_files() {
    let (_dir, cache_root, recipes) = create_test_env();
    let src = recipes.join("raw.bin");
    std::fs::write(&src, "blob").unwrap();

    let a = write_recipe(
        &recipes,
        "a",
        &format!(
            r#"
fn fetch() {{
    copy("{}", tmp_dir());
    commit_fetch("raw.bin");
}}
fn install() {{
    copy(path::join(fetch_dir(), "raw.bin"), install_dir());
}}
"#,
            src.display()
        ),
    );

    let engine = new_engine(&cache_root);
    let results = engine.run_full(&[root("local.a@v1", &a)]).unwrap();
    let asset = results["local.a@v1"].asset_path.clone().unwrap();
    assert_eq!(std::fs::read_to_string(asset.join("raw.bin")).unwrap(), "blob");
}

//! The `run()` binding: shell steps with streaming output.

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};

use rhai::{Array, Dynamic, EvalAltResult, Map};

use crate::bindings::context::{PhaseContext, with_context};
use crate::error::{Error, ScriptError, ShellError};
use crate::output;
use crate::shell::{ShellChoice, ShellConfig, ShellSpec};

struct RunOpts {
    cwd: Option<String>,
    env: Vec<(String, String)>,
    shell: Option<ShellSpec>,
    capture: bool,
    quiet: bool,
    check: bool,
    interactive: bool,
}

impl Default for RunOpts {
    fn default() -> Self {
        RunOpts {
            cwd: None,
            env: Vec::new(),
            shell: None,
            capture: false,
            quiet: false,
            check: true,
            interactive: false,
        }
    }
}

fn bad(ctx: &PhaseContext, reason: String) -> Error {
    ScriptError::BadArgument {
        identity: ctx.identity(),
        binding: "run",
        reason,
    }
    .into()
}

fn parse_opts(ctx: &PhaseContext, opts: &Map) -> Result<RunOpts, Error> {
    let mut parsed = RunOpts::default();
    for (key, value) in opts.iter() {
        match key.as_str() {
            "cwd" => {
                parsed.cwd = Some(
                    value
                        .clone()
                        .into_immutable_string()
                        .map_err(|_| bad(ctx, "'cwd' must be a string".into()))?
                        .to_string(),
                );
            }
            "env" => {
                let map = value
                    .read_lock::<Map>()
                    .ok_or_else(|| bad(ctx, "'env' must be an object map".into()))?;
                for (k, v) in map.iter() {
                    let v = v
                        .clone()
                        .into_immutable_string()
                        .map_err(|_| bad(ctx, format!("env '{k}' must be a string")))?;
                    parsed.env.push((k.to_string(), v.to_string()));
                }
            }
            "shell" => {
                parsed.shell = Some(parse_shell_value(ctx, value)?);
            }
            "capture" => {
                parsed.capture = value
                    .as_bool()
                    .map_err(|_| bad(ctx, "'capture' must be a boolean".into()))?;
            }
            "quiet" => {
                parsed.quiet = value
                    .as_bool()
                    .map_err(|_| bad(ctx, "'quiet' must be a boolean".into()))?;
            }
            "check" => {
                parsed.check = value
                    .as_bool()
                    .map_err(|_| bad(ctx, "'check' must be a boolean".into()))?;
            }
            "interactive" => {
                parsed.interactive = value
                    .as_bool()
                    .map_err(|_| bad(ctx, "'interactive' must be a boolean".into()))?;
            }
            other => {
                return Err(ScriptError::UnknownOption {
                    identity: ctx.identity(),
                    binding: "run",
                    key: other.to_string(),
                }
                .into());
            }
        }
    }
    if parsed.interactive && parsed.capture {
        return Err(bad(ctx, "'interactive' and 'capture' are mutually exclusive".into()));
    }
    Ok(parsed)
}

/// A shell argument is a named choice, an inline prefix, or `#{ file: .. }`.
fn parse_shell_value(ctx: &PhaseContext, value: &Dynamic) -> Result<ShellSpec, Error> {
    if let Ok(text) = value.clone().into_immutable_string() {
        return Ok(ShellSpec::parse(&text));
    }
    if let Some(map) = value.read_lock::<Map>() {
        if let Some(file) = map.get("file") {
            let file = file
                .clone()
                .into_immutable_string()
                .map_err(|_| bad(ctx, "shell 'file' must be a string".into()))?;
            return Ok(ShellSpec::File(ctx.resolve(&file)));
        }
    }
    Err(bad(ctx, "'shell' must be a string or #{ file: .. }".into()))
}

/// Resolve the engine's default shell. The expression form is evaluated
/// fresh on every call with `IDENTITY` in scope.
fn default_shell(ctx: &PhaseContext) -> Result<ShellSpec, Error> {
    match ctx.engine.default_shell() {
        ShellConfig::Choice(name) => ShellChoice::parse(name)
            .map(ShellSpec::Choice)
            .ok_or_else(|| bad(ctx, format!("unknown shell choice '{name}'"))),
        ShellConfig::Inline(prefix) => Ok(ShellSpec::Inline(prefix.clone())),
        ShellConfig::File(path) => Ok(ShellSpec::File(path.clone())),
        ShellConfig::Expr(source) => {
            let engine = rhai::Engine::new();
            let mut scope = rhai::Scope::new();
            scope.push_constant("IDENTITY", ctx.identity());
            let choice: String = engine
                .eval_expression_with_scope(&mut scope, source)
                .map_err(|e| bad(ctx, format!("default shell expression failed: {e}")))?;
            Ok(ShellSpec::parse(&choice))
        }
    }
}

/// Drain a pipe line by line: stream to the UI unless quiet, collect when
/// capturing.
fn pump_lines<R: std::io::Read + Send + 'static>(
    reader: R,
    quiet: bool,
    capture: bool,
) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut collected = String::new();
        for line in BufReader::new(reader).lines() {
            let Ok(line) = line else { break };
            if !quiet {
                output::shell_line(&line);
            }
            if capture {
                collected.push_str(&line);
                collected.push('\n');
            }
        }
        collected
    })
}

fn run_command(
    ctx: &PhaseContext,
    argv: Vec<String>,
    display: String,
    opts: RunOpts,
) -> Result<Dynamic, Error> {
    let identity = ctx.identity();
    let phase = ctx.phase;
    let spawn_err = |reason: String| ShellError::Spawn {
        identity: identity.clone(),
        phase,
        command: display.clone(),
        reason,
    };

    if argv.is_empty() {
        return Err(bad(ctx, "empty command".into()));
    }

    let cwd = match &opts.cwd {
        Some(dir) => ctx.resolve(dir),
        None => ctx.run_dir.clone(),
    };

    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]).current_dir(&cwd);
    for (k, v) in &opts.env {
        command.env(k, v);
    }

    let (status, stdout, stderr) = if opts.interactive {
        // The child inherits the controlling terminal.
        let status = command.status().map_err(|e| spawn_err(e.to_string()))?;
        (status, String::new(), String::new())
    } else {
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = command.spawn().map_err(|e| spawn_err(e.to_string()))?;
        let out_pump = pump_lines(
            child.stdout.take().expect("stdout piped"),
            opts.quiet,
            opts.capture,
        );
        let err_pump = pump_lines(
            child.stderr.take().expect("stderr piped"),
            opts.quiet,
            opts.capture,
        );
        let status = child.wait().map_err(|e| spawn_err(e.to_string()))?;
        let stdout = out_pump.join().unwrap_or_default();
        let stderr = err_pump.join().unwrap_or_default();
        (status, stdout, stderr)
    };

    let code = match status.code() {
        Some(code) => code,
        // Signal termination is fatal regardless of `check`.
        None => {
            return Err(ShellError::Signalled {
                identity,
                phase,
                command: display,
            }
            .into());
        }
    };

    if code != 0 && opts.check {
        return Err(ShellError::NonZeroExit {
            identity,
            phase,
            command: display,
            code,
        }
        .into());
    }

    if opts.capture {
        let mut result = Map::new();
        result.insert("exit_code".into(), Dynamic::from(code as i64));
        result.insert("stdout".into(), Dynamic::from(stdout));
        result.insert("stderr".into(), Dynamic::from(stderr));
        Ok(Dynamic::from_map(result))
    } else {
        Ok(Dynamic::from(code as i64))
    }
}

fn run_script(ctx: &PhaseContext, script: &str, opts: RunOpts) -> Result<Dynamic, Error> {
    let shell = match &opts.shell {
        Some(spec) => spec.clone(),
        None => default_shell(ctx)?,
    };
    let argv = shell.argv(script);
    run_command(ctx, argv, script.to_string(), opts)
}

/// `run("make -j4")` - one shell step, checked by default.
pub fn run_str(script: &str) -> Result<Dynamic, Box<EvalAltResult>> {
    with_context("run", |ctx| run_script(ctx, script, RunOpts::default()))
}

/// `run(script, #{ cwd, env, shell, capture, quiet, check, interactive })`.
pub fn run_str_opts(script: &str, opts: Map) -> Result<Dynamic, Box<EvalAltResult>> {
    with_context("run", |ctx| {
        let opts = parse_opts(ctx, &opts)?;
        run_script(ctx, script, opts)
    })
}

fn argv_from(ctx: &PhaseContext, argv: &Array) -> Result<(Vec<String>, String), Error> {
    let argv = argv
        .iter()
        .map(|v| {
            v.clone()
                .into_immutable_string()
                .map(|s| s.to_string())
                .map_err(|_| bad(ctx, "argv entries must be strings".into()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let display = argv.join(" ");
    Ok((argv, display))
}

/// `run(["tar", "xf", file])` - argv form, no shell involved.
pub fn run_argv(argv: Array) -> Result<Dynamic, Box<EvalAltResult>> {
    with_context("run", |ctx| {
        let (argv, display) = argv_from(ctx, &argv)?;
        run_command(ctx, argv, display, RunOpts::default())
    })
}

/// `run(["cc", "-o", out], #{ quiet: true })`.
pub fn run_argv_opts(argv: Array, opts: Map) -> Result<Dynamic, Box<EvalAltResult>> {
    with_context("run", |ctx| {
        let parsed = parse_opts(ctx, &opts)?;
        let (argv, display) = argv_from(ctx, &argv)?;
        run_command(ctx, argv, display, parsed)
    })
}

//! Shell selection for `run()` steps.
//!
//! Scripts pick a shell through the `ENVY_SHELL` constants, an inline argv
//! prefix, or a file; the manifest can set a process-wide default, including
//! a Rhai expression re-evaluated on every `run()` call.

use std::path::PathBuf;

use serde::Deserialize;

/// The named shells exposed to scripts as `ENVY_SHELL.*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellChoice {
    Bash,
    Sh,
    Zsh,
    Powershell,
    Cmd,
}

impl ShellChoice {
    pub const ALL: [ShellChoice; 5] = [
        ShellChoice::Bash,
        ShellChoice::Sh,
        ShellChoice::Zsh,
        ShellChoice::Powershell,
        ShellChoice::Cmd,
    ];

    /// The stable script-visible name.
    pub fn name(self) -> &'static str {
        match self {
            ShellChoice::Bash => "bash",
            ShellChoice::Sh => "sh",
            ShellChoice::Zsh => "zsh",
            ShellChoice::Powershell => "powershell",
            ShellChoice::Cmd => "cmd",
        }
    }

    /// The script-visible constant key (`ENVY_SHELL.BASH` etc).
    pub fn constant(self) -> &'static str {
        match self {
            ShellChoice::Bash => "BASH",
            ShellChoice::Sh => "SH",
            ShellChoice::Zsh => "ZSH",
            ShellChoice::Powershell => "POWERSHELL",
            ShellChoice::Cmd => "CMD",
        }
    }

    pub fn parse(name: &str) -> Option<ShellChoice> {
        ShellChoice::ALL.into_iter().find(|c| c.name() == name)
    }

    /// The host command line this shell maps to; the script body is appended
    /// as the final argument.
    pub fn argv_prefix(self) -> Vec<String> {
        let parts: &[&str] = match self {
            ShellChoice::Bash => &["bash", "-c"],
            ShellChoice::Sh => &["sh", "-c"],
            ShellChoice::Zsh => &["zsh", "-c"],
            ShellChoice::Powershell => &["powershell", "-Command"],
            ShellChoice::Cmd => &["cmd", "/C"],
        };
        parts.iter().map(|s| s.to_string()).collect()
    }
}

/// A resolved shell: how to turn one script string into an argv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellSpec {
    /// One of the named choices.
    Choice(ShellChoice),
    /// An inline argv prefix, split on whitespace ("bash -euo pipefail -c").
    Inline(String),
    /// An executable invoked with the script text as its single argument.
    File(PathBuf),
}

impl ShellSpec {
    /// Interpret a shell argument as written in a script: a named choice
    /// first, otherwise an inline prefix.
    pub fn parse(text: &str) -> ShellSpec {
        match ShellChoice::parse(text) {
            Some(choice) => ShellSpec::Choice(choice),
            None => ShellSpec::Inline(text.to_string()),
        }
    }

    /// Build the argv for `script`. Empty only for a degenerate inline spec.
    pub fn argv(&self, script: &str) -> Vec<String> {
        let mut argv = match self {
            ShellSpec::Choice(choice) => choice.argv_prefix(),
            ShellSpec::Inline(prefix) => {
                prefix.split_whitespace().map(|s| s.to_string()).collect()
            }
            ShellSpec::File(path) => vec![path.to_string_lossy().to_string()],
        };
        argv.push(script.to_string());
        argv
    }
}

/// The platform-appropriate default when neither the manifest nor the call
/// picks a shell.
pub fn platform_default() -> ShellChoice {
    if cfg!(windows) {
        ShellChoice::Powershell
    } else {
        ShellChoice::Sh
    }
}

/// The script-visible `PLATFORM` tag.
pub fn platform_tag() -> &'static str {
    if cfg!(target_os = "macos") {
        "macos"
    } else if cfg!(windows) {
        "windows"
    } else {
        "linux"
    }
}

/// Manifest-level default shell. The `expr` form is a Rhai expression
/// evaluated fresh on every `run()` call, with `IDENTITY` in scope.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShellConfig {
    Choice(String),
    Inline(String),
    File(PathBuf),
    Expr(String),
}

impl Default for ShellConfig {
    fn default() -> Self {
        ShellConfig::Choice(platform_default().name().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_choices_round_trip() {
        for choice in ShellChoice::ALL {
            assert_eq!(ShellChoice::parse(choice.name()), Some(choice));
        }
        assert_eq!(ShellChoice::parse("fish"), None);
    }

    #[test]
    fn choice_argv_appends_script() {
        let argv = ShellSpec::Choice(ShellChoice::Bash).argv("echo hi");
        assert_eq!(argv, vec!["bash", "-c", "echo hi"]);
    }

    #[test]
    fn inline_prefix_is_split_on_whitespace() {
        let argv = ShellSpec::parse("bash -euo pipefail -c").argv("make");
        assert_eq!(argv, vec!["bash", "-euo", "pipefail", "-c", "make"]);
    }

    #[test]
    fn file_spec_gets_script_as_argument() {
        let argv = ShellSpec::File(PathBuf::from("/opt/shim")).argv("build");
        assert_eq!(argv, vec!["/opt/shim", "build"]);
    }
}

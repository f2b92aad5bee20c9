//! Building OS commands from raw SSH exec requests.
//!
//! Replicates OpenSSH behavior: every command runs through the user's login
//! shell, an empty command becomes a login shell, and a leading shebang makes
//! the script run under its own interpreter. The [`ExecEnv`] trait is the
//! seam that lets an alternative environment (a container) supply the user,
//! shell, and command rewriting.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};

use crate::config::Config;

/// Everything needed to spawn the session's child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub dir: PathBuf,
}

/// Execution environment a command is resolved against.
///
/// The default [`SystemExecEnv`] reads the workspace OS user; the container
/// implementation rewrites commands to run inside a target container.
pub trait ExecEnv: Send + Sync {
    fn user(&self) -> Result<String>;
    fn shell(&self, user: &str) -> Result<String>;
    fn home_dir(&self) -> Result<PathBuf>;
    fn environ(&self) -> Vec<(String, String)>;

    /// Rewrites the command prior to execution. Usually a no-op; the
    /// container environment turns `cmd` into `docker exec ... cmd`.
    fn modify_command(&self, program: String, args: Vec<String>) -> (String, Vec<String>) {
        (program, args)
    }
}

/// The workspace OS user's environment, resolved from the passwd database
/// with environment-variable fallbacks.
pub struct SystemExecEnv;

impl SystemExecEnv {
    fn passwd_entry() -> Option<nix::unistd::User> {
        nix::unistd::User::from_uid(nix::unistd::getuid())
            .ok()
            .flatten()
    }
}

impl ExecEnv for SystemExecEnv {
    fn user(&self) -> Result<String> {
        if let Some(user) = Self::passwd_entry() {
            return Ok(user.name);
        }
        std::env::var("USER").context("get current user")
    }

    fn shell(&self, _user: &str) -> Result<String> {
        if let Ok(shell) = std::env::var("SHELL") {
            return Ok(shell);
        }
        if let Some(user) = Self::passwd_entry() {
            return Ok(user.shell.to_string_lossy().into_owned());
        }
        Ok("/bin/sh".to_string())
    }

    fn home_dir(&self) -> Result<PathBuf> {
        // $HOME takes priority over the passwd entry.
        if let Some(home) = dirs::home_dir() {
            return Ok(home);
        }
        Self::passwd_entry()
            .map(|user| user.dir)
            .ok_or_else(|| anyhow!("get home dir"))
    }

    fn environ(&self) -> Vec<(String, String)> {
        std::env::vars().collect()
    }
}

/// Resolves the shell, working directory, and merged environment for a
/// session command.
pub fn command_env(
    config: &Config,
    exec_env: &dyn ExecEnv,
    forwarded_env: Vec<(String, String)>,
) -> Result<(String, PathBuf, Vec<(String, String)>)> {
    let username = exec_env.user().context("get current user")?;
    let shell = exec_env.shell(&username).context("get user shell")?;

    // If the configured directory doesn't exist, the command runs in the
    // user's home directory instead.
    let dir = match (config.working_directory)() {
        Some(dir) if dir.metadata().is_ok() => dir,
        _ => exec_env.home_dir().context("get home dir")?,
    };

    let mut env = exec_env.environ();
    env.extend(forwarded_env);
    // Login variables (see `man login`).
    env.push(("USER".to_string(), username.clone()));
    env.push(("LOGNAME".to_string(), username));
    env.push(("SHELL".to_string(), shell.clone()));

    let env = (config.update_env)(env).context("apply env")?;

    Ok((shell, dir, env))
}

/// Processes a raw command with OpenSSH-like behavior.
///
/// An empty command defaults to the user's login shell. A command starting
/// with `#!` is executed under the interpreter named on the shebang line; the
/// line is split but not consumed, so the interpreter still receives the full
/// script through the shell caller flag.
pub fn build_command(
    config: &Config,
    raw_command: &str,
    forwarded_env: Vec<(String, String)>,
    exec_env: &dyn ExecEnv,
) -> Result<CommandSpec> {
    let (shell, dir, mut env) = command_env(config, exec_env, forwarded_env)?;

    #[cfg(not(windows))]
    let caller = "-c";
    #[cfg(windows)]
    let caller = "/c";

    let mut program = shell;
    let mut args = vec![caller.to_string(), raw_command.to_string()];

    // A preceding space is not idiomatic for a shebang, but multi-line
    // heredoc strings commonly indent with spaces, so accept it.
    let trimmed = raw_command.trim();
    if trimmed.starts_with("#!") {
        let shebang = trimmed
            .split('\n')
            .next()
            .unwrap_or_default()
            .trim()
            .trim_start_matches("#!");
        let words = shell_words::split(shebang).context("split shebang")?;
        let mut words = words.into_iter();
        program = words
            .next()
            .ok_or_else(|| anyhow!("split shebang: empty interpreter"))?;
        args = words.collect();
        args.push(caller.to_string());
        args.push(raw_command.to_string());
    }

    if raw_command.is_empty() {
        args = Vec::new();
        // On Unix, start a login shell to pick up profile environment.
        #[cfg(not(windows))]
        args.push("-l".to_string());
    }

    let (modified_program, modified_args) = exec_env.modify_command(program.clone(), args.clone());
    if modified_program != program || modified_args != args {
        tracing::debug!(
            before = ?std::iter::once(&program).chain(&args).collect::<Vec<_>>(),
            after = ?std::iter::once(&modified_program).chain(&modified_args).collect::<Vec<_>>(),
            "modified command"
        );
    }

    // These are set by OpenSSH and expected by SSH clients. The agent does
    // its networking in-memory, so real peer addresses don't exist; the
    // placeholders keep the variables present.
    env.push(("SSH_CLIENT".to_string(), "0.0.0.0 0 0".to_string()));
    env.push((
        "SSH_CONNECTION".to_string(),
        "0.0.0.0 0 0.0.0.0 0".to_string(),
    ));

    Ok(CommandSpec {
        program: modified_program,
        args: modified_args,
        env,
        dir,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) struct FakeExecEnv {
        pub shell: String,
        pub home: PathBuf,
    }

    impl Default for FakeExecEnv {
        fn default() -> Self {
            Self {
                shell: "/bin/bash".to_string(),
                home: std::env::temp_dir(),
            }
        }
    }

    impl ExecEnv for FakeExecEnv {
        fn user(&self) -> Result<String> {
            Ok("dev".to_string())
        }

        fn shell(&self, _user: &str) -> Result<String> {
            Ok(self.shell.clone())
        }

        fn home_dir(&self) -> Result<PathBuf> {
            Ok(self.home.clone())
        }

        fn environ(&self) -> Vec<(String, String)> {
            vec![("PATH".to_string(), "/usr/bin".to_string())]
        }
    }

    fn lookup<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
        env.iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_login_shell() {
        let spec = build_command(&Config::default(), "", Vec::new(), &FakeExecEnv::default())
            .unwrap();
        assert_eq!(spec.program, "/bin/bash");
        assert_eq!(spec.args, vec!["-l".to_string()]);
    }

    #[test]
    fn test_shell_caller() {
        let spec = build_command(
            &Config::default(),
            "echo hi",
            Vec::new(),
            &FakeExecEnv::default(),
        )
        .unwrap();
        assert_eq!(spec.program, "/bin/bash");
        assert_eq!(spec.args, vec!["-c".to_string(), "echo hi".to_string()]);
    }

    #[test]
    fn test_shebang() {
        let script = "#!/usr/bin/env python3\nprint(1)";
        let spec = build_command(
            &Config::default(),
            script,
            Vec::new(),
            &FakeExecEnv::default(),
        )
        .unwrap();
        assert_eq!(spec.program, "/usr/bin/env");
        assert_eq!(
            spec.args,
            vec![
                "python3".to_string(),
                "-c".to_string(),
                script.to_string(),
            ]
        );
    }

    #[test]
    fn test_shebang_with_leading_space() {
        let script = "  #!/bin/sh\necho hi";
        let spec = build_command(
            &Config::default(),
            script,
            Vec::new(),
            &FakeExecEnv::default(),
        )
        .unwrap();
        assert_eq!(spec.program, "/bin/sh");
        assert_eq!(spec.args, vec!["-c".to_string(), script.to_string()]);
    }

    #[test]
    fn test_bad_shebang_fails() {
        let err = build_command(
            &Config::default(),
            "#!/bin/sh 'unterminated\n",
            Vec::new(),
            &FakeExecEnv::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("shebang"));
    }

    #[test]
    fn test_env_injection() {
        let spec = build_command(
            &Config::default(),
            "",
            vec![("TERM".to_string(), "xterm".to_string())],
            &FakeExecEnv::default(),
        )
        .unwrap();
        assert_eq!(lookup(&spec.env, "USER"), Some("dev"));
        assert_eq!(lookup(&spec.env, "LOGNAME"), Some("dev"));
        assert_eq!(lookup(&spec.env, "SHELL"), Some("/bin/bash"));
        assert_eq!(lookup(&spec.env, "TERM"), Some("xterm"));
        assert_eq!(lookup(&spec.env, "SSH_CLIENT"), Some("0.0.0.0 0 0"));
        assert_eq!(
            lookup(&spec.env, "SSH_CONNECTION"),
            Some("0.0.0.0 0 0.0.0.0 0")
        );
    }

    #[test]
    fn test_update_env_hook() {
        let mut config = Config::default();
        config.update_env = std::sync::Arc::new(|mut env| {
            env.push(("INJECTED".to_string(), "1".to_string()));
            Ok(env)
        });
        let spec = build_command(&config, "", Vec::new(), &FakeExecEnv::default()).unwrap();
        assert_eq!(lookup(&spec.env, "INJECTED"), Some("1"));
    }

    #[test]
    fn test_missing_working_directory_falls_back_to_home() {
        let mut config = Config::default();
        config.working_directory =
            std::sync::Arc::new(|| Some(PathBuf::from("/does/not/exist")));
        let env = FakeExecEnv::default();
        let spec = build_command(&config, "", Vec::new(), &env).unwrap();
        assert_eq!(spec.dir, env.home);
    }
}

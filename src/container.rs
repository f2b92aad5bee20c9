//! Experimental container execution environment.
//!
//! When container routing is enabled and the client targets a container, the
//! session command is rewritten to run through `docker exec` as the requested
//! container user. The heavy lifting (lifecycle, inspection) belongs to the
//! outer agent; this is only the command seam.

use std::path::PathBuf;

use anyhow::Result;

use crate::command::ExecEnv;

/// Rewrites session commands to execute inside a running container.
pub struct ContainerExecEnv {
    container: String,
    user: Option<String>,
}

impl ContainerExecEnv {
    pub fn new(container: String, user: Option<String>) -> Self {
        Self { container, user }
    }
}

impl ExecEnv for ContainerExecEnv {
    fn user(&self) -> Result<String> {
        Ok(self.user.clone().unwrap_or_else(|| "root".to_string()))
    }

    fn shell(&self, _user: &str) -> Result<String> {
        // The container's passwd database isn't visible from here; /bin/sh
        // is the only shell guaranteed to exist.
        Ok("/bin/sh".to_string())
    }

    fn home_dir(&self) -> Result<PathBuf> {
        Ok(match self.user.as_deref() {
            None | Some("root") => PathBuf::from("/root"),
            Some(user) => PathBuf::from("/home").join(user),
        })
    }

    fn environ(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    fn modify_command(&self, program: String, args: Vec<String>) -> (String, Vec<String>) {
        let mut rewritten = vec!["exec".to_string(), "-i".to_string()];
        if let Some(user) = &self.user {
            rewritten.push("--user".to_string());
            rewritten.push(user.clone());
        }
        rewritten.push(self.container.clone());
        rewritten.push(program);
        rewritten.extend(args);
        ("docker".to_string(), rewritten)
    }
}

//! Announcement banners and message-of-the-day.
//!
//! Banners and the MOTD are only shown on login shells, and a
//! `$HOME/.hushlogin` suppresses the MOTD the same way OpenSSH does. Output
//! goes to a raw PTY, so every line is terminated with CRLF to keep each line
//! starting at column zero.

use std::path::Path;

use anyhow::{Context, Result};

use crate::config::Banner;

/// A login shell is a session where the client requested no command.
pub fn is_login_shell(raw_command: &str) -> bool {
    raw_command.is_empty()
}

/// Whether the MOTD should be suppressed. Always quiet for non-login shells;
/// otherwise quiet iff `$HOME/.hushlogin` exists.
pub fn is_quiet_login(raw_command: &str, home_dir: Option<&Path>) -> bool {
    if !is_login_shell(raw_command) {
        return true;
    }
    match home_dir {
        Some(home) => home.join(".hushlogin").exists(),
        // Best effort: without a home directory there is no .hushlogin to find.
        None => false,
    }
}

/// Renders an announcement banner, if it is enabled and non-empty. The
/// message is trimmed and followed by a blank line for spacing.
pub fn render_banner(banner: &Banner) -> Option<String> {
    if !banner.enabled || banner.message.is_empty() {
        return None;
    }
    let message = format!("{}\n\n", banner.message.trim());
    Some(with_carriage_returns(&message))
}

/// Renders the MOTD file. A missing file is not an error, there simply is no
/// MOTD to show.
pub fn render_motd(path: Option<&Path>) -> Result<Option<String>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("open MOTD: {}", path.display()));
        }
    };
    Ok(Some(with_carriage_returns(&content)))
}

/// Rewrites line endings so every line ends in CRLF.
fn with_carriage_returns(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        out.push_str(line);
        out.push_str("\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_banner() {
        let banner = Banner {
            enabled: true,
            message: "  scheduled maintenance at noon  ".to_string(),
        };
        assert_eq!(
            render_banner(&banner).unwrap(),
            "scheduled maintenance at noon\r\n\r\n"
        );

        assert!(render_banner(&Banner {
            enabled: false,
            message: "hidden".to_string(),
        })
        .is_none());
        assert!(render_banner(&Banner {
            enabled: true,
            message: String::new(),
        })
        .is_none());
    }

    #[test]
    fn test_render_motd() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("motd");
        std::fs::write(&path, "line one\nline two\n").unwrap();

        let motd = render_motd(Some(&path)).unwrap().unwrap();
        assert_eq!(motd, "line one\r\nline two\r\n");

        // Missing file is not an error.
        assert!(render_motd(Some(&dir.path().join("nope"))).unwrap().is_none());
        assert!(render_motd(None).unwrap().is_none());
    }

    #[test]
    fn test_quiet_login() {
        let dir = tempfile::tempdir().unwrap();

        // Commands are always quiet.
        assert!(is_quiet_login("echo hi", Some(dir.path())));
        // Login shell without .hushlogin is loud.
        assert!(!is_quiet_login("", Some(dir.path())));

        std::fs::write(dir.path().join(".hushlogin"), "").unwrap();
        assert!(is_quiet_login("", Some(dir.path())));
    }
}

//! Session classification from magic environment variables.
//!
//! IDE extensions identify themselves by setting a well-known variable in the
//! SSH environment. The variable is not a secret; it only drives connection
//! accounting. All magic variables are stripped before any command executes.

/// Environment variable IDE extensions use to identify themselves.
pub const SESSION_TYPE_ENV: &str = "CODER_SSH_SESSION_TYPE";

/// Environment variable selecting a target container for the session.
/// Only honored when experimental container support is enabled.
pub const CONTAINER_ENV: &str = "CODER_CONTAINER";

/// Environment variable selecting the user inside the target container.
pub const CONTAINER_USER_ENV: &str = "CODER_CONTAINER_USER";

/// The kind of client behind an SSH session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MagicSessionType {
    /// The client sent a session type we don't recognize.
    Unknown,
    /// Plain SSH client, or no session type at all.
    Ssh,
    /// The VS Code remote extension.
    VsCode,
    /// The JetBrains Gateway extension.
    JetBrains,
}

impl MagicSessionType {
    /// Stable label used in logs, metrics and connection reports.
    pub fn label(self) -> &'static str {
        match self {
            MagicSessionType::Unknown => "unknown",
            MagicSessionType::Ssh => "ssh",
            MagicSessionType::VsCode => "vscode",
            MagicSessionType::JetBrains => "jetbrains",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            MagicSessionType::Unknown => 0,
            MagicSessionType::Ssh => 1,
            MagicSessionType::VsCode => 2,
            MagicSessionType::JetBrains => 3,
        }
    }
}

impl std::fmt::Display for MagicSessionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Extracts the magic session type from the requested environment.
///
/// The last occurrence wins, matching is case-insensitive, and every
/// occurrence is removed from the returned environment. The raw value is
/// returned alongside the parsed type so unrecognized values can be logged.
pub fn extract_session_type(
    mut env: Vec<(String, String)>,
) -> (MagicSessionType, String, Vec<(String, String)>) {
    let mut raw = String::new();
    for (key, value) in &env {
        if key == SESSION_TYPE_ENV {
            raw = value.clone();
        }
    }
    env.retain(|(key, _)| key != SESSION_TYPE_ENV);

    let magic = match raw.to_lowercase().as_str() {
        "vscode" => MagicSessionType::VsCode,
        "jetbrains" => MagicSessionType::JetBrains,
        "" | "ssh" => MagicSessionType::Ssh,
        _ => MagicSessionType::Unknown,
    };

    (magic, raw, env)
}

/// Extracts the container target from the requested environment, removing
/// both container variables regardless of whether container support is on.
pub fn extract_container_info(
    mut env: Vec<(String, String)>,
) -> (Option<String>, Option<String>, Vec<(String, String)>) {
    let mut container = None;
    let mut container_user = None;
    for (key, value) in &env {
        if key == CONTAINER_ENV {
            container = Some(value.clone());
        } else if key == CONTAINER_USER_ENV {
            container_user = Some(value.clone());
        }
    }
    env.retain(|(key, _)| key != CONTAINER_ENV && key != CONTAINER_USER_ENV);

    (container, container_user, env)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_extract_session_type() {
        let cases = [
            (vec![], MagicSessionType::Ssh, ""),
            (env(&[(SESSION_TYPE_ENV, "ssh")]), MagicSessionType::Ssh, "ssh"),
            (
                env(&[(SESSION_TYPE_ENV, "vscode")]),
                MagicSessionType::VsCode,
                "vscode",
            ),
            (
                env(&[(SESSION_TYPE_ENV, "VSCode")]),
                MagicSessionType::VsCode,
                "VSCode",
            ),
            (
                env(&[(SESSION_TYPE_ENV, "JetBrains")]),
                MagicSessionType::JetBrains,
                "JetBrains",
            ),
            (
                env(&[(SESSION_TYPE_ENV, "teleport")]),
                MagicSessionType::Unknown,
                "teleport",
            ),
        ];

        for (input, want, want_raw) in cases {
            let (magic, raw, _) = extract_session_type(input);
            assert_eq!(magic, want);
            assert_eq!(raw, want_raw);
        }
    }

    #[test]
    fn test_last_occurrence_wins() {
        let input = env(&[
            (SESSION_TYPE_ENV, "vscode"),
            ("TERM", "xterm"),
            (SESSION_TYPE_ENV, "jetbrains"),
        ]);
        let (magic, raw, filtered) = extract_session_type(input);
        assert_eq!(magic, MagicSessionType::JetBrains);
        assert_eq!(raw, "jetbrains");
        assert_eq!(filtered, env(&[("TERM", "xterm")]));
    }

    #[test]
    fn test_all_occurrences_stripped() {
        let input = env(&[
            (SESSION_TYPE_ENV, "vscode"),
            (SESSION_TYPE_ENV, "vscode"),
            ("PATH", "/usr/bin"),
        ]);
        let (_, _, filtered) = extract_session_type(input);
        assert!(filtered.iter().all(|(k, _)| k != SESSION_TYPE_ENV));
        assert_eq!(filtered.len(), 1);
    }

    #[test]
    fn test_extract_container_info() {
        let input = env(&[
            (CONTAINER_ENV, "devbox"),
            (CONTAINER_USER_ENV, "root"),
            ("TERM", "xterm"),
        ]);
        let (container, user, filtered) = extract_container_info(input);
        assert_eq!(container.as_deref(), Some("devbox"));
        assert_eq!(user.as_deref(), Some("root"));
        assert_eq!(filtered, env(&[("TERM", "xterm")]));

        let (container, user, filtered) = extract_container_info(env(&[("TERM", "xterm")]));
        assert_eq!(container, None);
        assert_eq!(user, None);
        assert_eq!(filtered.len(), 1);
    }
}

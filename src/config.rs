// src/config.rs
//
// =============================================================================
// CRUCIBLE: SERVICE CONFIGURATION
// =============================================================================
//
// All knobs the service recognizes, with their defaults. Populated from the
// `serve` subcommand flags; the engine and adapters receive it behind an Arc
// and never mutate it.

use serde::Serialize;

/// Working directory inside every sandbox. The upload archive is extracted
/// here and the compile-and-run command executes here.
pub const WORK_DIR: &str = "/app";

/// Fixed name the submitted source is staged under.
pub const MAIN_SOURCE: &str = "Main.java";

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub listen_port: u16,
    pub db_path: String,
    pub runtime_socket: String,
    /// Label value attached to every sandbox; the sweeper removes anything
    /// carrying it.
    pub project_label: String,
    pub deadline_ms: u64,
    pub output_cap_bytes: usize,
    pub sandbox_image: String,
    pub memory_limit_bytes: i64,
    pub cpu_weight: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 3000,
            db_path: "crucible.db".into(),
            runtime_socket: "/var/run/docker.sock".into(),
            project_label: "crucible".into(),
            deadline_ms: 10_000,
            output_cap_bytes: 10_000,
            sandbox_image: "openjdk:17-alpine".into(),
            memory_limit_bytes: 512 * 1024 * 1024,
            cpu_weight: 512,
        }
    }
}

impl Config {
    /// The compile-and-run command for a job, as passed to the sandbox.
    /// Program arguments are single-quote escaped so the shell hands them
    /// through verbatim.
    pub fn build_command(&self, args: &[String]) -> Vec<String> {
        let mut run = format!("cd {WORK_DIR} && javac {MAIN_SOURCE} && java Main");
        for arg in args {
            run.push(' ');
            run.push_str(&shell_escape(arg));
        }
        vec!["sh".into(), "-c".into(), run]
    }
}

fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '/')
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_quotes_awkward_args() {
        let cfg = Config::default();
        let cmd = cfg.build_command(&["x".into(), "z with space".into(), "a'b".into()]);
        assert_eq!(cmd[0], "sh");
        assert_eq!(cmd[1], "-c");
        assert_eq!(
            cmd[2],
            "cd /app && javac Main.java && java Main x 'z with space' 'a'\\''b'"
        );
    }

    #[test]
    fn command_without_args_is_bare() {
        let cmd = Config::default().build_command(&[]);
        assert_eq!(cmd[2], "cd /app && javac Main.java && java Main");
    }
}

//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use webterm_core::{Profile, WebtermError, WebtermResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub git: GitSection,
    #[serde(default)]
    pub profiles: Vec<Profile>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Seconds between pings on an idle stream connection.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    /// Seconds without any client frame before a connection is dropped.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            data_dir: default_data_dir(),
            max_sessions: default_max_sessions(),
            heartbeat_interval: default_heartbeat_interval(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

/// `[runtime]` section: per-session knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeSection {
    #[serde(default = "default_replay_buffer")]
    pub replay_buffer_bytes: usize,
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    /// Working directory for profiles that do not set one.
    #[serde(default)]
    pub default_cwd: Option<String>,
    /// Command of the built-in `default` profile; `$SHELL` when unset.
    #[serde(default)]
    pub default_shell: Option<String>,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            replay_buffer_bytes: default_replay_buffer(),
            subscriber_queue: default_subscriber_queue(),
            terminate_grace_ms: default_terminate_grace_ms(),
            cols: default_cols(),
            rows: default_rows(),
            default_cwd: None,
            default_shell: None,
        }
    }
}

/// `[git]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct GitSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_quiet_window_ms")]
    pub quiet_window_ms: u64,
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for GitSection {
    fn default() -> Self {
        Self {
            enabled: true,
            quiet_window_ms: default_quiet_window_ms(),
            max_wait_ms: default_max_wait_ms(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8765
}
fn default_data_dir() -> String {
    "~/.webterm".to_string()
}
fn default_max_sessions() -> usize {
    100
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_idle_timeout() -> u64 {
    90
}
fn default_replay_buffer() -> usize {
    256 * 1024
}
fn default_subscriber_queue() -> usize {
    1024
}
fn default_terminate_grace_ms() -> u64 {
    3000
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_true() -> bool {
    true
}
fn default_quiet_window_ms() -> u64 {
    350
}
fn default_max_wait_ms() -> u64 {
    3000
}
fn default_command_timeout_ms() -> u64 {
    5000
}

/// Settings every session runtime is built with.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub replay_buffer_bytes: usize,
    pub subscriber_queue: usize,
    pub terminate_grace: Duration,
    pub cols: u16,
    pub rows: u16,
    pub git: GitSettings,
}

#[derive(Debug, Clone)]
pub struct GitSettings {
    pub enabled: bool,
    /// Output must stay silent this long before the second snapshot.
    pub quiet_window: Duration,
    /// Upper bound on waiting for quiescence.
    pub max_wait: Duration,
    pub command_timeout: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        let runtime = RuntimeSection::default();
        let git = GitSection::default();
        Self::from_sections(&runtime, &git)
    }
}

impl RuntimeSettings {
    fn from_sections(runtime: &RuntimeSection, git: &GitSection) -> Self {
        Self {
            replay_buffer_bytes: runtime.replay_buffer_bytes,
            subscriber_queue: runtime.subscriber_queue.max(1),
            terminate_grace: Duration::from_millis(runtime.terminate_grace_ms),
            cols: runtime.cols.max(1),
            rows: runtime.rows.max(1),
            git: GitSettings {
                enabled: git.enabled,
                quiet_window: Duration::from_millis(git.quiet_window_ms),
                max_wait: Duration::from_millis(git.max_wait_ms.max(git.quiet_window_ms)),
                command_timeout: Duration::from_millis(git.command_timeout_ms),
            },
        }
    }
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub data_dir: Option<String>,
    pub max_sessions: Option<usize>,
    pub default_cwd: Option<String>,
    pub disable_git: bool,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_sessions: usize,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub default_cwd: PathBuf,
    pub default_shell: String,
    pub runtime: RuntimeSettings,
    pub profiles: Vec<Profile>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: &CliOverrides) -> WebtermResult<Self> {
        let file_config = match config_path.map(expand_tilde) {
            Some(expanded) if expanded.exists() => {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                parse(&content)?
            }
            Some(expanded) => {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, cli)
    }

    fn resolve(file: ConfigFile, cli: &CliOverrides) -> WebtermResult<Self> {
        let mut git = file.git;
        if cli.disable_git {
            git.enabled = false;
        }

        let data_dir_str = cli.data_dir.clone().unwrap_or(file.server.data_dir);
        let default_cwd = match cli.default_cwd.clone().or(file.runtime.default_cwd.clone()) {
            Some(dir) => expand_tilde_str(&dir),
            None => std::env::current_dir()?,
        };
        let default_shell = file
            .runtime
            .default_shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "/bin/sh".to_string());

        let mut seen = std::collections::HashSet::new();
        for profile in &file.profiles {
            if profile.id.is_empty() || profile.command.is_empty() {
                return Err(WebtermError::Other(format!(
                    "config error: profile {:?} needs an id and a command",
                    profile.id
                )));
            }
            if !seen.insert(profile.id.as_str()) {
                return Err(WebtermError::Other(format!(
                    "config error: duplicate profile id {:?}",
                    profile.id
                )));
            }
        }

        Ok(Self {
            bind: cli.bind.clone().unwrap_or(file.server.bind),
            port: cli.port.unwrap_or(file.server.port),
            data_dir: expand_tilde_str(&data_dir_str),
            max_sessions: cli.max_sessions.unwrap_or(file.server.max_sessions),
            heartbeat_interval: Duration::from_secs(file.server.heartbeat_interval.max(1)),
            idle_timeout: Duration::from_secs(file.server.idle_timeout.max(1)),
            default_cwd,
            default_shell,
            runtime: RuntimeSettings::from_sections(&file.runtime, &git),
            profiles: file.profiles,
        })
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn parse(content: &str) -> WebtermResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content).map_err(|e| WebtermError::Other(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = ServerConfig::resolve(parse("").unwrap(), &CliOverrides::default()).unwrap();
        assert_eq!(cfg.port, 8765);
        assert_eq!(cfg.bind, "127.0.0.1");
        assert_eq!(cfg.runtime.replay_buffer_bytes, 256 * 1024);
        assert!(cfg.runtime.git.enabled);
        assert_eq!(cfg.runtime.git.quiet_window, Duration::from_millis(350));
        assert!(cfg.profiles.is_empty());
    }

    #[test]
    fn sections_and_profiles_parse() {
        let file = parse(
            r#"
            [server]
            port = 9000
            data_dir = "/var/lib/webterm"

            [runtime]
            replay_buffer_bytes = 1024
            terminate_grace_ms = 500
            default_cwd = "/srv"

            [git]
            enabled = false

            [[profiles]]
            id = "py"
            name = "Python"
            command = "python3"
            args = ["-q"]
            passthrough = true
            env = { PYTHONUNBUFFERED = "1" }
            "#,
        )
        .unwrap();
        let cfg = ServerConfig::resolve(file, &CliOverrides::default()).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/webterm"));
        assert_eq!(cfg.sessions_dir(), PathBuf::from("/var/lib/webterm/sessions"));
        assert_eq!(cfg.runtime.terminate_grace, Duration::from_millis(500));
        assert_eq!(cfg.default_cwd, PathBuf::from("/srv"));
        assert!(!cfg.runtime.git.enabled);
        assert_eq!(cfg.profiles.len(), 1);
        assert_eq!(cfg.profiles[0].args, vec!["-q"]);
        assert!(cfg.profiles[0].passthrough);
        assert_eq!(cfg.profiles[0].env["PYTHONUNBUFFERED"], "1");
    }

    #[test]
    fn cli_overrides_win() {
        let file = parse("[server]\nport = 9000\nmax_sessions = 3\n").unwrap();
        let cli = CliOverrides {
            port: Some(9100),
            max_sessions: Some(7),
            default_cwd: Some("/tmp".into()),
            disable_git: true,
            ..CliOverrides::default()
        };
        let cfg = ServerConfig::resolve(file, &cli).unwrap();
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.max_sessions, 7);
        assert_eq!(cfg.default_cwd, PathBuf::from("/tmp"));
        assert!(!cfg.runtime.git.enabled);
    }

    #[test]
    fn duplicate_profile_ids_are_rejected() {
        let file = parse(
            "[[profiles]]\nid = \"a\"\ncommand = \"sh\"\n[[profiles]]\nid = \"a\"\ncommand = \"bash\"\n",
        )
        .unwrap();
        assert!(ServerConfig::resolve(file, &CliOverrides::default()).is_err());
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(parse("[server\nport = ").is_err());
    }

    #[test]
    fn tilde_expands_to_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde_str("~/x/y"), home.join("x/y"));
        }
        assert_eq!(expand_tilde_str("/abs"), PathBuf::from("/abs"));
    }
}

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sandbox::{Bind, EnvironmentSpec};

pub const CONFIG_FILE: &str = "poolrun.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the task executables (required for `run`)
    #[serde(default)]
    pub binary_dir: Option<PathBuf>,

    /// Directories with runtime libraries the executables need
    #[serde(default)]
    pub lib_dirs: Vec<PathBuf>,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub simulator: SimulatorConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// Environment the task executables run in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Docker image to use
    #[serde(default = "default_runtime_image")]
    pub image: String,

    /// Extra environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Additional volume mounts
    #[serde(default)]
    pub mounts: Vec<Mount>,

    /// Shared memory size (e.g., "8g")
    #[serde(default)]
    pub shm_size: Option<String>,

    /// Memory limit (e.g., "16g")
    #[serde(default)]
    pub memory: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            image: default_runtime_image(),
            env: BTreeMap::new(),
            mounts: Vec::new(),
            shm_size: None,
            memory: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub host: String,
    /// Defaults to the host path
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default = "default_true")]
    pub readonly: bool,
}

/// Companion environment for the paired mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    #[serde(default = "default_simulator_image")]
    pub image: String,

    /// Command that starts the simulator (shell words)
    #[serde(default = "default_simulator_command")]
    pub command: String,

    /// TCP port the simulator listens on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Command that exits 0 once the simulator accepts connections
    /// - Default: look for a listener on `port` in /proc/net/tcp
    #[serde(default)]
    pub readiness_probe: Option<String>,

    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            image: default_simulator_image(),
            command: default_simulator_command(),
            port: default_port(),
            readiness_probe: None,
            readiness_timeout_secs: default_readiness_timeout(),
        }
    }
}

/// How tasks are scheduled onto environments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// All tasks share one environment
    #[default]
    Shared,
    /// Every task gets its own runtime/simulator pair
    Paired,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shared => write!(f, "shared"),
            Self::Paired => write!(f, "paired"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub mode: Mode,

    /// Concurrent tasks in shared mode
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Pairs alive at once in paired mode
    #[serde(default = "default_max_pairs")]
    pub max_pairs: usize,

    /// Per-task timeout; 0 disables it
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,

    /// Environment variables for every task command
    #[serde(default)]
    pub task_env: BTreeMap<String, String>,

    /// Extension of the artifact a task may produce
    #[serde(default = "default_artifact_extension")]
    pub artifact_extension: String,

    /// Where artifacts are collected in shared mode
    #[serde(default)]
    pub artifact_dir: Option<PathBuf>,

    /// Lines of failing output shown per task
    #[serde(default = "default_output_line_budget")]
    pub output_line_budget: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            max_workers: default_max_workers(),
            max_pairs: default_max_pairs(),
            default_timeout_secs: default_timeout(),
            task_env: BTreeMap::new(),
            artifact_extension: default_artifact_extension(),
            artifact_dir: None,
            output_line_budget: default_output_line_budget(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_runtime_image() -> String {
    "poolrun-runtime:latest".to_string()
}

fn default_simulator_image() -> String {
    "poolrun-simulator:latest".to_string()
}

fn default_simulator_command() -> String {
    "simulator --socket tcp".to_string()
}

fn default_port() -> u16 {
    4321
}

fn default_readiness_timeout() -> u64 {
    120
}

fn default_max_workers() -> usize {
    8
}

fn default_max_pairs() -> usize {
    4
}

fn default_timeout() -> u64 {
    600
}

fn default_artifact_extension() -> String {
    "aub".to_string()
}

fn default_output_line_budget() -> usize {
    40
}

impl Config {
    /// Load configuration from file, using defaults if not found
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        Ok(config)
    }

    pub fn binary_dir(&self) -> Result<&Path> {
        match &self.binary_dir {
            Some(dir) => Ok(dir),
            None => bail!("binary_dir is not set in {CONFIG_FILE}"),
        }
    }

    /// Makes `binary_dir` and every `lib_dirs` entry absolute.
    ///
    /// Relative paths are taken from `base`, `~` is expanded and symlinks are
    /// resolved. Both directories must exist.
    pub fn resolve_paths(&mut self, base: &Path) -> Result<()> {
        let binary_dir = self.binary_dir()?.to_path_buf();
        let resolved = absolute_dir(&binary_dir, base)
            .with_context(|| format!("Binary directory not found: {}", binary_dir.display()))?;
        self.binary_dir = Some(resolved);

        self.lib_dirs = self
            .lib_dirs
            .iter()
            .map(|dir| {
                absolute_dir(dir, base)
                    .with_context(|| format!("Library directory not found: {}", dir.display()))
            })
            .collect::<Result<_>>()?;
        Ok(())
    }

    /// Library search variable built from `lib_dirs`.
    pub fn library_env(&self) -> Option<(String, String)> {
        if self.lib_dirs.is_empty() {
            return None;
        }
        let (key, separator) = if cfg!(windows) {
            ("PATH", ";")
        } else {
            ("LD_LIBRARY_PATH", ":")
        };
        let value = self
            .lib_dirs
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(separator);
        Some((key.to_string(), value))
    }

    /// The runtime environment: binary and library directories mounted at
    /// their host paths, plus the configured mounts and limits.
    pub fn runtime_spec(&self) -> Result<EnvironmentSpec> {
        let binary_dir = self.binary_dir()?;

        let mut binds = vec![Bind::same_path(binary_dir)];
        binds.extend(self.lib_dirs.iter().map(Bind::same_path));
        for mount in &self.runtime.mounts {
            let host = expand_path(&mount.host)?;
            let container = match &mount.container {
                Some(container) => expand_path(container)?,
                None => host.clone(),
            };
            binds.push(Bind {
                host,
                container,
                readonly: mount.readonly,
            });
        }

        let mut env = self.runtime.env.clone();
        if let Some((key, value)) = self.library_env() {
            env.insert(key, value);
        }

        Ok(EnvironmentSpec {
            role: "runtime".to_string(),
            image: self.runtime.image.clone(),
            binds,
            env,
            shm_size: self
                .runtime
                .shm_size
                .as_deref()
                .map(parse_memory_limit)
                .transpose()?,
            memory: self
                .runtime
                .memory
                .as_deref()
                .map(parse_memory_limit)
                .transpose()?,
            ..Default::default()
        })
    }

    pub fn simulator_spec(&self) -> EnvironmentSpec {
        EnvironmentSpec {
            role: "simulator".to_string(),
            image: self.simulator.image.clone(),
            ..Default::default()
        }
    }

    pub fn simulator_command(&self) -> Result<Vec<String>> {
        let words = shell_words::split(&self.simulator.command)
            .context("Invalid simulator command")?;
        if words.is_empty() {
            bail!("simulator.command is empty");
        }
        Ok(words)
    }

    /// Probe that succeeds once the simulator port is listening.
    pub fn readiness_probe(&self) -> Result<Vec<String>> {
        match &self.simulator.readiness_probe {
            Some(probe) => shell_words::split(probe).context("Invalid readiness probe"),
            None => Ok(vec![
                "sh".to_string(),
                "-c".to_string(),
                format!(
                    "grep -q '00000000:{:04X}' /proc/net/tcp",
                    self.simulator.port
                ),
            ]),
        }
    }

    /// `None` when timeouts are disabled.
    pub fn default_timeout(&self) -> Option<Duration> {
        match self.execution.default_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Expand `~/` to the home directory
fn expand_path(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir().context("Could not determine home directory")?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

fn absolute_dir(path: &Path, base: &Path) -> Result<PathBuf> {
    let path = match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .context("Could not determine home directory")?
            .join(rest),
        Err(_) => base.join(path),
    };
    let resolved = fs::canonicalize(&path)?;
    if !resolved.is_dir() {
        bail!("{} is not a directory", resolved.display());
    }
    Ok(resolved)
}

/// Parse size string (e.g., "8g", "512m") to bytes
fn parse_memory_limit(limit: &str) -> Result<i64> {
    let limit = limit.to_lowercase();

    if let Some(num) = limit.strip_suffix('g') {
        let gigs: i64 = num.parse().context("Invalid memory limit")?;
        Ok(gigs * 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        let megs: i64 = num.parse().context("Invalid memory limit")?;
        Ok(megs * 1024 * 1024)
    } else {
        limit.parse().context("Invalid memory limit")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.execution.mode, Mode::Shared);
        assert_eq!(config.execution.max_workers, 8);
        assert_eq!(config.execution.max_pairs, 4);
        assert_eq!(config.simulator.port, 4321);
        assert_eq!(config.default_timeout(), Some(Duration::from_secs(600)));
        assert!(config.binary_dir().is_err());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
binary_dir = "/opt/tests/bin"
lib_dirs = ["/opt/level-zero/lib", "/opt/neo/lib"]

[runtime]
image = "runtime:gen12"
shm_size = "8g"

[runtime.env]
ProductFamilyOverride = "tgllp"

[[runtime.mounts]]
host = "/data/kernels"
readonly = true

[simulator]
image = "simulator:gen12"
command = "AubLoad -device tgllp -socket tcp"

[execution]
mode = "paired"
max_pairs = 2
default_timeout_secs = 0

[execution.task_env]
SetCommandStreamReceiver = "2"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.execution.mode, Mode::Paired);
        assert_eq!(config.execution.max_pairs, 2);
        assert_eq!(config.default_timeout(), None);
        assert_eq!(
            config.simulator_command().unwrap(),
            vec!["AubLoad", "-device", "tgllp", "-socket", "tcp"]
        );
        assert_eq!(config.execution.task_env["SetCommandStreamReceiver"], "2");
    }

    #[test]
    fn test_runtime_spec_mounts_binaries_and_libraries() {
        let config: Config = toml::from_str(
            r#"
binary_dir = "/opt/tests/bin"
lib_dirs = ["/opt/a/lib", "/opt/b/lib"]

[runtime]
shm_size = "512m"

[runtime.env]
ProductFamilyOverride = "tgllp"

[[runtime.mounts]]
host = "/data"
container = "/mnt/data"
"#,
        )
        .unwrap();

        let spec = config.runtime_spec().unwrap();
        assert_eq!(spec.role, "runtime");
        assert_eq!(spec.binds[0], Bind::same_path("/opt/tests/bin"));
        assert_eq!(spec.binds[1], Bind::same_path("/opt/a/lib"));
        assert_eq!(
            spec.binds[3],
            Bind {
                host: PathBuf::from("/data"),
                container: PathBuf::from("/mnt/data"),
                readonly: true,
            }
        );
        assert_eq!(spec.shm_size, Some(512 * 1024 * 1024));
        assert_eq!(spec.memory, None);
        assert_eq!(spec.env["ProductFamilyOverride"], "tgllp");
        if cfg!(not(windows)) {
            assert_eq!(spec.env["LD_LIBRARY_PATH"], "/opt/a/lib:/opt/b/lib");
        }
    }

    #[test]
    fn test_default_readiness_probe_uses_port_in_hex() {
        let config = Config::default();
        let probe = config.readiness_probe().unwrap();
        assert_eq!(probe[2], "grep -q '00000000:10E1' /proc/net/tcp");
    }

    #[test]
    fn test_custom_readiness_probe() {
        let mut config = Config::default();
        config.simulator.readiness_probe = Some("nc -z localhost 4321".to_string());
        assert_eq!(
            config.readiness_probe().unwrap(),
            vec!["nc", "-z", "localhost", "4321"]
        );
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert!(config.binary_dir.is_none());
    }

    #[test]
    fn test_load_rejects_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "binary_dir = [").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_resolve_paths_makes_directories_absolute() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::create_dir_all(dir.path().join("lib")).unwrap();

        let mut config: Config =
            toml::from_str("binary_dir = \"bin\"\nlib_dirs = [\"./lib\"]\n").unwrap();
        config.resolve_paths(dir.path()).unwrap();

        let base = dir.path().canonicalize().unwrap();
        assert_eq!(config.binary_dir().unwrap(), base.join("bin"));
        assert_eq!(config.lib_dirs, vec![base.join("lib")]);

        let spec = config.runtime_spec().unwrap();
        assert_eq!(spec.binds[0], Bind::same_path(base.join("bin")));
        assert!(spec.binds.iter().all(|bind| bind.host.is_absolute()));
    }

    #[test]
    fn test_resolve_paths_rejects_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::write(dir.path().join("file"), "").unwrap();

        let mut config: Config = toml::from_str("binary_dir = \"missing\"\n").unwrap();
        let err = config.resolve_paths(dir.path()).unwrap_err();
        assert!(err.to_string().contains("Binary directory not found"));

        let mut config: Config = toml::from_str("binary_dir = \"file\"\n").unwrap();
        assert!(config.resolve_paths(dir.path()).is_err());

        let mut config: Config =
            toml::from_str("binary_dir = \"bin\"\nlib_dirs = [\"nolib\"]\n").unwrap();
        let err = config.resolve_paths(dir.path()).unwrap_err();
        assert!(err.to_string().contains("Library directory not found"));
    }

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("8g").unwrap(), 8 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1G").unwrap(), 1024 * 1024 * 1024);
        assert!(parse_memory_limit("lots").is_err());
    }

    #[test]
    fn test_expand_path() {
        assert_eq!(expand_path("/usr/bin").unwrap(), PathBuf::from("/usr/bin"));

        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_path("~/.ssh").unwrap(), home.join(".ssh"));
        }
    }
}

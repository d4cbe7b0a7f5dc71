use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fabric_identity::WorkspaceIdentity;
use serde::{Deserialize, Serialize};

/// Port the in-sandbox terminal server listens on.
pub const DEFAULT_PTY_PORT: u16 = 39383;
/// Port the in-sandbox editor listens on.
pub const DEFAULT_WORKSPACE_PORT: u16 = 39378;
/// Port the in-sandbox worker listens on.
pub const DEFAULT_WORKER_PORT: u16 = 39377;
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(60);
/// Shortest exec deadline; coreutils `timeout` treats `0s` as no limit.
pub const MIN_EXEC_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    LocalContainer,
    Vm,
    Template,
    Daemon,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::LocalContainer => "local-container",
            ProviderKind::Vm => "vm",
            ProviderKind::Template => "template",
            ProviderKind::Daemon => "daemon",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "local-container" | "docker" => Ok(ProviderKind::LocalContainer),
            "vm" => Ok(ProviderKind::Vm),
            "template" => Ok(ProviderKind::Template),
            "daemon" => Ok(ProviderKind::Daemon),
            other => Err(format!("unknown provider '{other}'")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxStatus::Starting => "starting",
            SandboxStatus::Running => "running",
            SandboxStatus::Stopping => "stopping",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposedPort {
    pub name: String,
    pub target_port: u16,
    pub public_url: String,
}

/// What a caller needs to reach a started sandbox.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub url: String,
    pub workspace_url: String,
    pub instance_id: String,
    pub task_run_id: Option<String>,
    pub provider: ProviderKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SandboxInstance {
    pub id: String,
    pub provider: ProviderKind,
    pub status: SandboxStatus,
    pub network_identity: Option<WorkspaceIdentity>,
    pub exposed_ports: Vec<ExposedPort>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecOptions {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default, with = "duration_secs")]
    pub timeout: Option<Duration>,
}

impl ExecOptions {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// Run `script` through `/bin/sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("/bin/sh").args(["-c".to_string(), script.into()])
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push(EnvVar::new(key, value));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The requested timeout, never below [`MIN_EXEC_TIMEOUT`].
    pub fn effective_timeout(&self) -> Duration {
        self.timeout
            .unwrap_or(DEFAULT_EXEC_TIMEOUT)
            .max(MIN_EXEC_TIMEOUT)
    }

    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.command.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// The invocation as a single POSIX shell line, for transports that only take strings.
    pub fn to_shell_line(&self) -> String {
        let mut line = String::new();
        if let Some(cwd) = &self.cwd {
            line.push_str("cd ");
            line.push_str(&shell_quote(cwd));
            line.push_str(" && ");
        }
        if !self.env.is_empty() {
            line.push_str("env");
            for var in &self.env {
                line.push(' ');
                line.push_str(&shell_quote(&format!("{}={}", var.key, var.value)));
            }
            line.push(' ');
        }
        let argv: Vec<String> = self.argv().iter().map(|a| shell_quote(a)).collect();
        line.push_str(&argv.join(" "));
        line
    }
}

/// Single-quote a word for POSIX shells.
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A file written into the sandbox before a terminal starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthFile {
    pub path: String,
    pub contents: Vec<u8>,
    pub mode: u32,
}

impl AuthFile {
    pub fn new(path: impl Into<String>, contents: impl Into<Vec<u8>>, mode: u32) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
            mode,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TerminalOptions {
    pub terminal_id: Option<String>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub env: Vec<EnvVar>,
    pub auth_files: Vec<AuthFile>,
    pub startup_commands: Vec<String>,
}

impl Default for TerminalOptions {
    fn default() -> Self {
        Self {
            terminal_id: None,
            command: None,
            args: Vec::new(),
            cwd: None,
            cols: 80,
            rows: 24,
            env: Vec::new(),
            auth_files: Vec::new(),
            startup_commands: Vec::new(),
        }
    }
}

/// A session created on the sandbox's terminal server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSession {
    pub id: String,
    pub pid: Option<u32>,
    pub ws_url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub running: bool,
    pub info: Option<SandboxInfo>,
}

impl StatusReport {
    pub fn not_running() -> Self {
        Self {
            running: false,
            info: None,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(d)?;
        Ok(secs
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(Duration::from_secs_f64))
    }
}

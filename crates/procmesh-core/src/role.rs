//! Role definitions and per-instance command templating.

use crate::plan::MAX_INSTANCE_COUNT;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Builtin roles of the demo network.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinRole {
    /// Central message router every node connects to.
    Router,

    /// Offer/demand matcher service.
    Matcher,

    /// Vanity address service.
    Vanity,

    /// Attestation service.
    Attestation,

    /// Provider node (instance-indexed).
    Provider,

    /// Requestor node (instance-indexed).
    Requestor,
}

impl BuiltinRole {
    pub const ALL: [BuiltinRole; 6] = [
        BuiltinRole::Router,
        BuiltinRole::Matcher,
        BuiltinRole::Vanity,
        BuiltinRole::Attestation,
        BuiltinRole::Provider,
        BuiltinRole::Requestor,
    ];

    /// Get the role name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            BuiltinRole::Router => "router",
            BuiltinRole::Matcher => "matcher",
            BuiltinRole::Vanity => "vanity",
            BuiltinRole::Attestation => "attestation",
            BuiltinRole::Provider => "provider",
            BuiltinRole::Requestor => "requestor",
        }
    }

    /// Whether the role spawns N copies named `<role>-<index>`.
    pub fn indexed(&self) -> bool {
        matches!(self, BuiltinRole::Provider | BuiltinRole::Requestor)
    }

    /// Get the role's default command template.
    pub fn command(&self) -> Vec<String> {
        let parts: &[&str] = match self {
            BuiltinRole::Router => &["ya-sb-router", "-l", "tcp://127.0.0.1:{port}"],
            BuiltinRole::Matcher => &["offer-server", "--http-port", "{port}"],
            BuiltinRole::Vanity => &["vanity-server", "--port", "{port}"],
            BuiltinRole::Attestation => &["attestation-server", "--port", "{port}"],
            BuiltinRole::Provider => &["ya-provider", "--node-name", "{name}", "--index", "{index}"],
            BuiltinRole::Requestor => &["ya-requestor", "--node-name", "{name}", "--index", "{index}"],
        };
        parts.iter().map(|s| s.to_string()).collect()
    }

    /// Default base port for roles that listen.
    pub fn base_port(&self) -> Option<u16> {
        match self {
            BuiltinRole::Router => Some(7464),
            BuiltinRole::Matcher => Some(36200),
            BuiltinRole::Vanity => Some(36300),
            BuiltinRole::Attestation => Some(36400),
            _ => None,
        }
    }
}

/// Readiness probe for a role, rendered per instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeSpec {
    /// A TCP connect to `address` succeeds.
    Tcp { address: String },

    /// An HTTP GET to `url` returns a 2xx status.
    Http { url: String },

    /// A line of the instance's stdout log matches `pattern` (regex).
    LogLine { pattern: String },
}

impl ProbeSpec {
    fn render(&self, vars: &TemplateVars<'_>) -> ProbeSpec {
        match self {
            ProbeSpec::Tcp { address } => ProbeSpec::Tcp {
                address: vars.render(address),
            },
            ProbeSpec::Http { url } => ProbeSpec::Http {
                url: vars.render(url),
            },
            ProbeSpec::LogLine { pattern } => ProbeSpec::LogLine {
                pattern: pattern.clone(),
            },
        }
    }

    fn templates(&self) -> Vec<&str> {
        match self {
            ProbeSpec::Tcp { address } => vec![address.as_str()],
            ProbeSpec::Http { url } => vec![url.as_str()],
            ProbeSpec::LogLine { .. } => vec![],
        }
    }
}

/// A named category of process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleSpec {
    /// Role name; also the instance name of singletons.
    pub name: String,

    /// Executable + args template (first element is the executable).
    pub command: Vec<String>,

    /// Spawn N copies named `<role>-<index>` instead of one.
    #[serde(default)]
    pub indexed: bool,

    /// Default copy count for indexed roles when no N is supplied.
    #[serde(default)]
    pub instance_count: Option<i64>,

    /// Whether this role takes part in the run.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Extra environment variables (values are templates).
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory for the process.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// `{port}` renders as `base_port + index`.
    #[serde(default)]
    pub base_port: Option<u16>,

    #[serde(default)]
    pub readiness: Option<ProbeSpec>,
}

fn default_enabled() -> bool {
    true
}

impl RoleSpec {
    /// Create a role configuration from a builtin role.
    pub fn from_builtin(role: BuiltinRole) -> Self {
        Self {
            name: role.name().to_string(),
            command: role.command(),
            indexed: role.indexed(),
            instance_count: None,
            enabled: true,
            env: BTreeMap::new(),
            working_dir: None,
            base_port: role.base_port(),
            readiness: None,
        }
    }

    /// Create a custom singleton role.
    pub fn singleton(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command,
            indexed: false,
            instance_count: None,
            enabled: true,
            env: BTreeMap::new(),
            working_dir: None,
            base_port: None,
            readiness: None,
        }
    }

    /// Create a custom instance-indexed role.
    pub fn indexed(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            indexed: true,
            ..Self::singleton(name, command)
        }
    }

    /// Disable this role.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_readiness(mut self, probe: ProbeSpec) -> Self {
        self.readiness = Some(probe);
        self
    }

    pub fn with_base_port(mut self, port: u16) -> Self {
        self.base_port = Some(port);
        self
    }

    /// Instance name for the given index: `<role>-<index>` or `<role>`.
    pub fn instance_name(&self, index: u32) -> String {
        if self.indexed {
            format!("{}-{}", self.name, index)
        } else {
            self.name.clone()
        }
    }

    /// Instance names for a run sized for `count` instances.
    ///
    /// Empty when `count <= 0`; at most [`MAX_INSTANCE_COUNT`] names.
    pub fn instance_names(&self, count: i64) -> Vec<String> {
        if count <= 0 {
            return Vec::new();
        }
        if self.indexed {
            (0..count.min(MAX_INSTANCE_COUNT) as u32)
                .map(|i| self.instance_name(i))
                .collect()
        } else {
            vec![self.name.clone()]
        }
    }

    /// Every template string the role renders, for validation.
    pub fn templates(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.command.iter().map(|s| s.as_str()).collect();
        out.extend(self.env.values().map(|s| s.as_str()));
        if let Some(probe) = &self.readiness {
            out.extend(probe.templates());
        }
        out
    }

    /// Resolve a launchable instance for `index` in a run of `count`.
    pub fn instantiate(&self, index: u32, count: u32) -> InstanceSpec {
        let name = self.instance_name(index);
        let port = self.base_port.map(|p| p.saturating_add(index as u16));
        let vars = TemplateVars {
            role: &self.name,
            name: &name,
            index,
            count,
            port,
        };

        InstanceSpec {
            role: self.name.clone(),
            index: self.indexed.then_some(index),
            command: self.command.iter().map(|c| vars.render(c)).collect(),
            env: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), vars.render(v)))
                .collect(),
            working_dir: self.working_dir.clone(),
            readiness: self.readiness.as_ref().map(|p| p.render(&vars)),
            name,
        }
    }
}

/// Values substituted into `{role}`, `{name}`, `{index}`, `{count}` and `{port}`.
struct TemplateVars<'a> {
    role: &'a str,
    name: &'a str,
    index: u32,
    count: u32,
    port: Option<u16>,
}

impl TemplateVars<'_> {
    fn render(&self, template: &str) -> String {
        let mut out = template
            .replace("{role}", self.role)
            .replace("{name}", self.name)
            .replace("{index}", &self.index.to_string())
            .replace("{count}", &self.count.to_string());
        if let Some(port) = self.port {
            out = out.replace("{port}", &port.to_string());
        }
        out
    }
}

/// One concrete process to launch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceSpec {
    pub role: String,

    /// `None` for singleton roles.
    pub index: Option<u32>,

    /// `<role>-<index>` or `<role>`.
    pub name: String,

    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub readiness: Option<ProbeSpec>,
}

// System
use std::fmt;
use std::str::FromStr;

// Local
use crate::error::ConfigError;

/// Which namespaces a subscription covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NamespaceScope {
    Namespace(String),
    AllNamespaces,
}

impl NamespaceScope {
    /// Absent and empty names both mean every namespace.
    pub fn from_optional(namespace: Option<String>) -> Self {
        match namespace {
            Some(ns) if !ns.trim().is_empty() => NamespaceScope::Namespace(ns),
            _ => NamespaceScope::AllNamespaces,
        }
    }
}

impl fmt::Display for NamespaceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamespaceScope::Namespace(ns) => write!(f, "namespace {}", ns),
            NamespaceScope::AllNamespaces => write!(f, "all namespaces"),
        }
    }
}

/// The resource collection being watched. Fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchTarget {
    /// Either `version` for the core group or `group/version`.
    pub api_version: String,
    pub kind: String,
    pub scope: NamespaceScope,
}

impl WatchTarget {
    pub fn new(api_version: &str, kind: &str, scope: NamespaceScope) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            scope,
        }
    }

    /// Splits `api_version` into `(group, version)`. The core group is the empty string.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version.as_str()),
        }
    }
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} in {}", self.api_version, self.kind, self.scope)
    }
}

/// Options passed to every (re)opened stream subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchOptions {
    pub timeout_seconds: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Added,
    Modified,
    Deleted,
    Unknown,
}

impl Action {
    /// Upper-case wire name, as the API server spells the watch event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Added => "ADDED",
            Action::Modified => "MODIFIED",
            Action::Deleted => "DELETED",
            Action::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a change notification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventOrigin {
    Stream,
    Mirror,
}

/// A single change to a watched resource. `namespace` is `None` for cluster scoped kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeEvent {
    pub action: Action,
    pub namespace: Option<String>,
    pub name: String,
}

impl ChangeEvent {
    pub fn new(action: Action, namespace: Option<&str>, name: &str) -> Self {
        Self {
            action,
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }
}

/// Why a stream subscription ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosureCause {
    /// True for an expired watch or a stale resource version (410 Gone).
    pub recoverable: bool,
    pub message: String,
}

impl ClosureCause {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            recoverable: true,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            recoverable: false,
            message: message.into(),
        }
    }
}

/// Lifecycle of a [`WatchSession`](crate::watcher::WatchSession).
///
/// `Idle` is also the resting state between a recoverable closure and the retry that follows it.
/// `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Closing,
    Terminated,
}

/// Which subscription styles the supervisor runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    #[default]
    StreamOnly,
    MirrorOnly,
    Both,
}

impl Mode {
    pub fn runs_stream(&self) -> bool {
        matches!(self, Mode::StreamOnly | Mode::Both)
    }

    pub fn runs_mirror(&self) -> bool {
        matches!(self, Mode::MirrorOnly | Mode::Both)
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "watch" => Ok(Mode::StreamOnly),
            "inform" => Ok(Mode::MirrorOnly),
            "all" => Ok(Mode::Both),
            other => Err(ConfigError::InvalidMode(other.to_string())),
        }
    }
}

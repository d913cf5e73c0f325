//! Agent configuration: connection settings and per-computation defaults.
//!
//! Settings load from an optional TOML file and are overridden by command
//! line flags in the binaries. The split mirrors the two consumers: the
//! agent shell reads [`NodeOptions`] while the session layer passes
//! [`ComputationDefaults`] down to every spawned computation.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::{NodeError, Result};

fn default_coordinator_port() -> u16 {
    8087
}

fn default_consul_port() -> u16 {
    8500
}

fn default_environment() -> String {
    "prod".into()
}

fn default_datacenter() -> String {
    "gld".into()
}

fn default_ipc_dir() -> String {
    "/tmp".into()
}

fn default_http_threads() -> usize {
    8
}

fn default_ban_threshold() -> u32 {
    5
}

fn default_ban_window_secs() -> u64 {
    300
}

/// Connection and service settings for the agent process.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", default)]
pub struct NodeOptions {
    /// Fixed node id; empty means generate a fresh one at startup.
    pub node_id: String,
    /// Coordinator host; empty means look it up via service discovery.
    pub coordinator_host: String,
    pub coordinator_port: u16,
    /// Extra path under the coordinator base URL.
    pub coordinator_endpoint: String,
    /// Consul host; empty means look it up via the config service.
    pub consul_host: String,
    pub consul_port: u16,
    /// Disable service discovery entirely (requires coordinator_host).
    pub no_consul: bool,
    /// Config service base URL used to locate Consul.
    pub config_service_url: String,
    /// Environment to join when resolving services.
    pub environment: String,
    /// Datacenter for the environment.
    pub datacenter: String,
    /// Directory holding the router IPC socket file.
    pub ipc_dir: String,
    /// HTTP listen port; 0 means the OS picks.
    pub http_port: u16,
    /// Worker threads for the HTTP server runtime.
    pub num_http_threads: usize,
    /// Disable the unknown-endpoint ban list.
    pub disable_banlist: bool,
    /// Unknown GETs within the window before a source is refused.
    pub ban_threshold: u32,
    /// Sliding ban window in seconds.
    pub ban_window_secs: u64,
    /// Memory reserved for the node processes, e.g. "1g". Empty means 1 GiB.
    pub max_node_memory: String,
    /// Total memory available to computations, e.g. "48g". Empty means all
    /// remaining physical memory.
    pub memory: String,
    /// Cores available to computations; 0 means all but one.
    pub cores: u32,
    /// Raise the file-descriptor soft limit to the hard limit at startup.
    pub set_max_fds: bool,
    /// Registration tags.
    pub exclusive_user: String,
    pub exclusive_production: String,
    pub exclusive_team: String,
    pub over_subscribe: bool,
    /// User name advertised at registration; empty falls back to "unknown".
    pub user_name: String,
    /// Cloud preemption monitor: "", "aws" or "azure".
    pub preemption_monitor: String,
    /// Program name for the router child process.
    pub router_program: String,
    /// Delay before session/computation DELETEs to the coordinator, in
    /// milliseconds. Works around a create/delete race in the coordinator.
    pub pre_delete_delay_ms: u64,
    /// Retries for deregistration against an unreachable coordinator.
    pub deregister_retries: u32,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            coordinator_host: String::new(),
            coordinator_port: default_coordinator_port(),
            coordinator_endpoint: String::new(),
            consul_host: String::new(),
            consul_port: default_consul_port(),
            no_consul: false,
            config_service_url: String::new(),
            environment: default_environment(),
            datacenter: default_datacenter(),
            ipc_dir: default_ipc_dir(),
            http_port: 0,
            num_http_threads: default_http_threads(),
            disable_banlist: false,
            ban_threshold: default_ban_threshold(),
            ban_window_secs: default_ban_window_secs(),
            max_node_memory: String::new(),
            memory: String::new(),
            cores: 0,
            set_max_fds: true,
            exclusive_user: String::new(),
            exclusive_production: String::new(),
            exclusive_team: String::new(),
            over_subscribe: false,
            user_name: String::new(),
            preemption_monitor: String::new(),
            router_program: "arras-node-router".into(),
            pre_delete_delay_ms: 50,
            deregister_retries: 3,
        }
    }
}

/// Defaults applied to every computation spawned on this host.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", default)]
pub struct ComputationDefaults {
    /// Log level [0-5] passed to computations and used by the agent.
    pub log_level: i32,
    /// Athena stats/log sink settings, exported to computations.
    pub athena_env: String,
    pub athena_host: String,
    pub athena_port: u16,
    /// Crash dump directory exported to computations.
    pub breakpad_path: String,
    /// Full path of the router IPC socket. Filled in at startup.
    pub ipc_name: String,
    /// Default resources when the definition omits them.
    pub def_memory_mb: u64,
    pub def_cores: f64,
    /// Message chunking defaults.
    pub def_disable_chunking: bool,
    pub def_min_chunking_size: u64,
    pub def_chunk_size: u64,
    /// Packaging system assumed when a definition names none.
    pub def_packaging_system: String,
    /// Override for the rez package path, replacing both the default path
    /// and any prefix in the session definition.
    pub package_path_override: String,
    /// Create a cgroup for each computation.
    pub use_cgroups: bool,
    /// Prevent computations from exceeding their memory allocation.
    pub enforce_memory: bool,
    /// Allow computations to use unallocated memory when available.
    pub loan_memory: bool,
    /// Prevent computations from exceeding their cpu allocation.
    pub enforce_cores: bool,
    /// Kill the whole process group when terminating a computation.
    pub cleanup_process_group: bool,
    /// Time allowed for a client to connect before an entry-node session
    /// expires, in seconds.
    pub client_connection_timeout_secs: u64,
}

impl Default for ComputationDefaults {
    fn default() -> Self {
        Self {
            log_level: 3,
            athena_env: "prod".into(),
            athena_host: "localhost".into(),
            athena_port: 514,
            breakpad_path: String::new(),
            ipc_name: String::new(),
            def_memory_mb: 2048,
            def_cores: 1.0,
            def_disable_chunking: false,
            def_min_chunking_size: 1 << 20,
            def_chunk_size: 1 << 19,
            def_packaging_system: "rez1".into(),
            package_path_override: String::new(),
            use_cgroups: false,
            enforce_memory: false,
            loan_memory: false,
            enforce_cores: false,
            cleanup_process_group: true,
            client_connection_timeout_secs: 30,
        }
    }
}

/// Top-level configuration file contents.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", default)]
pub struct Config {
    pub node: NodeOptions,
    pub computation: ComputationDefaults,
}

impl Config {
    /// Load configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::Config` when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| NodeError::Config(format!("cannot read {}: {err}", path.display())))?;
        let config: Self = toml::from_str(&raw)?;
        Ok(config)
    }

    /// Load from `path` when it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Parse a memory size string with an optional k/m/g suffix into bytes.
///
/// Returns 0 for the empty string.
///
/// # Errors
///
/// Returns `NodeError::Config` for unparseable input.
pub fn memory_from_string(s: &str) -> Result<u64> {
    if s.is_empty() {
        return Ok(0);
    }
    let (digits, shift) = match s.as_bytes()[s.len() - 1] {
        b'k' | b'K' => (&s[..s.len() - 1], 10),
        b'm' | b'M' => (&s[..s.len() - 1], 20),
        b'g' | b'G' => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    let n: u64 = digits
        .trim()
        .parse()
        .map_err(|_| NodeError::Config(format!("invalid memory size '{s}'")))?;
    Ok(n << shift)
}

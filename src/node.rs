//! The agent process: host resources, registration, and lifecycle.
//!
//! Initialization order matters: resources are sized first, then the
//! router child is launched and its control channel connected (the
//! router's message port is needed for registration), then the HTTP
//! control plane comes up, and only then does the node register with
//! service discovery and the coordinator. Shutdown runs the same steps
//! backwards: sessions down, events drained, deregister, router down.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{memory_from_string, ComputationDefaults, NodeOptions};
use crate::discovery::DiscoveryClient;
use crate::http::{
    self, spawn_event_worker, BanList, EventQueue, EventSenderConfig, HttpState,
};
use crate::preemption::{self, PreemptionMonitorType};
use crate::session::{RouterController, Sessions};
use crate::supervisor::ProcessManager;
use crate::{NodeError, Result};

/// Attempts to connect to the freshly launched router.
const ROUTER_CONNECT_RETRIES: u32 = 10;

/// Attempts to learn the coordinator endpoint from discovery.
const GET_COORDINATOR_RETRIES: u32 = 10;

/// How long shutdown waits for queued events to reach the coordinator.
const DRAIN_EVENTS_TIMEOUT: Duration = Duration::from_secs(1);

/// Required mode of the router IPC socket file.
const IPC_PERMS: u32 = 0o700;

/// The per-host agent.
pub struct ArrasNode {
    options: NodeOptions,
    defaults: ComputationDefaults,
    node_id: Uuid,
    hostname: String,
    host_ip: String,
    coordinator_url: String,
    consul_url: String,
    computations_cores: u32,
    computations_memory_mb: u64,
    node_info: Mutex<Value>,
    node_info_updating: AtomicBool,
    is_registered: AtomicBool,
    http_port: AtomicU16,
    events: Arc<EventQueue>,
    sessions: OnceLock<Arc<Sessions>>,
    router_child: Mutex<Option<tokio::process::Child>>,
    stop: CancellationToken,
}

impl ArrasNode {
    /// Bring the node up: resources, router, sessions, HTTP,
    /// registration.
    ///
    /// # Errors
    ///
    /// Any failure here is fatal for the agent; the binary exits nonzero.
    pub async fn initialize(
        options: NodeOptions,
        mut defaults: ComputationDefaults,
    ) -> Result<Arc<Self>> {
        let node_id = if options.node_id.is_empty() {
            Uuid::new_v4()
        } else {
            Uuid::parse_str(&options.node_id).map_err(|_| {
                NodeError::Config(format!("node_id argument is invalid: {}", options.node_id))
            })?
        };
        info!(node_id = %node_id, "initializing node");

        let (computations_memory_mb, computations_cores) = calc_resources(&options)?;
        let process_manager = Arc::new(ProcessManager::new(
            computations_memory_mb,
            defaults.use_cgroups,
            defaults.enforce_memory,
            defaults.enforce_cores,
            defaults.loan_memory,
        ));

        if options.set_max_fds {
            set_max_fds()?;
        }

        let hostname = fetch_hostname();
        let host_ip = fetch_host_ip(&hostname).await;
        info!(ip = %host_ip, host = %hostname, "node address");

        let (consul_url, coordinator_url) = find_services(&options).await?;
        info!(url = %coordinator_url, "node using coordinator");

        // IPC socket for the router and for every spawned computation
        defaults.ipc_name = format!("{}/arrasnodeipc-{node_id}", options.ipc_dir);

        let stop = CancellationToken::new();
        let events = EventQueue::new();

        let router_child = launch_router(&options, &defaults, node_id).await?;
        // the control channel outlives the stop token: session teardown
        // still talks to the router after shutdown begins
        let controller =
            connect_router(node_id, &defaults, Arc::clone(&events), CancellationToken::new())
                .await?;
        let router_port = controller.router_port();
        info!(port = router_port, "router is up");

        let sessions = Sessions::new(
            node_id,
            defaults.clone(),
            process_manager,
            controller,
            Arc::clone(&events),
        );

        let node = Arc::new(Self {
            options,
            defaults,
            node_id,
            hostname,
            host_ip,
            coordinator_url,
            consul_url,
            computations_cores,
            computations_memory_mb,
            node_info: Mutex::new(Value::Null),
            node_info_updating: AtomicBool::new(false),
            is_registered: AtomicBool::new(false),
            http_port: AtomicU16::new(0),
            events,
            sessions: OnceLock::new(),
            router_child: Mutex::new(Some(router_child)),
            stop,
        });
        let _ = node.sessions.set(Arc::clone(&sessions));

        // HTTP control plane
        let ban_list = if node.options.disable_banlist {
            None
        } else {
            Some(Arc::new(BanList::new(
                node.options.ban_threshold,
                Duration::from_secs(node.options.ban_window_secs),
            )))
        };
        let http_state = Arc::new(HttpState {
            node: Arc::clone(&node),
            sessions,
            ban_list,
        });
        let (http_port, _server) = http::server::start(
            http_state,
            node.options.http_port,
            node.stop.child_token(),
        )
        .await?;
        node.http_port.store(http_port, Ordering::Release);

        // event fan-out to the coordinator
        spawn_event_worker(
            Arc::clone(&node.events),
            reqwest::Client::new(),
            EventSenderConfig {
                coordinator_url: node.coordinator_url.clone(),
                pre_delete_delay: Duration::from_millis(node.options.pre_delete_delay_ms),
            },
            node.stop.clone(),
        );

        node.build_node_info(router_port);
        node.register_node().await?;

        if let Some(kind) = PreemptionMonitorType::from_option(&node.options.preemption_monitor)?
        {
            preemption::start(kind, node.stop.clone(), node.stop.child_token());
        }

        Ok(node)
    }

    #[must_use]
    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    #[must_use]
    pub fn http_port(&self) -> u16 {
        self.http_port.load(Ordering::Acquire)
    }

    /// Token cancelled when the node should shut down.
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Request an orderly shutdown.
    pub fn stop_running(&self) {
        self.stop.cancel();
    }

    fn sessions(&self) -> &Arc<Sessions> {
        self.sessions.get().expect("sessions set at initialize")
    }

    /// Block until shutdown is requested, then tear everything down.
    pub async fn run(self: &Arc<Self>) {
        self.stop.cancelled().await;

        debug!("shutting down node");
        self.sessions().shutdown_all("node exiting").await;
        self.events.wait_until_empty(DRAIN_EVENTS_TIMEOUT).await;
        self.events.shutdown();
        self.deregister_node().await;
        self.sessions().controller().stop();
        self.stop_router().await;
    }

    async fn stop_router(&self) {
        let child = self
            .router_child
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(mut child) = child {
            // losing the control connection makes the router exit on its
            // own; the kill is a backstop
            match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(_) => debug!("router process exited"),
                Err(_) => {
                    warn!("router did not exit; killing");
                    let _ = child.kill().await;
                }
            }
        }
    }

    // ── Status, tags, health ────────────────────────────────────────────

    /// Handle a status transition from the control plane:
    /// `shutdown`, `close`, or `unregistered`.
    ///
    /// # Errors
    ///
    /// `NodeError::BadRequest` for a missing or unknown status value.
    pub fn set_status(&self, payload: &Value) -> Result<()> {
        let status = payload
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                NodeError::BadRequest("request body is missing 'status' field".into())
            })?;
        match status {
            "shutdown" => {
                info!("shutdown requested via control plane");
                self.stop_running();
                Ok(())
            }
            "close" => {
                info!("node closed to new sessions");
                self.sessions().set_closed(true);
                Ok(())
            }
            "unregistered" => {
                // the coordinator dropped us; just don't deregister again
                self.is_registered.store(false, Ordering::Release);
                Ok(())
            }
            other => Err(NodeError::BadRequest(format!(
                "unknown 'status' value: {other}"
            ))),
        }
    }

    /// Merge new tag values, validate, and push to discovery.
    ///
    /// # Errors
    ///
    /// `NodeError::BadRequest` for an invalid tag set,
    /// `NodeError::Conflict` while another tag update is running.
    pub fn update_tags(self: &Arc<Self>, tags: Value) -> Result<()> {
        if !tags.is_object() {
            return Err(NodeError::BadRequest(
                "invalid tag set (JSON object is required)".into(),
            ));
        }
        self.begin_tag_update(|current| {
            for (key, value) in tags.as_object().into_iter().flatten() {
                current[key.as_str()] = value.clone();
            }
        })
    }

    /// Remove tags by name, validate, and push to discovery.
    ///
    /// # Errors
    ///
    /// `NodeError::BadRequest` for an invalid tag list or a tag set left
    /// invalid by the removal, `NodeError::Conflict` while another tag
    /// update is running.
    pub fn delete_tags(self: &Arc<Self>, tags: Value) -> Result<()> {
        if !tags.is_array() {
            return Err(NodeError::BadRequest(
                "invalid tag list (JSON array is required)".into(),
            ));
        }
        self.begin_tag_update(|current| {
            if let Some(object) = current.as_object_mut() {
                for name in tags.as_array().into_iter().flatten() {
                    if let Some(name) = name.as_str() {
                        object.remove(name);
                    }
                }
            }
        })
    }

    fn begin_tag_update(self: &Arc<Self>, apply: impl FnOnce(&mut Value)) -> Result<()> {
        let updated_tags = {
            let node_info = self.lock_node_info();
            if self.node_info_updating.swap(true, Ordering::AcqRel) {
                return Err(NodeError::Conflict(
                    "cannot modify node tags, because service is busy with another update".into(),
                ));
            }
            let mut tags = node_info["tags"].clone();
            if tags.is_null() {
                tags = serde_json::json!({});
            }
            apply(&mut tags);
            tags
        };

        if let Err(err) = validate_tags(&updated_tags) {
            self.node_info_updating.store(false, Ordering::Release);
            return Err(err);
        }

        // push to discovery off the request path
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let info = {
                let mut node_info = node.lock_node_info();
                node_info["tags"] = updated_tags;
                node_info.clone()
            };
            if !node.options.no_consul {
                match DiscoveryClient::resolved(&node.consul_url).await {
                    Ok(client) => {
                        if !client.update_node_info(&info).await {
                            error!("error updating discovery with new tags");
                        }
                    }
                    Err(err) => error!(%err, "cannot reach discovery for tag update"),
                }
            }
            node.node_info_updating.store(false, Ordering::Release);
        });
        Ok(())
    }

    /// Verify this node can still do its job.
    ///
    /// # Errors
    ///
    /// `NodeError::Internal` naming the failed check: IPC socket file
    /// missing/wrong mode/not a socket, root partition at 98 %, or an
    /// unwritable tmp dir.
    pub fn check_health(&self) -> Result<()> {
        self.check_ipc_socket()?;
        check_disk()
    }

    fn check_ipc_socket(&self) -> Result<()> {
        use std::os::unix::fs::{FileTypeExt, PermissionsExt};
        let path = &self.defaults.ipc_name;
        let metadata = std::fs::metadata(path).map_err(|_| {
            NodeError::Internal(format!("IPC socket file {path} does not exist"))
        })?;
        if !metadata.file_type().is_socket() {
            return Err(NodeError::Internal(format!(
                "IPC socket file {path} exists, but is not a socket"
            )));
        }
        let mode = metadata.permissions().mode() & 0o777;
        if mode & IPC_PERMS != IPC_PERMS {
            return Err(NodeError::Internal(format!(
                "IPC socket file {path} exists, but permissions are {mode:o}: \
                 required permissions are {IPC_PERMS:o}"
            )));
        }
        Ok(())
    }

    // ── Registration ────────────────────────────────────────────────────

    fn build_node_info(&self, router_port: u16) {
        let http_port = self.http_port();
        let mut tags = serde_json::json!({});
        let user_name = if self.options.user_name.is_empty() {
            "unknown".to_owned()
        } else {
            self.options.user_name.clone()
        };
        if !self.options.exclusive_user.is_empty() {
            tags["exclusive_user"] = if self.options.exclusive_user == "_unspecified_" {
                Value::String(user_name.clone())
            } else {
                Value::String(self.options.exclusive_user.clone())
            };
        }
        if !self.options.exclusive_production.is_empty() {
            tags["exclusive_production"] =
                Value::String(self.options.exclusive_production.clone());
            if !self.options.exclusive_team.is_empty() {
                tags["exclusive_team"] = Value::String(self.options.exclusive_team.clone());
            }
        }
        if self.options.over_subscribe {
            tags["over_subscribe"] = Value::Bool(true);
            if self.options.exclusive_user.is_empty() {
                tags["exclusive_user"] = Value::String(user_name);
            }
        }

        let info = serde_json::json!({
            "id": self.node_id.to_string(),
            "hostname": self.hostname,
            "ipAddress": self.host_ip,
            "httpPort": http_port,
            "port": router_port,
            "status": "UP",
            "resources": {
                "cores": self.computations_cores,
                "memoryMB": self.computations_memory_mb,
                "cpuModelName": cpu_model_name(),
            },
            "interfaces": { "default": { "AF_INET": self.host_ip } },
            "tags": tags,
            "hrefs": {
                "sessions": format!("http://{}:{http_port}/sessions", self.host_ip),
            },
            // basic TCP client connections, no websockets
            "clientProtocols": 1,
            "version_info": rez_version_info(),
            "os_release": read_proc("/proc/sys/kernel/osrelease"),
            "os_version": read_proc("/proc/sys/kernel/version"),
        });
        *self.lock_node_info() = info;
    }

    async fn register_node(&self) -> Result<()> {
        let node_info = self.lock_node_info().clone();
        let http_port = self.http_port();

        let discovery = if self.options.no_consul {
            None
        } else {
            // pin a numeric address so deregistration later hits the same
            // discovery instance
            let client = DiscoveryClient::resolved(&self.consul_url).await?;
            let service_id = format!("node@{}:{http_port}", self.hostname);
            client
                .register_service(&service_id, "arras-node", &self.host_ip, http_port)
                .await?;
            let check_name = format!("node-health@{}:{http_port}", self.hostname);
            let health_url = format!("http://{}:{http_port}/node/1/health", self.host_ip);
            client
                .register_check(&check_name, &service_id, &health_url, 30)
                .await?;
            Some(client)
        };

        info!(node_id = %self.node_id, "registering node with coordinator");
        let url = format!("{}/nodes", self.coordinator_url);
        let response = reqwest::Client::new()
            .post(&url)
            .json(&node_info)
            .send()
            .await
            .map_err(|err| NodeError::Service(format!("node registration failed: {err}")))?;
        if !response.status().is_success() {
            error!(status = %response.status(),
                "node registration ('POST {url}') returned unacceptable status code");
            return Err(NodeError::Service("node registration failed".into()));
        }

        if let Some(client) = discovery {
            if !client.update_node_info(&node_info).await {
                return Err(NodeError::Service("node registration failed".into()));
            }
        }
        self.is_registered.store(true, Ordering::Release);
        Ok(())
    }

    async fn deregister_node(&self) {
        if !self.is_registered.swap(false, Ordering::AcqRel) {
            return;
        }
        info!(node_id = %self.node_id, "deregistering node");

        let url = format!("{}/nodes/{}", self.coordinator_url, self.node_id);
        let client = reqwest::Client::new();
        let mut delivered = false;
        for attempt in 0..self.options.deregister_retries.max(1) {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            match client.delete(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    delivered = true;
                    break;
                }
                Ok(response) => {
                    debug!(status = %response.status(), "coordinator refused deregistration");
                }
                Err(err) => {
                    debug!(%err, "coordinator unreachable for deregistration");
                }
            }
        }
        if !delivered {
            error!(node_id = %self.node_id, "failure while deregistering node");
        }

        if !self.options.no_consul {
            let http_port = self.http_port();
            match DiscoveryClient::resolved(&self.consul_url).await {
                Ok(discovery) => {
                    let check_name = format!("node-health@{}:{http_port}", self.hostname);
                    let service_id = format!("node@{}:{http_port}", self.hostname);
                    if let Err(err) = discovery.deregister_check(&check_name).await {
                        warn!(%err, "failed to deregister health check");
                    }
                    if let Err(err) = discovery.deregister_service(&service_id).await {
                        warn!(%err, "failed to deregister service");
                    }
                }
                Err(err) => warn!(%err, "cannot reach discovery for deregistration"),
            }
        }
    }

    fn lock_node_info(&self) -> std::sync::MutexGuard<'_, Value> {
        self.node_info
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// ── Initialization helpers ──────────────────────────────────────────────

/// Memory and cores available to computations.
///
/// A node reserve (default 1 GiB) comes off the top and is not enforced;
/// the router, not the agent, is the node-side memory consumer. Asking
/// for more computation memory than physically remains is a warning, not
/// an error.
fn calc_resources(options: &NodeOptions) -> Result<(u64, u32)> {
    let physical = physical_memory_bytes();
    let node_memory = match memory_from_string(&options.max_node_memory)? {
        0 => 1u64 << 30,
        bytes => bytes,
    };
    if node_memory >= physical {
        return Err(NodeError::Config(format!(
            "requested node memory of {node_memory} bytes exceeds host physical memory \
             of {physical} bytes"
        )));
    }

    let available = physical - node_memory;
    let computations_memory = match memory_from_string(&options.memory)? {
        0 => available,
        requested => {
            if requested > available {
                warn!(
                    requested = node_memory + requested,
                    physical,
                    "requested total memory for node exceeds host physical memory"
                );
            }
            requested
        }
    };

    let mut total_cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    if options.cores > 0 {
        if options.cores > total_cores {
            warn!(requested = options.cores, available = total_cores,
                "requested number of cores is greater than the number on this host");
        } else {
            total_cores = options.cores;
        }
    }
    // reserve one core for the node processes
    let computations_cores = if total_cores <= 1 { 1 } else { total_cores - 1 };

    info!(
        node_memory_bytes = node_memory,
        computation_memory_bytes = computations_memory,
        computation_cores = computations_cores,
        "node resources"
    );
    Ok((computations_memory >> 20, computations_cores))
}

fn physical_memory_bytes() -> u64 {
    let meminfo = std::fs::read_to_string("/proc/meminfo").unwrap_or_default();
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .unwrap_or(0);
            if kb > 0 {
                return kb << 10;
            }
        }
    }
    // no /proc: assume a small host rather than failing init
    4u64 << 30
}

fn cpu_model_name() -> String {
    let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").unwrap_or_default();
    cpuinfo
        .lines()
        .find_map(|line| line.strip_prefix("model name"))
        .and_then(|rest| rest.split(':').nth(1))
        .map(str::trim)
        .unwrap_or("unknown")
        .to_owned()
}

fn read_proc(path: &str) -> String {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .trim()
        .to_owned()
}

/// Versions of the packages baked into this process's environment.
fn rez_version_info() -> Value {
    let mut info = serde_json::Map::new();
    for (key, value) in std::env::vars() {
        if key.starts_with("REZ_") && key.ends_with("_VERSION") && !value.is_empty() {
            info.insert(key, Value::String(value));
        }
    }
    Value::Object(info)
}

/// Raise the file descriptor soft limit to the hard limit. Hundreds of
/// peers and computations each cost descriptors.
fn set_max_fds() -> Result<()> {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};
    let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE)
        .map_err(|err| NodeError::Config(format!("failed to get fd limits: {err}")))?;
    if soft < hard {
        debug!(soft, hard, "raising fd limit");
        setrlimit(Resource::RLIMIT_NOFILE, hard, hard)
            .map_err(|err| NodeError::Config(format!("failed to set fd limits: {err}")))?;
    }
    Ok(())
}

fn fetch_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_owned())
}

async fn fetch_host_ip(hostname: &str) -> String {
    match tokio::net::lookup_host((hostname, 0)).await {
        Ok(mut addrs) => addrs
            .find(|a| a.is_ipv4() && !a.ip().is_loopback())
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| "127.0.0.1".to_owned()),
        Err(_) => "127.0.0.1".to_owned(),
    }
}

/// Work out the discovery and coordinator endpoints.
///
/// Both can be forced from options; otherwise discovery comes from the
/// config service and the coordinator from discovery, with retries, since
/// the coordinator may still be starting.
async fn find_services(options: &NodeOptions) -> Result<(String, String)> {
    let consul_url = if options.no_consul {
        String::new()
    } else if options.consul_host.is_empty() {
        if options.config_service_url.is_empty() {
            return Err(NodeError::Config(
                "config service URL not set; cannot determine discovery endpoint".into(),
            ));
        }
        let url = DiscoveryClient::get_service_url(
            &options.config_service_url,
            "consul",
            &options.environment,
            &options.datacenter,
        )
        .await?;
        info!(url = %url, "node using discovery");
        url
    } else {
        format!("http://{}:{}", options.consul_host, options.consul_port)
    };

    let coordinator_url = if options.coordinator_host.is_empty() {
        if options.no_consul {
            return Err(NodeError::Config(
                "must specify coordinator host if discovery is not being used".into(),
            ));
        }
        let client = DiscoveryClient::new(&consul_url);
        let mut url = String::new();
        for attempt in 0..GET_COORDINATOR_RETRIES {
            if attempt > 0 {
                info!("waiting before trying again to fetch coordinator endpoint");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            match client.get_coordinator_url().await {
                Ok(found) => {
                    url = found;
                    break;
                }
                Err(err) => {
                    warn!(%err, "unable to fetch endpoint for coordinator from discovery");
                }
            }
        }
        if url.is_empty() {
            return Err(NodeError::Service(
                "failed to get coordinator service endpoint from discovery".into(),
            ));
        }
        url
    } else {
        let mut url = format!(
            "http://{}:{}",
            options.coordinator_host, options.coordinator_port
        );
        if !options.coordinator_endpoint.is_empty() {
            if !options.coordinator_endpoint.starts_with('/') {
                url.push('/');
            }
            url.push_str(&options.coordinator_endpoint);
        }
        url
    };

    Ok((consul_url, coordinator_url))
}

/// Launch the router child process.
async fn launch_router(
    options: &NodeOptions,
    defaults: &ComputationDefaults,
    node_id: Uuid,
) -> Result<tokio::process::Child> {
    let mut command = tokio::process::Command::new(&options.router_program);
    command
        .arg("--node-id")
        .arg(node_id.to_string())
        .arg("--ipc")
        .arg(&defaults.ipc_name)
        .arg("--log-level")
        .arg(defaults.log_level.to_string())
        .kill_on_drop(true);
    let child = command.spawn().map_err(|err| {
        NodeError::Process(format!(
            "failed to spawn router process '{}': {err}",
            options.router_program
        ))
    })?;
    Ok(child)
}

/// Connect the control channel, retrying while the router binds its
/// sockets.
async fn connect_router(
    node_id: Uuid,
    defaults: &ComputationDefaults,
    events: Arc<EventQueue>,
    cancel: CancellationToken,
) -> Result<Arc<RouterController>> {
    let ipc_path = std::path::PathBuf::from(&defaults.ipc_name);
    for attempt in 0..ROUTER_CONNECT_RETRIES {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            debug!(attempt, "retrying router connect");
        }
        match RouterController::connect(node_id, &ipc_path, Arc::clone(&events), cancel.clone())
            .await
        {
            Ok(controller) => return Ok(controller),
            Err(err) => debug!(%err, "router not ready yet"),
        }
    }
    Err(NodeError::Transport("cannot connect to node router".into()))
}

/// Tag combination rules enforced at registration and on updates.
pub fn validate_tags(tags: &Value) -> Result<()> {
    let mut message = String::new();
    if tags.get("exclusive_team").is_some_and(|v| !v.is_null())
        && tags
            .get("exclusive_production")
            .map_or(true, Value::is_null)
    {
        message.push_str(
            "Error in tag set : 'exclusive_team' requires 'exclusive_production' to be set. ",
        );
    }
    match tags.get("over_subscribe") {
        None => {}
        Some(Value::Bool(true)) => {
            if tags.get("exclusive_user").map_or(true, Value::is_null) {
                message.push_str(
                    "Error in tag set : 'over_subscribe' requires 'exclusive_user' to be set. ",
                );
            }
        }
        Some(Value::Bool(false)) => {}
        Some(_) => {
            message.push_str("Error in tag set : 'over_subscribe' should be type bool. ");
        }
    }
    if message.is_empty() {
        Ok(())
    } else {
        error!(message = %message, "invalid tag set");
        Err(NodeError::BadRequest(message))
    }
}

/// Root partition below 98 % and a writable tmp file.
fn check_disk() -> Result<()> {
    let stat = nix::sys::statvfs::statvfs("/")
        .map_err(|err| NodeError::Internal(format!("cannot stat root partition: {err}")))?;
    let capacity = stat.blocks() as u64 * stat.fragment_size() as u64;
    let available = stat.blocks_available() as u64 * stat.fragment_size() as u64;
    if capacity > 0 {
        let used = (capacity - available) as f64 / capacity as f64;
        if used >= 0.98 {
            return Err(NodeError::Internal(format!(
                "root partition usage at {:.1}%",
                used * 100.0
            )));
        }
    }

    let probe = std::env::temp_dir().join(format!("arras-node-{}", Uuid::new_v4()));
    std::fs::write(&probe, b"1").map_err(|err| {
        NodeError::Internal(format!(
            "unable to write a sample tmp file {}: {err}",
            probe.display()
        ))
    })?;
    std::fs::remove_file(&probe).map_err(|err| {
        NodeError::Internal(format!(
            "unable to remove sample tmp file {}: {err}",
            probe.display()
        ))
    })?;
    Ok(())
}

//! Session definition parsing and computation launch configuration.
//!
//! The coordinator sends one definition object per operation:
//!
//! ```json
//! { "<node-id>": { "config": {
//!       "sessionId": "...", "logLevel": 3,
//!       "contexts": { "<name>": { ... } },
//!       "computations": { "<name>": { "requirements": { ... }, ... } } } },
//!   "routing": {
//!     "<session-id>": {
//!       "nodes": { "<node-id>": { "host":..., "ip":..., "tcp":..., "entry":true } },
//!       "computations": { "<name>": { "nodeId":..., "compId":... } },
//!       "clientData": { "userInfo": { "name":... } } },
//!     "messageFilter": { ... } } }
//! ```
//!
//! [`SessionConfig`] extracts the pieces this host cares about;
//! [`ComputationConfig`] turns one computation's definition into spawn
//! arguments and the exec config file handed to the child.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{error, warn};
use uuid::Uuid;

use crate::config::ComputationDefaults;
use crate::supervisor::{apply_packaging, PackagingSystem, SpawnArgs};
use crate::{NodeError, Result};

/// Parsed session definition, scoped to one host.
#[derive(Debug)]
pub struct SessionConfig {
    session_id: Uuid,
    node_id: Uuid,
    log_level: Option<i32>,
    desc: Value,
    /// Computations this host owns: id to name.
    computations: HashMap<Uuid, String>,
    response: Value,
    this_is_entry_node: bool,
}

impl SessionConfig {
    /// Parse a definition object for the given local node.
    ///
    /// # Errors
    ///
    /// `NodeError::BadRequest` when required pieces are missing or invalid.
    pub fn parse(desc: Value, node_id: Uuid) -> Result<Self> {
        let node_config = &desc[node_id.to_string()]["config"];
        if !node_config["computations"].is_object() {
            return Err(NodeError::BadRequest(
                "session definition has no config object for this node".into(),
            ));
        }

        let session_id = node_config["sessionId"]
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| NodeError::BadRequest("session definition has no session id".into()))?;

        let log_level = node_config["logLevel"]
            .as_i64()
            .and_then(|v| i32::try_from(v).ok());

        let routing = &desc["routing"];
        if !routing.is_object() {
            return Err(NodeError::BadRequest(
                "session definition has no routing object".into(),
            ));
        }

        // the routing object lists every computation in the session; pick
        // out the ones placed on this node and build the create response
        let comps = &routing[session_id.to_string()]["computations"];
        if !comps.is_object() {
            return Err(NodeError::BadRequest(
                "session definition has no computation list".into(),
            ));
        }

        let mut computations = HashMap::new();
        let mut response = serde_json::Map::new();
        for (comp_name, info) in comps.as_object().into_iter().flatten() {
            let comp_node = info["nodeId"].as_str().and_then(|s| Uuid::parse_str(s).ok());
            let comp_id = info["compId"].as_str().and_then(|s| Uuid::parse_str(s).ok());
            let (Some(comp_node), Some(comp_id)) = (comp_node, comp_id) else {
                return Err(NodeError::BadRequest(
                    "session definition has invalid computation list".into(),
                ));
            };
            if comp_node == node_id {
                if comp_id.is_nil() {
                    return Err(NodeError::BadRequest(
                        "session definition has invalid entry in computation list".into(),
                    ));
                }
                computations.insert(comp_id, comp_name.clone());
                response.insert(
                    comp_name.clone(),
                    serde_json::json!({
                        // hostId kept alongside compId until every
                        // coordinator deployment stops reading it
                        "hostId": comp_id.to_string(),
                        "compId": comp_id.to_string(),
                        "nodeId": node_id.to_string(),
                    }),
                );
            }
        }

        let this_is_entry_node = routing[session_id.to_string()]["nodes"]
            [node_id.to_string()]["entry"]
            .as_bool()
            .unwrap_or(false);

        Ok(Self {
            session_id,
            node_id,
            log_level,
            desc,
            computations,
            response: Value::Object(response),
            this_is_entry_node,
        })
    }

    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    #[must_use]
    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    /// Session-level log level; `None` when unset.
    #[must_use]
    pub fn log_level(&self) -> Option<i32> {
        self.log_level
    }

    /// Computations placed on this host.
    #[must_use]
    pub fn computations(&self) -> &HashMap<Uuid, String> {
        &self.computations
    }

    /// Definition object for a computation name.
    #[must_use]
    pub fn definition(&self, name: &str) -> &Value {
        &self.desc[self.node_id.to_string()]["config"]["computations"][name]
    }

    /// Named context object, `Null` when absent.
    #[must_use]
    pub fn context(&self, name: &str) -> &Value {
        &self.desc[self.node_id.to_string()]["config"]["contexts"][name]
    }

    #[must_use]
    pub fn routing(&self) -> &Value {
        &self.desc["routing"]
    }

    /// Response body for the create/modify reply.
    #[must_use]
    pub fn response(&self) -> &Value {
        &self.response
    }

    #[must_use]
    pub fn is_entry_node(&self) -> bool {
        self.this_is_entry_node
    }
}

/// Launch configuration for one computation.
pub struct ComputationConfig {
    comp_id: Uuid,
    node_id: Uuid,
    session_id: Uuid,
    name: String,
    exec_config_path: String,
    spawn_args: SpawnArgs,
    exec_config: Value,
}

impl ComputationConfig {
    #[must_use]
    pub fn new(comp_id: Uuid, node_id: Uuid, session_id: Uuid, name: &str) -> Self {
        Self {
            comp_id,
            node_id,
            session_id,
            name: name.to_owned(),
            exec_config_path: format!("/tmp/exec-{name}-{comp_id}"),
            spawn_args: SpawnArgs::default(),
            exec_config: Value::Null,
        }
    }

    /// Context name from a definition's requirements, empty when absent.
    #[must_use]
    pub fn fetch_context_name(definition: &Value) -> String {
        definition["requirements"]["context"]
            .as_str()
            .unwrap_or_default()
            .to_owned()
    }

    /// Build spawn arguments and the exec config document from the
    /// computation's definition.
    ///
    /// A memory request beyond the host's computation pool is a warning,
    /// not an error; the coordinator placed it knowingly.
    pub fn set_definition(
        &mut self,
        definition: &Value,
        context: &Value,
        session_log_level: i32,
        defaults: &ComputationDefaults,
        pool_mb: u64,
    ) {
        let resources = &definition["requirements"]["resources"];
        let messaging = &definition["messaging"];

        let mut spawn_args = SpawnArgs {
            program: "execComp".into(),
            enforce_memory: defaults.enforce_memory,
            enforce_cores: defaults.enforce_cores,
            cleanup_process_group: defaults.cleanup_process_group,
            ..SpawnArgs::default()
        };

        let assigned_mb = non_negative_u64(resources, "memoryMB", defaults.def_memory_mb);
        let assigned_cores = non_negative_f64(resources, "cores", defaults.def_cores);
        spawn_args.assigned_mb = assigned_mb;
        spawn_args.assigned_cores = assigned_cores;
        spawn_args.working_directory = definition["workingDirectory"]
            .as_str()
            .unwrap_or_default()
            .to_owned();

        if assigned_mb > pool_mb {
            warn!(session_id = %self.session_id, name = %self.name,
                assigned_mb, pool_mb,
                "computation requests more memory than this host has available");
        }

        // memory and core limits travel to the child as arguments too
        let args = &mut spawn_args.args;
        args.push("--memoryMB".into());
        args.push(assigned_mb.to_string());
        args.push("--cores".into());
        args.push(assigned_cores.to_string());
        args.push("--use_affinity".into());
        args.push("0".into());

        let disable_chunking = messaging["disableChunking"]
            .as_bool()
            .unwrap_or(defaults.def_disable_chunking);
        if disable_chunking {
            args.push("--disableChunking".into());
            args.push("1".into());
        } else {
            let min_chunking = non_negative_u64(
                messaging,
                "minimumChunkingSize",
                defaults.def_min_chunking_size,
            );
            let chunk_size = non_negative_u64(messaging, "chunkSize", defaults.def_chunk_size);
            args.push("--minimumChunkingSize".into());
            args.push(min_chunking.to_string());
            args.push("--chunkSize".into());
            args.push(chunk_size.to_string());
        }

        // the exec config file carries everything else
        args.push(self.exec_config_path.clone());

        // environment: definition vars, context vars, then the fixed set
        let env = &mut spawn_args.environment;
        extend_env(env, &definition["environment"]);
        extend_env(env, &context["environment"]);
        env.insert("ARRAS_ATHENA_ENV".into(), defaults.athena_env.clone());
        env.insert("ARRAS_ATHENA_HOST".into(), defaults.athena_host.clone());
        env.insert("ARRAS_ATHENA_PORT".into(), defaults.athena_port.to_string());
        env.insert("ARRAS_BREAKPAD_PATH".into(), defaults.breakpad_path.clone());

        let log_level = resources["logLevel"]
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .unwrap_or(session_log_level);

        let mut definition_with_id = definition.clone();
        definition_with_id["computationId"] = Value::String(self.comp_id.to_string());
        let mut config = serde_json::Map::new();
        config.insert(self.name.clone(), definition_with_id);
        self.exec_config = serde_json::json!({
            "sessionId": self.session_id.to_string(),
            "compId": self.comp_id.to_string(),
            "execId": self.comp_id.to_string(),
            "nodeId": self.node_id.to_string(),
            "ipc": defaults.ipc_name,
            "logLevel": log_level,
            "config": config,
        });

        self.spawn_args = spawn_args;
    }

    /// Wrap the spawn vector for the packaging system named by the
    /// definition or context.
    ///
    /// Resolution may run a subprocess; callers keep this on an operation
    /// task so the control plane never blocks on it.
    ///
    /// # Errors
    ///
    /// `NodeError::Session` when the wrapper cannot be built.
    pub async fn apply_packaging(
        &mut self,
        definition: &Value,
        context: &Value,
        defaults: &ComputationDefaults,
    ) -> Result<()> {
        let ctx = if context.is_null() {
            &definition["requirements"]
        } else {
            context
        };
        let mut tag = ctx["packaging_system"].as_str().unwrap_or_default().to_owned();
        // a bare requirements object defaults to the configured system,
        // a named context defaults to none
        if context.is_null() && tag.is_empty() {
            tag = defaults.def_packaging_system.clone();
        }
        let system = PackagingSystem::from_tag(&tag).map_err(|err| {
            warn!(session_id = %self.session_id, name = %self.name, tag = %tag,
                "unknown packaging system");
            err
        })?;
        apply_packaging(
            &mut self.spawn_args,
            system,
            ctx,
            self.session_id,
            &defaults.package_path_override,
        )
        .await
        .map_err(|err| {
            NodeError::Session(format!("cannot start computation {}: {err}", self.name))
        })
    }

    /// Fold routing data into the exec config and spawn environment.
    pub fn add_routing(&mut self, routing: &Value) {
        let user = routing[self.session_id.to_string()]["clientData"]["userInfo"]["name"]
            .as_str()
            .unwrap_or_default();
        if !user.is_empty() {
            self.spawn_args
                .environment
                .insert("USER".into(), user.to_owned());
        }
        self.exec_config["routing"] = routing.clone();
    }

    /// Write the exec config file read by the child at startup.
    ///
    /// # Errors
    ///
    /// `NodeError::Session` when the file cannot be written.
    pub fn write_exec_config_file(&self) -> Result<()> {
        std::fs::write(&self.exec_config_path, self.exec_config.to_string()).map_err(|err| {
            error!(session_id = %self.session_id, path = %self.exec_config_path, %err,
                "failed to save exec config file");
            NodeError::Session(format!(
                "cannot start computation {}: failed to save config file",
                self.name
            ))
        })
    }

    #[must_use]
    pub fn spawn_args(&self) -> &SpawnArgs {
        &self.spawn_args
    }

    #[must_use]
    pub fn into_spawn_args(self) -> SpawnArgs {
        self.spawn_args
    }
}

fn extend_env(env: &mut HashMap<String, String>, vars: &Value) {
    for (key, value) in vars.as_object().into_iter().flatten() {
        if let Some(value) = value.as_str() {
            env.insert(key.clone(), value.to_owned());
        }
    }
}

/// Numbers in definitions may arrive as non-negative ints or floats.
fn non_negative_u64(obj: &Value, key: &str, default: u64) -> u64 {
    match &obj[key] {
        Value::Number(n) => {
            if let Some(v) = n.as_u64() {
                v
            } else if let Some(v) = n.as_f64() {
                if v >= 0.0 {
                    v as u64
                } else {
                    default
                }
            } else {
                default
            }
        }
        _ => default,
    }
}

fn non_negative_f64(obj: &Value, key: &str, default: f64) -> f64 {
    obj[key]
        .as_f64()
        .filter(|v| *v >= 0.0)
        .unwrap_or(default)
}

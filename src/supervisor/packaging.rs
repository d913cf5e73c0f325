//! Packaging wrappers applied to a spawn vector before launch.
//!
//! A computation definition names a packaging system; the wrapper rewrites
//! `(program, args, env)` so the child runs inside the requested software
//! environment. The rez systems are external collaborators: only their
//! contract is captured here: a context is a shell script to source, and
//! resolving a package list runs the resolver as a subprocess. Resolution
//! can block for seconds, which is why packaging always runs on a session
//! operation task and never on the router or HTTP paths.

use std::fmt::Write as _;

use serde_json::Value;
use tracing::error;
use uuid::Uuid;

use super::process::SpawnArgs;
use crate::{NodeError, Result};

/// Resolver programs for the two rez generations.
const REZ1_RESOLVER: &str = "rez1-resolve";
const REZ2_RESOLVER: &str = "rez-env";

/// Packaging system selected by a definition or context tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackagingSystem {
    None,
    CurrentEnvironment,
    Bash,
    Rez1,
    Rez2,
}

impl PackagingSystem {
    /// Parse a tag value. The empty tag maps to `None`.
    ///
    /// # Errors
    ///
    /// `NodeError::Session` for an unknown tag.
    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "" | "none" => Ok(Self::None),
            "current-environment" => Ok(Self::CurrentEnvironment),
            "bash" => Ok(Self::Bash),
            "rez1" => Ok(Self::Rez1),
            "rez2" => Ok(Self::Rez2),
            other => Err(NodeError::Session(format!(
                "unknown packaging system '{other}'"
            ))),
        }
    }
}

/// Wrap `spawn_args` for the packaging system named by `ctx`.
///
/// `ctx` is the computation's context object (or its `requirements` object
/// when no context is named). `package_path_override`, when set, replaces
/// both the default rez package path and any prefix from the definition.
///
/// # Errors
///
/// `NodeError::Session` when the wrapper cannot be built (missing script,
/// unresolvable packages, program not on PATH).
pub async fn apply_packaging(
    spawn_args: &mut SpawnArgs,
    system: PackagingSystem,
    ctx: &Value,
    session_id: Uuid,
    package_path_override: &str,
) -> Result<()> {
    match system {
        PackagingSystem::None => apply_no_packaging(spawn_args, ctx, session_id),
        PackagingSystem::CurrentEnvironment => {
            apply_current_environment(spawn_args, ctx);
            Ok(())
        }
        PackagingSystem::Bash => apply_shell_packaging(spawn_args, ctx, session_id),
        PackagingSystem::Rez1 => {
            apply_rez_packaging(spawn_args, 1, ctx, session_id, package_path_override).await
        }
        PackagingSystem::Rez2 => {
            apply_rez_packaging(spawn_args, 2, ctx, session_id, package_path_override).await
        }
    }
}

/// Run the program directly, resolved against the computation's PATH.
fn apply_no_packaging(spawn_args: &mut SpawnArgs, ctx: &Value, session_id: Uuid) -> Result<()> {
    let program = with_pseudo_compiler(&spawn_args.program, ctx);
    if !spawn_args.find_program_in_path(&program) {
        error!(session_id = %session_id, program = %program,
            "cannot find executable on PATH");
        return Err(NodeError::Session(format!(
            "cannot find executable '{program}' on PATH"
        )));
    }
    Ok(())
}

/// Inherit the agent's own environment wholesale.
fn apply_current_environment(spawn_args: &mut SpawnArgs, ctx: &Value) {
    for (key, value) in std::env::vars() {
        spawn_args.environment.entry(key).or_insert(value);
    }
    spawn_args.program = with_pseudo_compiler(&spawn_args.program, ctx);
}

/// Source a shell script, then exec the original command.
fn apply_shell_packaging(spawn_args: &mut SpawnArgs, ctx: &Value, session_id: Uuid) -> Result<()> {
    let script = ctx.get("script").and_then(Value::as_str).unwrap_or_default();
    if script.is_empty() {
        error!(session_id = %session_id, "shell packaging requires a script");
        return Err(NodeError::Session("must specify shell script".into()));
    }
    let program = with_pseudo_compiler(&spawn_args.program, ctx);
    wrap_in_shell(spawn_args, &format!("source {}", shell_quote(script)), &program);
    Ok(())
}

/// Wrap the command for rez.
///
/// The rez contract: `rez_context` is inline shell text to source,
/// `rez_context_file` an existing script, and `rez_packages` a package
/// list handed to the generation's resolver, whose stdout is the context
/// text. One of the three must be present.
async fn apply_rez_packaging(
    spawn_args: &mut SpawnArgs,
    rez_major: u32,
    ctx: &Value,
    session_id: Uuid,
    package_path_override: &str,
) -> Result<()> {
    let get = |key: &str| {
        ctx.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned()
    };

    let path_prefix = if package_path_override.is_empty() {
        get("rez_packages_prepend")
    } else {
        package_path_override.to_owned()
    };
    if !path_prefix.is_empty() {
        let value = if package_path_override.is_empty() {
            match std::env::var("REZ_PACKAGES_PATH") {
                Ok(existing) if !existing.is_empty() => format!("{path_prefix}:{existing}"),
                _ => path_prefix.clone(),
            }
        } else {
            path_prefix.clone()
        };
        spawn_args.environment.insert("REZ_PACKAGES_PATH".into(), value);
    }

    let rez_context = get("rez_context");
    let rez_context_file = get("rez_context_file");
    let rez_packages = get("rez_packages");

    let context_file = if !rez_context.is_empty() {
        write_context_file(&rez_context, session_id)?
    } else if !rez_context_file.is_empty() {
        rez_context_file
    } else if !rez_packages.is_empty() {
        let resolver = if rez_major == 1 {
            REZ1_RESOLVER
        } else {
            REZ2_RESOLVER
        };
        let context = resolve_packages(resolver, &rez_packages, spawn_args).await?;
        write_context_file(&context, session_id)?
    } else {
        error!(session_id = %session_id, rez_major,
            "rez packaging needs one of rez_context, rez_context_file or rez_packages");
        return Err(NodeError::Session(
            "must specify one of 'rez_context', 'rez_context_file' or 'rez_packages'".into(),
        ));
    };

    let program = with_pseudo_compiler(&spawn_args.program, ctx);
    wrap_in_shell(
        spawn_args,
        &format!("source {}", shell_quote(&context_file)),
        &program,
    );
    Ok(())
}

/// Run the rez resolver as a subprocess, capturing the context it prints.
async fn resolve_packages(
    resolver: &str,
    packages: &str,
    spawn_args: &SpawnArgs,
) -> Result<String> {
    let mut command = tokio::process::Command::new(resolver);
    command.args(packages.split_whitespace());
    if let Some(path) = spawn_args.environment.get("REZ_PACKAGES_PATH") {
        command.env("REZ_PACKAGES_PATH", path);
    }
    let output = command
        .output()
        .await
        .map_err(|err| NodeError::Session(format!("cannot run {resolver}: {err}")))?;
    if !output.status.success() {
        return Err(NodeError::Session(format!(
            "{resolver} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn write_context_file(contents: &str, session_id: Uuid) -> Result<String> {
    let path = std::env::temp_dir().join(format!("rezctx-{session_id}-{}", Uuid::new_v4()));
    std::fs::write(&path, contents)
        .map_err(|err| NodeError::Session(format!("cannot write rez context file: {err}")))?;
    Ok(path.to_string_lossy().into_owned())
}

/// Rewrite the spawn vector to `bash -c '<prelude> && exec <cmd>'`.
fn wrap_in_shell(spawn_args: &mut SpawnArgs, prelude: &str, program: &str) {
    let mut command = String::new();
    let _ = write!(command, "{prelude} && exec {}", shell_quote(program));
    for arg in &spawn_args.args {
        let _ = write!(command, " {}", shell_quote(arg));
    }
    spawn_args.program = "/bin/bash".into();
    spawn_args.args = vec!["-c".into(), command];
}

fn with_pseudo_compiler(program: &str, ctx: &Value) -> String {
    match ctx.get("pseudo-compiler").and_then(Value::as_str) {
        Some(suffix) if !suffix.is_empty() => format!("{program}-{suffix}"),
        _ => program.to_owned(),
    }
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "'\\''"))
}

// SPDX-License-Identifier: MIT OR Apache-2.0
//! The `sekia` global table (§4.5, §4.6): the only surface a workflow
//! script can use to talk to the rest of the system.
//!
//! [`install`] binds `on`, `publish`, `command`, `log`, `ai`, and
//! `ai_json` into a [`sekia_sandbox::Sandbox`]'s globals and hands back
//! the [`HandlerRegistry`] the engine dispatches through and the
//! `load_phase` flag that must be raised only around the script's
//! top-level pass.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod ai;
pub mod handlers;

pub use ai::{AiClient, AiOptions};
pub use handlers::{HandlerEntry, HandlerRegistry};

use mlua::Value;
use sekia_bus::Bus;
use sekia_protocol::{Command, Event, Payload};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Everything a workflow's `sekia` table needs to reach the rest of the
/// system: the bus, the command-signing secret, and an optional AI
/// backend.
pub struct WorkflowContext {
    /// `workflow:<name>` appears as the `source` on every event and
    /// command this workflow emits.
    pub workflow_name: String,
    /// Shared bus handle for `publish`/`command`.
    pub bus: Arc<dyn Bus>,
    /// HMAC secret for `command` (§4.2). Empty means the insecure no-op
    /// mode.
    pub command_secret: Arc<Vec<u8>>,
    /// Optional completion backend for `ai`/`ai_json`.
    pub ai_client: Option<Arc<dyn AiClient>>,
}

/// Handles the engine keeps after [`install`] to dispatch incoming
/// messages and to gate `sekia.on` to the load-time pass.
pub struct Installed {
    /// Handlers the script has registered via `sekia.on`.
    pub handlers: HandlerRegistry,
    /// Raised by the engine around the script's top-level run; `sekia.on`
    /// refuses to register once it's lowered.
    pub load_phase: Arc<AtomicBool>,
}

/// Errors installing the `sekia` table.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The interpreter rejected a table/function construction.
    #[error("lua error while installing the sekia API: {0}")]
    Lua(#[from] mlua::Error),
}

/// Bind the `sekia` global table into `sandbox`'s interpreter.
pub fn install(sandbox: &sekia_sandbox::Sandbox, ctx: WorkflowContext) -> Result<Installed, ApiError> {
    let lua = sandbox.lua();
    let sekia_table = lua.create_table()?;

    let handlers: HandlerRegistry = Arc::new(Mutex::new(Vec::new()));
    let load_phase = Arc::new(AtomicBool::new(false));

    install_on(lua, &sekia_table, &handlers, &load_phase)?;
    install_publish(lua, &sekia_table, &ctx)?;
    install_command(lua, &sekia_table, &ctx)?;
    install_log(lua, &sekia_table, &ctx)?;
    install_ai(lua, &sekia_table, &ctx)?;
    install_ai_json(lua, &sekia_table, &ctx)?;

    lua.globals().set("sekia", sekia_table)?;

    Ok(Installed { handlers, load_phase })
}

fn install_on(
    lua: &mlua::Lua,
    table: &mlua::Table,
    handlers: &HandlerRegistry,
    load_phase: &Arc<AtomicBool>,
) -> Result<(), ApiError> {
    let handlers = handlers.clone();
    let load_phase = load_phase.clone();
    let on_fn = lua.create_function(move |lua, (pattern, callback): (String, mlua::Function)| {
        if !load_phase.load(Ordering::SeqCst) {
            return Err(mlua::Error::RuntimeError(
                "sekia.on may only be called while a workflow is loading".to_string(),
            ));
        }
        sekia_protocol::subject::validate_pattern(&pattern)
            .map_err(|e| mlua::Error::RuntimeError(format!("invalid pattern: {e}")))?;
        let key = lua.create_registry_value(callback)?;
        handlers.lock().unwrap().push(HandlerEntry { pattern, key });
        Ok(())
    })?;
    table.set("on", on_fn)?;
    Ok(())
}

fn install_publish(lua: &mlua::Lua, table: &mlua::Table, ctx: &WorkflowContext) -> Result<(), ApiError> {
    let bus = ctx.bus.clone();
    let workflow_name = ctx.workflow_name.clone();
    let publish_fn = lua.create_async_function(
        move |_, (subject, event_type, payload): (String, String, mlua::Table)| {
            let bus = bus.clone();
            let workflow_name = workflow_name.clone();
            async move {
                let payload_map = table_to_payload(payload)?;
                let event = Event::new(event_type, Event::workflow_source(&workflow_name), payload_map);
                let bytes = serde_json::to_vec(&event).map_err(json_err)?;
                bus.publish(&subject, bytes)
                    .await
                    .map_err(|e| mlua::Error::RuntimeError(e.to_string()))
            }
        },
    )?;
    table.set("publish", publish_fn)?;
    Ok(())
}

fn install_command(lua: &mlua::Lua, table: &mlua::Table, ctx: &WorkflowContext) -> Result<(), ApiError> {
    let bus = ctx.bus.clone();
    let secret = ctx.command_secret.clone();
    let workflow_name = ctx.workflow_name.clone();
    let command_fn = lua.create_async_function(
        move |_, (agent, command, payload): (String, String, mlua::Table)| {
            let bus = bus.clone();
            let secret = secret.clone();
            let workflow_name = workflow_name.clone();
            async move {
                let payload_map = table_to_payload(payload)?;
                let mut cmd = Command::unsigned(command, Event::workflow_source(&workflow_name), payload_map);
                sekia_security::signing::sign(&mut cmd, &secret)
                    .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
                let bytes = serde_json::to_vec(&cmd).map_err(json_err)?;
                let subject = format!("sekia.commands.{agent}");
                bus.publish(&subject, bytes)
                    .await
                    .map_err(|e| mlua::Error::RuntimeError(e.to_string()))
            }
        },
    )?;
    table.set("command", command_fn)?;
    Ok(())
}

fn install_log(lua: &mlua::Lua, table: &mlua::Table, ctx: &WorkflowContext) -> Result<(), ApiError> {
    let workflow = ctx.workflow_name.clone();
    let log_fn = lua.create_function(move |_, (level, message): (String, String)| {
        match level.to_ascii_lowercase().as_str() {
            "trace" => tracing::trace!(workflow, "{message}"),
            "debug" => tracing::debug!(workflow, "{message}"),
            "warn" | "warning" => tracing::warn!(workflow, "{message}"),
            "error" => tracing::error!(workflow, "{message}"),
            _ => tracing::info!(workflow, "{message}"),
        }
        Ok(())
    })?;
    table.set("log", log_fn)?;
    Ok(())
}

fn install_ai(lua: &mlua::Lua, table: &mlua::Table, ctx: &WorkflowContext) -> Result<(), ApiError> {
    let ai_client = ctx.ai_client.clone();
    let ai_fn = lua.create_async_function(
        move |lua, (prompt, options): (String, Option<mlua::Table>)| {
            let ai_client = ai_client.clone();
            async move {
                let opts = parse_ai_options(options)?;
                if let Err(msg) = validate_ai_options(&opts) {
                    return Ok((Value::Nil, Value::String(lua.create_string(&msg)?)));
                }
                complete(lua, ai_client, &prompt, &opts).await
            }
        },
    )?;
    table.set("ai", ai_fn)?;
    Ok(())
}

fn install_ai_json(lua: &mlua::Lua, table: &mlua::Table, ctx: &WorkflowContext) -> Result<(), ApiError> {
    let ai_client = ctx.ai_client.clone();
    let ai_json_fn = lua.create_async_function(
        move |lua, (prompt, options): (String, Option<mlua::Table>)| {
            let ai_client = ai_client.clone();
            async move {
                let opts = parse_ai_options(options)?;
                if let Err(msg) = validate_ai_options(&opts) {
                    return Ok((Value::Nil, Value::String(lua.create_string(&msg)?)));
                }
                let (result, error) = complete(lua, ai_client, &prompt, &opts).await?;
                if !matches!(error, Value::Nil) {
                    return Ok((Value::Nil, error));
                }
                let text = match &result {
                    Value::String(s) => s.to_str()?.to_owned(),
                    _ => unreachable!("complete() returns a string when it does not return an error"),
                };
                match serde_json::from_str::<serde_json::Value>(&text) {
                    Ok(json) => {
                        let value = sekia_sandbox::json_to_value(lua, &json)?;
                        Ok((value, Value::Nil))
                    }
                    Err(e) => Ok((
                        Value::Nil,
                        Value::String(lua.create_string(&format!("ai: invalid JSON: {e}"))?),
                    )),
                }
            }
        },
    )?;
    table.set("ai_json", ai_json_fn)?;
    Ok(())
}

async fn complete<'lua>(
    lua: &'lua mlua::Lua,
    ai_client: Option<Arc<dyn AiClient>>,
    prompt: &str,
    options: &AiOptions,
) -> mlua::Result<(Value<'lua>, Value<'lua>)> {
    match ai_client {
        None => Ok((Value::Nil, Value::String(lua.create_string("ai: not configured")?))),
        Some(client) => match client.complete(prompt, options).await {
            Ok(text) => Ok((Value::String(lua.create_string(&text)?), Value::Nil)),
            Err(e) => Ok((Value::Nil, Value::String(lua.create_string(&format!("ai: {e}"))?))),
        },
    }
}

fn parse_ai_options(options: Option<mlua::Table>) -> mlua::Result<AiOptions> {
    let Some(t) = options else {
        return Ok(AiOptions::default());
    };
    Ok(AiOptions {
        model: t.get("model")?,
        max_tokens: t.get("max_tokens")?,
        temperature: t.get("temperature")?,
        system: t.get("system")?,
    })
}

/// Enforce §4.6's option contract (`max_tokens` > 0, `temperature` in
/// `[0, 2]`) and return the soft `"ai: ..."` message the caller hands
/// back as the second return value, instead of forwarding an invalid
/// option through to the configured backend.
fn validate_ai_options(opts: &AiOptions) -> Result<(), String> {
    if let Some(max_tokens) = opts.max_tokens {
        if max_tokens == 0 {
            return Err("ai: max_tokens must be greater than 0".to_string());
        }
    }
    if let Some(temperature) = opts.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(format!(
                "ai: temperature must be between 0 and 2, got {temperature}"
            ));
        }
    }
    Ok(())
}

fn table_to_payload(table: mlua::Table) -> mlua::Result<Payload> {
    let json = sekia_sandbox::value_to_json(Value::Table(table))
        .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
    match json {
        serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
        _ => Err(mlua::Error::RuntimeError(
            "payload must be a table with string keys".to_string(),
        )),
    }
}

fn json_err(e: serde_json::Error) -> mlua::Error {
    mlua::Error::RuntimeError(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sekia_bus::embedded::EmbeddedBus;

    fn test_ctx(bus: Arc<dyn Bus>) -> WorkflowContext {
        WorkflowContext {
            workflow_name: "test".to_string(),
            bus,
            command_secret: Arc::new(Vec::new()),
            ai_client: None,
        }
    }

    #[tokio::test]
    async fn on_is_rejected_outside_load_phase() {
        let sandbox = sekia_sandbox::Sandbox::new().unwrap();
        let bus: Arc<dyn Bus> = Arc::new(EmbeddedBus::new());
        let installed = install(&sandbox, test_ctx(bus)).unwrap();
        installed.load_phase.store(false, Ordering::SeqCst);
        let err = sandbox
            .load("t", "sekia.on('a.b', function() end)", std::time::Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, sekia_sandbox::SandboxError::Script(_)));
        assert!(installed.handlers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn on_registers_during_load_phase() {
        let sandbox = sekia_sandbox::Sandbox::new().unwrap();
        let bus: Arc<dyn Bus> = Arc::new(EmbeddedBus::new());
        let installed = install(&sandbox, test_ctx(bus)).unwrap();
        installed.load_phase.store(true, Ordering::SeqCst);
        sandbox
            .load(
                "t",
                "sekia.on('sekia.events.gmail', function() end)",
                std::time::Duration::from_secs(1),
            )
            .await
            .unwrap();
        installed.load_phase.store(false, Ordering::SeqCst);
        let handlers = installed.handlers.lock().unwrap();
        assert_eq!(handlers.len(), 1);
        assert_eq!(handlers[0].pattern, "sekia.events.gmail");
    }

    #[tokio::test]
    async fn publish_round_trips_through_the_bus() {
        let sandbox = sekia_sandbox::Sandbox::new().unwrap();
        let bus: Arc<dyn Bus> = Arc::new(EmbeddedBus::new());
        let mut sub = bus.subscribe("sekia.events.test").await.unwrap();
        install(&sandbox, test_ctx(bus.clone())).unwrap();
        sandbox
            .load(
                "t",
                "sekia.publish('sekia.events.test', 'widget.created', {name = 'x'})",
                std::time::Duration::from_secs(1),
            )
            .await
            .unwrap();
        let msg = sub.recv().await.unwrap();
        let event: Event = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(event.event_type, "widget.created");
        assert_eq!(event.source, "workflow:test");
    }

    #[tokio::test]
    async fn ai_without_a_client_fails_softly() {
        let sandbox = sekia_sandbox::Sandbox::new().unwrap();
        let bus: Arc<dyn Bus> = Arc::new(EmbeddedBus::new());
        install(&sandbox, test_ctx(bus)).unwrap();
        sandbox
            .load(
                "t",
                "local ok, err = sekia.ai('hello'); assert(ok == nil); assert(err == 'ai: not configured')",
                std::time::Duration::from_secs(1),
            )
            .await
            .unwrap();
    }

    #[test]
    fn zero_max_tokens_is_rejected() {
        let opts = AiOptions { max_tokens: Some(0), ..AiOptions::default() };
        let err = validate_ai_options(&opts).unwrap_err();
        assert!(err.contains("max_tokens"));
    }

    #[test]
    fn out_of_range_temperature_is_rejected() {
        let opts = AiOptions { temperature: Some(9.0), ..AiOptions::default() };
        let err = validate_ai_options(&opts).unwrap_err();
        assert!(err.contains("temperature"));
    }

    #[test]
    fn boundary_temperatures_are_accepted() {
        let low = AiOptions { temperature: Some(0.0), ..AiOptions::default() };
        let high = AiOptions { temperature: Some(2.0), ..AiOptions::default() };
        assert!(validate_ai_options(&low).is_ok());
        assert!(validate_ai_options(&high).is_ok());
    }

    #[tokio::test]
    async fn ai_rejects_invalid_options_before_calling_the_backend() {
        let sandbox = sekia_sandbox::Sandbox::new().unwrap();
        let bus: Arc<dyn Bus> = Arc::new(EmbeddedBus::new());
        install(&sandbox, test_ctx(bus)).unwrap();
        sandbox
            .load(
                "t",
                "local ok, err = sekia.ai('hello', {max_tokens = 0}); \
                 assert(ok == nil); \
                 assert(err == 'ai: max_tokens must be greater than 0')",
                std::time::Duration::from_secs(1),
            )
            .await
            .unwrap();
    }
}

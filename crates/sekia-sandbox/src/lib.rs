// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-workflow script sandbox (§4.5).
//!
//! Each workflow owns one [`Sandbox`]: a Lua interpreter whose standard
//! library is pruned to string/number/table/math/basic control flow, with
//! no file I/O, process spawn, dynamic module loading, or OS environment
//! access. Time is exposed only through a deterministic `os.time`/`os.date`
//! view backed by the host clock. Binding the `sekia` API table itself is
//! the caller's job (`sekia-api`); this crate only builds the restricted
//! interpreter and enforces the wall-clock budget on each callback.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod marshal;

use chrono::{Datelike, Timelike, Utc};
use mlua::{HookTriggers, Lua, LuaOptions, StdLib, Value};
use std::time::{Duration, Instant};
use thiserror::Error;

pub use marshal::{json_to_value, value_to_json, MarshalError};

/// Default per-callback wall-clock budget (§4.5).
pub const DEFAULT_CALLBACK_BUDGET: Duration = Duration::from_secs(5);

/// How often the budget hook checks the clock, in VM instructions. `lua54`
/// has no interrupt API, so the deadline is polled from a debug hook
/// instead; a few thousand instructions keeps the check overhead low
/// without letting a tight loop run far past its deadline.
const HOOK_INSTRUCTION_INTERVAL: u32 = 10_000;

/// Globals removed from the `base` library even though it's opened: each
/// one reads files, loads untrusted bytecode, or pulls in the module
/// loader, none of which the sandbox permits.
const REMOVED_BASE_GLOBALS: &[&str] = &["dofile", "loadfile", "load", "require", "collectgarbage"];

/// Errors from creating or driving a sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The interpreter itself could not be constructed or configured.
    #[error("sandbox initialization failed: {0}")]
    Init(String),
    /// The script raised an error or failed to parse.
    #[error("script error: {0}")]
    Script(String),
    /// A callback exceeded its wall-clock budget.
    #[error("callback exceeded its {0:?} budget")]
    Timeout(Duration),
    /// A value could not cross the script/host boundary.
    #[error(transparent)]
    Marshal(#[from] MarshalError),
}

/// A single workflow's restricted Lua interpreter.
pub struct Sandbox {
    lua: Lua,
}

impl Sandbox {
    /// Build a new sandbox: opens only `base` (pruned), `table`, `string`,
    /// and `math`, then installs a deterministic `os` stub.
    pub fn new() -> Result<Self, SandboxError> {
        let stdlib = StdLib::BASE | StdLib::TABLE | StdLib::STRING | StdLib::MATH;
        let lua = Lua::new_with(stdlib, LuaOptions::new())
            .map_err(|e| SandboxError::Init(e.to_string()))?;

        {
            let globals = lua.globals();
            for name in REMOVED_BASE_GLOBALS {
                globals
                    .set(*name, Value::Nil)
                    .map_err(|e| SandboxError::Init(e.to_string()))?;
            }
            let os_table = build_deterministic_os_table(&lua)
                .map_err(|e| SandboxError::Init(e.to_string()))?;
            globals
                .set("os", os_table)
                .map_err(|e| SandboxError::Init(e.to_string()))?;
        }

        Ok(Self { lua })
    }

    /// The underlying interpreter, for installing the `sekia` API table
    /// and for registering handlers before the load-time run.
    #[must_use]
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// Execute `source` once, top to bottom. This is the load-time pass
    /// in which a workflow is expected to register its handlers; it is
    /// itself subject to the wall-clock budget.
    pub async fn load(
        &self,
        name: &str,
        source: &str,
        budget: Duration,
    ) -> Result<(), SandboxError> {
        let chunk = self.lua.load(source).set_name(name);
        self.run_with_budget(budget, chunk.into_function().map_err(script_err)?, ())
            .await
    }

    /// Invoke a registered handler with marshalled JSON arguments, bounded
    /// by `budget` (default [`DEFAULT_CALLBACK_BUDGET`]).
    pub async fn call(
        &self,
        func: mlua::Function<'_>,
        args: &serde_json::Value,
        budget: Duration,
    ) -> Result<(), SandboxError> {
        let lua_args = json_to_value(&self.lua, args).map_err(script_err)?;
        self.run_with_budget(budget, func, lua_args).await
    }

    async fn run_with_budget<'lua, A>(
        &'lua self,
        budget: Duration,
        func: mlua::Function<'lua>,
        args: A,
    ) -> Result<(), SandboxError>
    where
        A: mlua::IntoLuaMulti<'lua>,
    {
        let deadline = Instant::now() + budget;
        self.lua
            .set_hook(
                HookTriggers {
                    every_nth_instruction: Some(HOOK_INSTRUCTION_INTERVAL),
                    ..Default::default()
                },
                move |_lua, _debug| {
                    if Instant::now() >= deadline {
                        Err(mlua::Error::RuntimeError(
                            "callback exceeded its wall-clock budget".to_string(),
                        ))
                    } else {
                        Ok(())
                    }
                },
            )
            .map_err(|e| SandboxError::Init(e.to_string()))?;

        let call = func.call_async::<_, ()>(args);
        let outcome = tokio::time::timeout(budget, call).await;
        self.lua.remove_hook();

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SandboxError::Script(e.to_string())),
            Err(_) => Err(SandboxError::Timeout(budget)),
        }
    }
}

fn script_err(e: mlua::Error) -> SandboxError {
    SandboxError::Script(e.to_string())
}

fn build_deterministic_os_table(lua: &Lua) -> mlua::Result<mlua::Table<'_>> {
    let os_table = lua.create_table()?;
    os_table.set("time", lua.create_function(|_, ()| Ok(Utc::now().timestamp()))?)?;
    os_table.set(
        "date",
        lua.create_function(|lua, fmt: Option<String>| os_date(lua, fmt))?,
    )?;
    Ok(os_table)
}

/// A minimal `os.date`: supports the `*t`/`!*t` table form and strftime-style
/// format strings via `chrono`. The leading `!` (UTC marker) is accepted but
/// has no effect, since the sandbox's clock is always UTC.
fn os_date<'lua>(lua: &'lua Lua, fmt: Option<String>) -> mlua::Result<Value<'lua>> {
    let fmt = fmt.unwrap_or_else(|| "%c".to_string());
    let fmt = fmt.strip_prefix('!').unwrap_or(&fmt);
    let now = Utc::now();

    if fmt == "*t" {
        let table = lua.create_table()?;
        table.set("year", now.year())?;
        table.set("month", now.month())?;
        table.set("day", now.day())?;
        table.set("hour", now.hour())?;
        table.set("min", now.minute())?;
        table.set("sec", now.second())?;
        table.set("wday", now.weekday().number_from_sunday())?;
        table.set("yday", now.ordinal())?;
        table.set("isdst", false)?;
        return Ok(Value::Table(table));
    }

    Ok(Value::String(lua.create_string(&now.format(fmt).to_string())?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn removed_globals_are_gone() {
        let sandbox = Sandbox::new().unwrap();
        let err = sandbox
            .load("t", "dofile('x')", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Script(_)));
    }

    #[tokio::test]
    async fn os_time_and_date_are_available() {
        let sandbox = Sandbox::new().unwrap();
        sandbox
            .load(
                "t",
                "assert(type(os.time()) == 'number'); assert(type(os.date('%Y')) == 'string')",
                Duration::from_secs(1),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn string_table_math_are_available() {
        let sandbox = Sandbox::new().unwrap();
        sandbox
            .load(
                "t",
                "assert(string.upper('a') == 'A'); assert(math.floor(1.9) == 1); \
                 local t = {1,2,3}; assert(#t == 3)",
                Duration::from_secs(1),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn infinite_loop_times_out() {
        let sandbox = Sandbox::new().unwrap();
        let err = sandbox
            .load("t", "while true do end", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
    }
}

/// Lua sandbox backed by mlua
///
/// A fresh Lua 5.4 VM per execution with only the table, string, math and utf8
/// libraries. Base-library escape hatches are removed, memory is capped through
/// the allocator limit and an instruction-count hook enforces the wall-clock
/// deadline. The VM lives on a blocking thread; only JSON values cross in and out.
///
/// The instruction hook never fires inside C library calls, so the string
/// pattern functions are wrapped with a matching-cost bound: a pattern whose
/// worst-case backtracking over the subject exceeds `PATTERN_STEP_BUDGET` is
/// refused before the C matcher starts.

use crate::config::SandboxConfig;
use crate::sandbox::analyzer::{self, Severity, Violation, ViolationCategory};
use crate::sandbox::sanitize::{sanitize_value, truncate_utf8, SanitizeLimits};
use crate::sandbox::{
    Sandbox, SandboxContext, SandboxError, SandboxErrorKind, SandboxExecutionResult, SandboxLimits,
};
use async_trait::async_trait;
use mlua::{Function, HookTriggers, Lua, LuaOptions, LuaSerdeExt, MultiValue, SerializeOptions, StdLib, Table, VmState};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Globals removed from the base library before user code runs
const REMOVED_GLOBALS: &[&str] = &[
    "load", "loadstring", "dofile", "loadfile", "require", "collectgarbage",
    "rawset", "rawget", "rawequal", "rawlen", "setmetatable", "getmetatable",
    "pcall", "xpcall", "print", "_G",
];

/// Deadline check frequency
const HOOK_INSTRUCTION_INTERVAL: u32 = 1_000;

/// Extra time the async backstop waits beyond the in-VM deadline
const BACKSTOP_GRACE_MS: u64 = 500;

const CHUNK_NAME: &str = "=transform";

/// `string` functions that run the backtracking matcher in C
const PATTERN_FUNCTIONS: &[&str] = &["find", "match", "gmatch", "gsub"];

/// Upper bound on estimated matcher steps for one pattern call
const PATTERN_STEP_BUDGET: f64 = 1e8;

#[derive(Debug, Clone)]
pub struct LuaSandbox {
    config: SandboxConfig,
}

impl LuaSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    fn sanitize_limits(&self) -> SanitizeLimits {
        SanitizeLimits {
            max_string_bytes: self.config.max_string_bytes,
            max_depth: self.config.max_depth,
        }
    }
}

impl Default for LuaSandbox {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

#[async_trait]
impl Sandbox for LuaSandbox {
    async fn execute(&self, code: &str, context: SandboxContext, limits: SandboxLimits) -> SandboxExecutionResult {
        let started = Instant::now();
        let violations = self.analyze(code);

        let critical: Vec<&Violation> = violations.iter().filter(|v| v.is_critical()).collect();
        if !critical.is_empty() {
            let mut categories: Vec<String> = critical.iter().map(|v| v.category.to_string()).collect();
            categories.dedup();
            tracing::warn!("🚨 Sandbox refused execution: {} critical violation(s) [{}]",
                critical.len(), categories.join(", "));
            let reasons: Vec<String> = critical
                .iter()
                .map(|v| format!("line {}: {}", v.line, v.message))
                .collect();
            return SandboxExecutionResult {
                success: false,
                output: None,
                error: Some(SandboxError::new(
                    SandboxErrorKind::SecurityViolation,
                    format!("{}: {}", categories.join(", "), reasons.join("; ")),
                )),
                execution_time_ms: started.elapsed().as_millis() as u64,
                security_violations: violations,
            };
        }

        for violation in &violations {
            tracing::warn!("⚠️ Sandbox warning ({:?}, {}): line {} - {}",
                violation.severity, violation.category, violation.line, violation.message);
        }

        let sanitize = self.sanitize_limits();
        let input = sanitize_value(&context.input, sanitize);
        let variables = sanitize_value(&context.variables, sanitize);
        let code_owned = code.to_string();

        tracing::debug!("🏃 Executing sandboxed code ({} bytes, {}ms, {}MB)",
            code.len(), limits.timeout_ms, limits.memory_limit_mb);

        let worker = tokio::task::spawn_blocking(move || run_isolated(&code_owned, input, variables, limits));
        let backstop = Duration::from_millis(limits.timeout_ms + BACKSTOP_GRACE_MS);

        let outcome = match tokio::time::timeout(backstop, worker).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) => {
                tracing::error!("❌ Sandbox worker failed: {}", join_err);
                Err(SandboxError::new(SandboxErrorKind::Internal, "sandbox worker failed"))
            }
            Err(_) => Err(SandboxError::timeout(limits.timeout_ms)),
        };

        let execution_time_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(output) => SandboxExecutionResult {
                success: true,
                output: Some(sanitize_value(&output, sanitize)),
                error: None,
                execution_time_ms,
                security_violations: violations,
            },
            Err(error) => {
                tracing::warn!("❌ Sandboxed code failed ({:?}): {}", error.kind, error.message);
                SandboxExecutionResult {
                    success: false,
                    output: None,
                    error: Some(error),
                    execution_time_ms,
                    security_violations: violations,
                }
            }
        }
    }

    fn analyze(&self, code: &str) -> Vec<Violation> {
        let mut violations = Vec::new();
        if code.len() > self.config.max_code_bytes {
            violations.push(Violation {
                rule: "code-size".to_string(),
                category: ViolationCategory::Resource,
                severity: Severity::Critical,
                message: format!("code exceeds {} bytes", self.config.max_code_bytes),
                line: 0,
            });
            return violations;
        }
        violations.extend(analyzer::analyze(code));
        violations
    }

    fn default_limits(&self) -> SandboxLimits {
        SandboxLimits::from(&self.config)
    }
}

/// Build a restricted VM, run the code and convert its result
fn run_isolated(code: &str, input: Value, variables: Value, limits: SandboxLimits) -> Result<Value, SandboxError> {
    let internal = |e: mlua::Error| {
        tracing::error!("❌ Sandbox setup failed: {}", e);
        SandboxError::new(SandboxErrorKind::Internal, "sandbox setup failed")
    };

    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8,
        LuaOptions::new(),
    )
    .map_err(internal)?;

    lua.set_memory_limit(limits.memory_limit_mb.saturating_mul(1024 * 1024))
        .map_err(internal)?;

    let timed_out = Arc::new(AtomicBool::new(false));
    let deadline = Instant::now() + Duration::from_millis(limits.timeout_ms);
    let flag = Arc::clone(&timed_out);
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
        move |_lua, _debug| {
            if Instant::now() >= deadline {
                flag.store(true, Ordering::SeqCst);
                Err(mlua::Error::runtime("execution deadline exceeded"))
            } else {
                Ok(VmState::Continue)
            }
        },
    )
    .map_err(internal)?;

    let globals = lua.globals();
    for name in REMOVED_GLOBALS {
        globals.set(*name, mlua::Nil).map_err(internal)?;
    }
    let string_lib: Table = globals.get("string").map_err(internal)?;
    string_lib.set("dump", mlua::Nil).map_err(internal)?;
    guard_pattern_functions(&lua, &string_lib).map_err(internal)?;

    let options = SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false);
    let lua_input = lua.to_value_with(&input, options).map_err(internal)?;
    let lua_vars = lua.to_value_with(&variables, options).map_err(internal)?;
    globals.set("input", lua_input).map_err(internal)?;
    globals.set("vars", lua_vars).map_err(internal)?;

    let result: mlua::Value = lua
        .load(code)
        .set_name(CHUNK_NAME)
        .eval()
        .map_err(|e| classify_error(&e, timed_out.load(Ordering::SeqCst), limits))?;

    if timed_out.load(Ordering::SeqCst) {
        return Err(SandboxError::timeout(limits.timeout_ms));
    }

    let output = lua_to_json(result, 0)?;
    Ok(output.unwrap_or(Value::Null))
}

/// Replace the pattern functions with cost-checked wrappers
///
/// The string metatable's `__index` is this same table, so method calls
/// (`s:find(p)`) go through the wrappers too.
fn guard_pattern_functions(lua: &Lua, string_lib: &Table) -> mlua::Result<()> {
    for name in PATTERN_FUNCTIONS {
        let original: Function = string_lib.get(*name)?;
        let guarded = lua.create_function(move |_, args: MultiValue| {
            let subject_len = args.front().map(lua_len).unwrap_or(0);
            let plain = *name == "find" && args.get(3).map(|v| v.as_boolean() == Some(true)).unwrap_or(false);
            if !plain {
                let quantifiers = match args.get(1) {
                    Some(mlua::Value::String(p)) => count_quantifiers(&p.as_bytes()),
                    _ => 0,
                };
                if pattern_cost(subject_len, quantifiers) > PATTERN_STEP_BUDGET {
                    return Err(mlua::Error::runtime(format!(
                        "pattern too complex for a {}-byte string ({} quantifiers)",
                        subject_len, quantifiers
                    )));
                }
            }
            original.call::<MultiValue>(args)
        })?;
        string_lib.set(*name, guarded)?;
    }
    Ok(())
}

fn lua_len(value: &mlua::Value) -> usize {
    match value {
        mlua::Value::String(s) => s.as_bytes().len(),
        mlua::Value::Integer(_) | mlua::Value::Number(_) => 32,
        _ => 0,
    }
}

/// Worst-case matcher steps: every start position times one nested scan per quantifier
fn pattern_cost(subject_len: usize, quantifiers: u32) -> f64 {
    let n = subject_len as f64 + 1.0;
    n.powi(quantifiers as i32 + 1)
}

/// Count `*`, `+`, `-` and `?` acting as quantifiers (outside escapes and sets)
fn count_quantifiers(pattern: &[u8]) -> u32 {
    let mut count = 0;
    let mut i = 0;
    let mut previous_is_class = false;
    while i < pattern.len() {
        match pattern[i] {
            b'%' => {
                // %b takes two delimiter bytes, %f a set
                match pattern.get(i + 1) {
                    Some(b'b') => {
                        i += 4;
                        previous_is_class = false;
                        continue;
                    }
                    Some(b'f') => {
                        i += 2;
                        previous_is_class = false;
                        continue;
                    }
                    _ => {
                        i += 2;
                        previous_is_class = true;
                        continue;
                    }
                }
            }
            b'[' => {
                i += 1;
                if pattern.get(i) == Some(&b'^') {
                    i += 1;
                }
                // A leading ']' is a literal member
                if pattern.get(i) == Some(&b']') {
                    i += 1;
                }
                while i < pattern.len() && pattern[i] != b']' {
                    i += if pattern[i] == b'%' { 2 } else { 1 };
                }
                previous_is_class = true;
            }
            b'*' | b'+' | b'-' | b'?' if previous_is_class => {
                count += 1;
                previous_is_class = false;
            }
            b'^' if i == 0 => previous_is_class = false,
            b'(' | b')' => previous_is_class = false,
            _ => previous_is_class = true,
        }
        i += 1;
    }
    count
}

/// Map an mlua error to a sanitized, classified sandbox error
fn classify_error(err: &mlua::Error, timed_out: bool, limits: SandboxLimits) -> SandboxError {
    if timed_out {
        return SandboxError::timeout(limits.timeout_ms);
    }
    if is_memory_error(err) {
        return SandboxError::memory(limits.memory_limit_mb);
    }
    match err {
        mlua::Error::SyntaxError { message, .. } => {
            SandboxError::new(SandboxErrorKind::SyntaxError, clean_message(message))
        }
        other => SandboxError::new(SandboxErrorKind::RuntimeError, clean_message(&other.to_string())),
    }
}

fn is_memory_error(err: &mlua::Error) -> bool {
    match err {
        mlua::Error::MemoryError(_) => true,
        mlua::Error::CallbackError { cause, .. } => is_memory_error(cause),
        other => other.to_string().contains("not enough memory"),
    }
}

/// Keep the first line, drop tracebacks and rewrite the chunk prefix
fn clean_message(raw: &str) -> String {
    let first = raw.lines().next().unwrap_or("").trim();
    let first = first.strip_prefix("runtime error: ").unwrap_or(first);
    let first = first.strip_prefix("syntax error: ").unwrap_or(first);
    let chunk = CHUNK_NAME.trim_start_matches('=');
    let cleaned = match first.strip_prefix(chunk).and_then(|rest| rest.strip_prefix(':')) {
        Some(rest) => match rest.split_once(':') {
            Some((line, msg)) if line.chars().all(|c| c.is_ascii_digit()) => {
                format!("line {}:{}", line, msg)
            }
            _ => rest.to_string(),
        },
        None => first.to_string(),
    };
    truncate_utf8(&cleaned, 512)
}

/// Convert a Lua value to JSON
///
/// Functions, threads and userdata are stripped (`None`). Tables whose keys are
/// exactly 1..n become arrays; everything else becomes an object.
fn lua_to_json(lua_value: mlua::Value, depth: usize) -> Result<Option<Value>, SandboxError> {
    const MAX_OUTPUT_DEPTH: usize = 64;
    if depth > MAX_OUTPUT_DEPTH {
        return Err(SandboxError::new(
            SandboxErrorKind::InvalidOutput,
            format!("output nesting exceeds {} levels", MAX_OUTPUT_DEPTH),
        ));
    }

    let invalid = |e: mlua::Error| SandboxError::new(SandboxErrorKind::InvalidOutput, clean_message(&e.to_string()));

    let value = match lua_value {
        mlua::Value::Nil => Value::Null,
        mlua::Value::Boolean(b) => Value::Bool(b),
        mlua::Value::Integer(i) => Value::Number(serde_json::Number::from(i)),
        mlua::Value::Number(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        mlua::Value::String(s) => Value::String(s.to_string_lossy()),
        mlua::Value::LightUserData(ud) if ud.0.is_null() => Value::Null,
        mlua::Value::Table(table) => {
            let mut max_index = 0usize;
            let mut count = 0usize;
            let mut is_array = true;

            for pair in table.clone().pairs::<mlua::Value, mlua::Value>() {
                let (key, _) = pair.map_err(invalid)?;
                count += 1;
                match key {
                    mlua::Value::Integer(i) if i > 0 => max_index = max_index.max(i as usize),
                    _ => is_array = false,
                }
            }

            if is_array && count > 0 && count == max_index {
                let mut arr = Vec::with_capacity(max_index);
                for i in 1..=max_index {
                    let val: mlua::Value = table.raw_get(i).map_err(invalid)?;
                    arr.push(lua_to_json(val, depth + 1)?.unwrap_or(Value::Null));
                }
                Value::Array(arr)
            } else {
                let mut obj = serde_json::Map::new();
                for pair in table.pairs::<mlua::Value, mlua::Value>() {
                    let (key, value) = pair.map_err(invalid)?;
                    let key_str = match key {
                        mlua::Value::String(s) => s.to_string_lossy(),
                        mlua::Value::Integer(i) => i.to_string(),
                        mlua::Value::Number(f) => f.to_string(),
                        mlua::Value::Boolean(b) => b.to_string(),
                        _ => continue,
                    };
                    if let Some(json) = lua_to_json(value, depth + 1)? {
                        obj.insert(key_str, json);
                    }
                }
                Value::Object(obj)
            }
        }
        _ => return Ok(None),
    };

    Ok(Some(value))
}

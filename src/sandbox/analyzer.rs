/// Static analysis of transform code
///
/// Tokenizes Lua source (skipping string literals and comments) and matches the
/// identifier stream against a rule table. Critical findings refuse execution
/// before a VM is created; lower severities are reported and logged only.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCategory {
    DynamicCode,
    Filesystem,
    Network,
    Process,
    Prototype,
    Resource,
    ModuleLoading,
}

impl fmt::Display for ViolationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ViolationCategory::DynamicCode => "dynamic_code",
            ViolationCategory::Filesystem => "filesystem",
            ViolationCategory::Network => "network",
            ViolationCategory::Process => "process",
            ViolationCategory::Prototype => "prototype",
            ViolationCategory::Resource => "resource",
            ViolationCategory::ModuleLoading => "module_loading",
        };
        f.write_str(name)
    }
}

/// A single finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: String,
    pub category: ViolationCategory,
    pub severity: Severity,
    pub message: String,
    /// 1-based source line, 0 when not tied to a line
    pub line: usize,
}

impl Violation {
    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

enum Pattern {
    /// Global identifier (not a field access like `t.load`)
    Global(&'static str),
    /// `object.member` or `object:member`
    Member(&'static str, &'static str),
    /// Consecutive identifiers, e.g. `while true`
    Sequence(&'static [&'static str]),
}

struct Rule {
    name: &'static str,
    pattern: Pattern,
    category: ViolationCategory,
    severity: Severity,
    message: &'static str,
}

use Severity::*;
use ViolationCategory::*;

// Member rules come before the matching global rule so the more specific one wins.
const RULES: &[Rule] = &[
    Rule { name: "load", pattern: Pattern::Global("load"), category: DynamicCode, severity: Critical, message: "dynamic code evaluation is not allowed" },
    Rule { name: "loadstring", pattern: Pattern::Global("loadstring"), category: DynamicCode, severity: Critical, message: "dynamic code evaluation is not allowed" },
    Rule { name: "dofile", pattern: Pattern::Global("dofile"), category: DynamicCode, severity: Critical, message: "loading code from files is not allowed" },
    Rule { name: "loadfile", pattern: Pattern::Global("loadfile"), category: DynamicCode, severity: Critical, message: "loading code from files is not allowed" },
    Rule { name: "string.dump", pattern: Pattern::Member("string", "dump"), category: DynamicCode, severity: Critical, message: "bytecode dumping is not allowed" },
    Rule { name: "require", pattern: Pattern::Global("require"), category: ModuleLoading, severity: Critical, message: "module loading is not allowed" },
    Rule { name: "package", pattern: Pattern::Global("package"), category: ModuleLoading, severity: Critical, message: "module loading is not allowed" },
    Rule { name: "io", pattern: Pattern::Global("io"), category: Filesystem, severity: Critical, message: "filesystem access is not allowed" },
    Rule { name: "os.remove", pattern: Pattern::Member("os", "remove"), category: Filesystem, severity: Critical, message: "filesystem access is not allowed" },
    Rule { name: "os.rename", pattern: Pattern::Member("os", "rename"), category: Filesystem, severity: Critical, message: "filesystem access is not allowed" },
    Rule { name: "os.tmpname", pattern: Pattern::Member("os", "tmpname"), category: Filesystem, severity: Critical, message: "filesystem access is not allowed" },
    Rule { name: "os.execute", pattern: Pattern::Member("os", "execute"), category: Process, severity: Critical, message: "process execution is not allowed" },
    Rule { name: "os.exit", pattern: Pattern::Member("os", "exit"), category: Process, severity: Critical, message: "process control is not allowed" },
    Rule { name: "os.getenv", pattern: Pattern::Member("os", "getenv"), category: Process, severity: Critical, message: "environment access is not allowed" },
    Rule { name: "os", pattern: Pattern::Global("os"), category: Process, severity: High, message: "the os library is not available" },
    Rule { name: "debug", pattern: Pattern::Global("debug"), category: Process, severity: Critical, message: "the debug library is not allowed" },
    Rule { name: "socket", pattern: Pattern::Global("socket"), category: Network, severity: Critical, message: "network access is not allowed" },
    Rule { name: "http", pattern: Pattern::Global("http"), category: Network, severity: Critical, message: "network access is not allowed" },
    Rule { name: "https", pattern: Pattern::Global("https"), category: Network, severity: Critical, message: "network access is not allowed" },
    Rule { name: "setmetatable", pattern: Pattern::Global("setmetatable"), category: Prototype, severity: High, message: "metatable manipulation is not allowed" },
    Rule { name: "getmetatable", pattern: Pattern::Global("getmetatable"), category: Prototype, severity: High, message: "metatable inspection is not allowed" },
    Rule { name: "rawset", pattern: Pattern::Global("rawset"), category: Prototype, severity: High, message: "raw table access is not allowed" },
    Rule { name: "rawget", pattern: Pattern::Global("rawget"), category: Prototype, severity: High, message: "raw table access is not allowed" },
    Rule { name: "rawequal", pattern: Pattern::Global("rawequal"), category: Prototype, severity: Medium, message: "raw table access is not available" },
    Rule { name: "_G", pattern: Pattern::Global("_G"), category: Prototype, severity: High, message: "global environment access is not allowed" },
    Rule { name: "_ENV", pattern: Pattern::Global("_ENV"), category: Prototype, severity: High, message: "environment rebinding is not allowed" },
    Rule { name: "__index", pattern: Pattern::Global("__index"), category: Prototype, severity: Medium, message: "metamethod definitions have no effect" },
    Rule { name: "__newindex", pattern: Pattern::Global("__newindex"), category: Prototype, severity: Medium, message: "metamethod definitions have no effect" },
    Rule { name: "collectgarbage", pattern: Pattern::Global("collectgarbage"), category: Resource, severity: Medium, message: "garbage collector control is not available" },
    Rule { name: "coroutine", pattern: Pattern::Global("coroutine"), category: Resource, severity: Medium, message: "coroutines are not available" },
    Rule { name: "pcall", pattern: Pattern::Global("pcall"), category: Resource, severity: Medium, message: "protected calls are not available" },
    Rule { name: "xpcall", pattern: Pattern::Global("xpcall"), category: Resource, severity: Medium, message: "protected calls are not available" },
    Rule { name: "string.rep", pattern: Pattern::Member("string", "rep"), category: Resource, severity: Low, message: "large repetitions count against the memory limit" },
    Rule { name: "while-true", pattern: Pattern::Sequence(&["while", "true"]), category: Resource, severity: Low, message: "unbounded loop relies on the execution deadline" },
    Rule { name: "repeat-until-false", pattern: Pattern::Sequence(&["until", "false"]), category: Resource, severity: Low, message: "unbounded loop relies on the execution deadline" },
];

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    /// `.` or `:` used for field access or method calls
    Access,
    Other,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    line: usize,
}

/// Scan code for disallowed patterns
pub fn analyze(code: &str) -> Vec<Violation> {
    let tokens = tokenize(code);
    let mut violations: Vec<Violation> = Vec::new();

    for (i, token) in tokens.iter().enumerate() {
        let TokenKind::Ident(name) = &token.kind else {
            continue;
        };
        let is_field = i > 0 && tokens[i - 1].kind == TokenKind::Access;
        if is_field {
            continue;
        }

        let member = match (tokens.get(i + 1), tokens.get(i + 2)) {
            (Some(Token { kind: TokenKind::Access, .. }), Some(Token { kind: TokenKind::Ident(m), .. })) => Some(m.as_str()),
            _ => None,
        };

        let matched = RULES.iter().find(|rule| match &rule.pattern {
            Pattern::Member(obj, field) => name == obj && member == Some(*field),
            Pattern::Global(ident) => name == ident,
            Pattern::Sequence(words) => words.iter().enumerate().all(|(offset, word)| {
                matches!(tokens.get(i + offset), Some(Token { kind: TokenKind::Ident(w), .. }) if w == word)
            }),
        });

        if let Some(rule) = matched {
            let duplicate = violations.iter().any(|v| v.rule == rule.name && v.line == token.line);
            if !duplicate {
                violations.push(Violation {
                    rule: rule.name.to_string(),
                    category: rule.category,
                    severity: rule.severity,
                    message: rule.message.to_string(),
                    line: token.line,
                });
            }
        }
    }

    violations
}

/// Split Lua source into identifiers and access operators
fn tokenize(code: &str) -> Vec<Token> {
    let chars: Vec<char> = code.chars().collect();
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => {
                line += 1;
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            '-' if chars.get(i + 1) == Some(&'-') => {
                i += 2;
                if let Some((end, newlines)) = long_bracket(&chars, i) {
                    line += newlines;
                    i = end;
                } else {
                    while i < chars.len() && chars[i] != '\n' {
                        i += 1;
                    }
                }
            }
            '"' | '\'' => {
                i += 1;
                while i < chars.len() && chars[i] != c {
                    if chars[i] == '\\' {
                        if chars.get(i + 1) == Some(&'\n') {
                            line += 1;
                        }
                        i += 2;
                        continue;
                    }
                    if chars[i] == '\n' {
                        line += 1;
                    }
                    i += 1;
                }
                i += 1;
            }
            '[' => {
                if let Some((end, newlines)) = long_bracket(&chars, i) {
                    line += newlines;
                    i = end;
                } else {
                    tokens.push(Token { kind: TokenKind::Other, line });
                    i += 1;
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                tokens.push(Token { kind: TokenKind::Ident(ident), line });
            }
            c if c.is_ascii_digit() => {
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '.' || chars[i] == '_') {
                    i += 1;
                }
            }
            '.' if chars.get(i + 1) == Some(&'.') => {
                while i < chars.len() && chars[i] == '.' {
                    i += 1;
                }
                tokens.push(Token { kind: TokenKind::Other, line });
            }
            ':' if chars.get(i + 1) == Some(&':') => {
                tokens.push(Token { kind: TokenKind::Other, line });
                i += 2;
            }
            '.' | ':' => {
                tokens.push(Token { kind: TokenKind::Access, line });
                i += 1;
            }
            _ => {
                tokens.push(Token { kind: TokenKind::Other, line });
                i += 1;
            }
        }
    }

    tokens
}

/// If a long bracket (`[[`, `[==[`) opens at `start`, return the index after
/// its closing bracket and the newlines it spans
fn long_bracket(chars: &[char], start: usize) -> Option<(usize, usize)> {
    if chars.get(start) != Some(&'[') {
        return None;
    }
    let mut j = start + 1;
    let mut level = 0;
    while chars.get(j) == Some(&'=') {
        level += 1;
        j += 1;
    }
    if chars.get(j) != Some(&'[') {
        return None;
    }
    j += 1;

    let mut newlines = 0;
    while j < chars.len() {
        if chars[j] == '\n' {
            newlines += 1;
        }
        if chars[j] == ']' {
            let mut k = j + 1;
            let mut closing = 0;
            while chars.get(k) == Some(&'=') {
                closing += 1;
                k += 1;
            }
            if closing == level && chars.get(k) == Some(&']') {
                return Some((k + 1, newlines));
            }
        }
        j += 1;
    }
    Some((chars.len(), newlines))
}

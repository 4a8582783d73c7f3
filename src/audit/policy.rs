//! Pattern-based audit policy
//!
//! Two checks, reported in this order:
//! 1. forbidden call patterns, in table order, one violation per rule hit
//! 2. import allowlist, one violation per unexpected root module, in order of
//!    first appearance

use lazy_static::lazy_static;
use regex::{Regex, RegexBuilder};

use super::{AuditPolicy, AuditReport};

/// Forbidden operations as `(description, pattern)`.
///
/// Patterns are compiled case-insensitive and multi-line.
pub const DEFAULT_FORBIDDEN_PATTERNS: &[(&str, &str)] = &[
    // Dynamic evaluation
    ("dynamic evaluation via eval()", r"(?:^|[^\w.])eval\s*\("),
    ("dynamic evaluation via exec()", r"(?:^|[^\w.])exec\s*\("),
    ("dynamic evaluation via compile()", r"(?:^|[^\w.])compile\s*\("),
    ("reflective import via __import__()", r"__import__\s*\("),
    ("reflective import via importlib", r"\bimportlib\b"),

    // Process spawning / shell
    ("process spawning via import subprocess", r"\bimport\s+subprocess\b"),
    ("process spawning via from subprocess import", r"\bfrom\s+subprocess\s+import\b"),
    ("process spawning via subprocess.*", r"\bsubprocess\s*\."),
    ("shell execution via os.system()", r"\bos\s*\.\s*system\s*\("),
    ("shell execution via os.popen()", r"\bos\s*\.\s*popen\s*\("),
    ("process replacement via os.exec*()", r"\bos\s*\.\s*exec\w*\s*\("),
    ("process spawning via os.spawn*()", r"\bos\s*\.\s*spawn\w*\s*\("),
    ("process spawning via pty.spawn()", r"\bpty\s*\.\s*spawn\s*\("),

    // Destructive filesystem
    ("recursive delete via shutil.rmtree()", r"\bshutil\s*\.\s*rmtree\s*\("),
    ("recursive delete via os.removedirs()", r"\bos\s*\.\s*removedirs\s*\("),

    // Raw device / system paths
    ("raw device or system path access", r#"['"]/(?:dev|etc|proc|sys)/"#),

    // Shell metacharacter strings
    ("shell command string rm -rf", r"\brm\s+-rf\b"),
];

/// Root modules generated programs may import
pub const DEFAULT_ALLOWED_IMPORTS: &[&str] = &[
    // Networking, timing, data
    "requests",
    "time",
    "json",
    "os",
    "dotenv",
    "websocket",
    "web3",
    "pandas",

    // Market-data helpers shipped next to the sandbox
    "api_helpers",
    "polymarket",

    // Pure standard library helpers
    "math",
    "datetime",
    "typing",
    "dataclasses",
    "collections",
    "statistics",
    "__future__",
];

lazy_static! {
    static ref IMPORT_STMT: Regex =
        Regex::new(r"^\s*import\s+([^#;]+)").expect("valid import pattern");
    static ref FROM_STMT: Regex =
        Regex::new(r"^\s*from\s+(\S+)\s+import\b").expect("valid from-import pattern");
}

struct CompiledRule {
    description: String,
    source: String,
    regex: Regex,
}

/// Denylist + allowlist auditor over raw source text
pub struct PatternAuditor {
    rules: Vec<CompiledRule>,
    allowed_imports: Vec<String>,
}

impl Default for PatternAuditor {
    fn default() -> Self {
        let mut auditor = Self {
            rules: Vec::with_capacity(DEFAULT_FORBIDDEN_PATTERNS.len()),
            allowed_imports: DEFAULT_ALLOWED_IMPORTS.iter().map(|s| s.to_string()).collect(),
        };
        for (description, pattern) in DEFAULT_FORBIDDEN_PATTERNS {
            // Built-in patterns are known-good
            let _ = auditor.forbid(description, pattern);
        }
        auditor
    }
}

impl PatternAuditor {
    /// Create an auditor with the default rule set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a forbidden pattern
    pub fn forbid(&mut self, description: &str, pattern: &str) -> Result<&mut Self, regex::Error> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .multi_line(true)
            .build()?;
        self.rules.push(CompiledRule {
            description: description.to_string(),
            source: pattern.to_string(),
            regex,
        });
        Ok(self)
    }

    /// Add a root module to the allowlist
    pub fn allow_import(&mut self, module: &str) -> &mut Self {
        if !self.is_import_allowed(module) {
            self.allowed_imports.push(module.to_string());
        }
        self
    }

    /// Remove a root module from the allowlist
    pub fn deny_import(&mut self, module: &str) -> &mut Self {
        self.allowed_imports.retain(|m| m != module);
        self
    }

    /// Check a root module name against the allowlist
    pub fn is_import_allowed(&self, module: &str) -> bool {
        self.allowed_imports.iter().any(|m| m == module)
    }

    fn scan_patterns(&self, source: &str, violations: &mut Vec<String>) {
        for rule in &self.rules {
            if rule.regex.is_match(source) {
                violations.push(format!(
                    "Disallowed operation: {} (pattern: {})",
                    rule.description, rule.source
                ));
            }
        }
    }

    fn scan_imports(&self, source: &str, violations: &mut Vec<String>) {
        let mut reported: Vec<String> = Vec::new();
        let mut report = |name: String, violations: &mut Vec<String>| {
            if !reported.contains(&name) {
                violations.push(format!(
                    "Unexpected import: '{}' is not in the allowed module list",
                    name
                ));
                reported.push(name);
            }
        };

        for line in source.lines() {
            if let Some(caps) = FROM_STMT.captures(line) {
                let module = &caps[1];
                if module.starts_with('.') {
                    report(module.to_string(), violations);
                    continue;
                }
                let root = root_module(module);
                if !self.is_import_allowed(root) {
                    report(root.to_string(), violations);
                }
            } else if let Some(caps) = IMPORT_STMT.captures(line) {
                for item in caps[1].split(',') {
                    let Some(module) = item.split_whitespace().next() else {
                        continue;
                    };
                    let root = root_module(module.trim_end_matches(['(', ')', '\\']));
                    if root.is_empty() {
                        continue;
                    }
                    if !self.is_import_allowed(root) {
                        report(root.to_string(), violations);
                    }
                }
            }
        }
    }
}

impl AuditPolicy for PatternAuditor {
    fn audit(&self, source: &str) -> AuditReport {
        let mut violations = Vec::new();
        self.scan_patterns(source, &mut violations);
        self.scan_imports(source, &mut violations);
        AuditReport::new(violations)
    }
}

fn root_module(dotted: &str) -> &str {
    dotted.split('.').next().unwrap_or(dotted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::FALLBACK_PROGRAM;

    fn audit(source: &str) -> AuditReport {
        PatternAuditor::default().audit(source)
    }

    #[test]
    fn test_fallback_program_passes() {
        assert!(audit(FALLBACK_PROGRAM).is_clean());
    }

    #[test]
    fn test_allowlisted_imports_pass() {
        let source = "import os, json\nimport requests as rq\nfrom dotenv import load_dotenv\nfrom polymarket.api_helpers import fetch_markets\nimport pandas.io\n";
        assert!(audit(source).is_clean(), "{}", audit(source));
    }

    #[test]
    fn test_subprocess_rejected() {
        let report = audit("import subprocess\nsubprocess.run(['ls'])");
        assert!(!report.is_clean());
        assert!(report.violations().iter().any(|v| v.contains("subprocess")));
        assert!(report
            .violations()
            .iter()
            .any(|v| v.starts_with("Unexpected import: 'subprocess'")));
    }

    #[test]
    fn test_dynamic_evaluation_rejected() {
        assert!(!audit("x = eval('1+1')").is_clean());
        assert!(!audit("exec(code)").is_clean());
        assert!(!audit("compile('x', 'f', 'exec')").is_clean());
        assert!(!audit("m = __import__('socket')").is_clean());
        assert!(!audit("EVAL ('1')").is_clean());
    }

    #[test]
    fn test_method_names_not_confused_with_builtins() {
        assert!(audit("import pandas\ndf = pandas.DataFrame()\ndf.eval('a + b')").is_clean());
        assert!(audit("from api_helpers import place_order\nresult = literal_eval_like(1)").is_clean());
    }

    #[test]
    fn test_shell_and_destructive_calls_rejected() {
        assert!(!audit("import os\nos.system('ls')").is_clean());
        assert!(!audit("import os\nos.popen('ls')").is_clean());
        assert!(!audit("import os\nos.execv('/bin/sh', [])").is_clean());
        assert!(!audit("import shutil\nshutil.rmtree('/')").is_clean());
        assert!(!audit("cmd = 'rm -rf /tmp/x'").is_clean());
    }

    #[test]
    fn test_system_path_access_rejected() {
        let report = audit("with open('/etc/passwd') as f:\n    print(f.read())");
        assert_eq!(report.violations().len(), 1);
        assert!(report.violations()[0].contains("system path"));
        assert!(!audit("open(\"/dev/mem\", 'rb')").is_clean());
    }

    #[test]
    fn test_unexpected_imports_reported_once_in_order() {
        let report = audit("import socket\nimport sys, socket\nfrom urllib.request import urlopen");
        assert_eq!(
            report.violations(),
            &[
                "Unexpected import: 'socket' is not in the allowed module list".to_string(),
                "Unexpected import: 'sys' is not in the allowed module list".to_string(),
                "Unexpected import: 'urllib' is not in the allowed module list".to_string(),
            ]
        );
    }

    #[test]
    fn test_relative_import_reported() {
        let report = audit("from . import secrets");
        assert_eq!(report.violations().len(), 1);
        assert!(report.violations()[0].contains("'.'"));
    }

    #[test]
    fn test_audit_is_pure() {
        let source = "import subprocess\nimport sys\nos.system('x')";
        let auditor = PatternAuditor::default();
        assert_eq!(auditor.audit(source), auditor.audit(source));
    }

    #[test]
    fn test_custom_policy() {
        let mut auditor = PatternAuditor::new();
        auditor.allow_import("numpy").deny_import("pandas");
        auditor.forbid("network sockets", r"\bsocket\s*\.").unwrap();

        assert!(auditor.audit("import numpy").is_clean());
        assert!(!auditor.audit("import pandas").is_clean());
        assert!(!auditor.audit("import json\nx = socket.socket()").is_clean());
    }
}

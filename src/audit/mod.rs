//! Static audit of generated programs
//!
//! Every program is checked before it may reach the sandbox. The check is a
//! policy object behind [`AuditPolicy`] so the executor does not care how the
//! verdict is produced.
//!
//! ```text
//! source ──► AuditPolicy::audit ──► AuditReport
//!                                     │
//!                    empty ◄──────────┴──────────► violations
//!                      │                               │
//!                      ▼                               ▼
//!               SandboxExecutor                 Rejected (never spawned)
//! ```
//!
//! The default [`PatternAuditor`] is textual. It does not parse the program
//! and can be evaded by obfuscation (string concatenation, `getattr`
//! tricks, encoded payloads). It is a tripwire for honest model output, not
//! a containment boundary.

pub mod policy;

pub use policy::{PatternAuditor, DEFAULT_ALLOWED_IMPORTS, DEFAULT_FORBIDDEN_PATTERNS};

/// Result of auditing one program
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    violations: Vec<String>,
}

impl AuditReport {
    pub fn new(violations: Vec<String>) -> Self {
        Self { violations }
    }

    /// Violations in the order they were found
    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    /// True when the program may run
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

impl std::fmt::Display for AuditReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.violations.is_empty() {
            return write!(f, "Audit passed.");
        }
        write!(
            f,
            "Blocked execution: generated code violates the sandbox policy ({} issue{}):",
            self.violations.len(),
            if self.violations.len() == 1 { "" } else { "s" }
        )?;
        for violation in &self.violations {
            write!(f, "\n- {}", violation)?;
        }
        Ok(())
    }
}

/// A static policy applied to source text before execution
pub trait AuditPolicy: Send + Sync {
    /// Audit `source`. Must be pure: equal input yields equal reports.
    fn audit(&self, source: &str) -> AuditReport;
}

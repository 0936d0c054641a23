//! Per-tool shim profiles.
//!
//! The two shims share one lifecycle and differ only in what this profile
//! captures: the real tool to locate, the env override naming it, the
//! token-cost estimator, and the stderr diagnostic predicate.

use crate::cmdline;
use crate::stderr;

/// Everything tool-specific about a shim.
#[derive(Debug, Clone, Copy)]
pub struct ToolProfile {
    /// Tool label reported to the governor, e.g. "cl".
    pub tool: &'static str,
    /// Executable name of the real tool to locate.
    pub real_name: &'static str,
    /// Environment variable carrying an explicit path to the real tool.
    pub env_override: &'static str,
}

impl ToolProfile {
    /// The compiler shim profile.
    #[must_use]
    pub const fn cl() -> Self {
        Self {
            tool: "cl",
            real_name: "cl",
            env_override: "CL_REAL_PATH",
        }
    }

    /// The linker shim profile.
    #[must_use]
    pub const fn link() -> Self {
        Self {
            tool: "link",
            real_name: "link",
            env_override: "LINK_REAL_PATH",
        }
    }

    /// Estimated token cost for this invocation, clamped per tool.
    #[must_use]
    pub fn estimate_tokens(&self, args: &[String]) -> u32 {
        if self.is_linker() {
            cmdline::link_token_cost(args)
        } else {
            cmdline::compile_token_cost(args)
        }
    }

    /// Whether link-time code generation applies. `None` for the compiler,
    /// where the flag only changes object format, not link cost.
    #[must_use]
    pub fn ltcg(&self, args: &[String]) -> Option<bool> {
        self.is_linker().then(|| cmdline::is_ltcg(args))
    }

    /// Whether captured stderr counts as "the tool spoke for itself".
    #[must_use]
    pub fn stderr_has_diagnostics(&self, text: &str) -> bool {
        if self.is_linker() {
            stderr::linker_diagnostics(text)
        } else {
            stderr::compiler_diagnostics(text)
        }
    }

    fn is_linker(&self) -> bool {
        self.tool == "link"
    }
}

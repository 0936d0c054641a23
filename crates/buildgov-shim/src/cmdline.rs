//! Command-line analysis: token-cost heuristics, the argv hash, and
//! primary-source extraction.
//!
//! The cost heuristics are domain approximations, not ground truth; they
//! live in the shim rather than the governor so they can be tuned without
//! touching the admission core. Each estimator is a pure function of argv
//! with a documented clamp.

use sha2::{Digest, Sha256};

/// Clamp for compile costs.
pub const COMPILE_TOKEN_MIN: u32 = 1;
/// Upper clamp for compile costs.
pub const COMPILE_TOKEN_MAX: u32 = 8;
/// Lower clamp for link costs.
pub const LINK_TOKEN_MIN: u32 = 2;
/// Upper clamp for link costs.
pub const LINK_TOKEN_MAX: u32 = 12;

/// Path markers that predict template-heavy compiles worth an extra token.
const TEMPLATE_HEAVY_MARKERS: [&str; 3] = ["boost", "eigen", "spirit"];

/// Object-count threshold above which a link gets an extra token.
const LARGE_LINK_INPUTS: usize = 200;

/// Estimated token cost of a compiler invocation, clamped to
/// [`COMPILE_TOKEN_MIN`]`..=`[`COMPILE_TOKEN_MAX`].
///
/// One token per invocation, plus extra sources beyond the first (batched
/// `cl file1.cpp file2.cpp ...`), plus whole-program optimization, plus a
/// template-heavy path marker.
#[must_use]
pub fn compile_token_cost(args: &[String]) -> u32 {
    let sources = args.iter().filter(|a| is_source_file(a)).count() as u32;
    let mut cost = 1;
    if sources > 1 {
        cost += (sources - 1).min(3);
    }
    if args.iter().any(|a| flag_matches(a, "GL")) {
        cost += 1;
    }
    if args.iter().any(|a| {
        let lower = a.to_ascii_lowercase();
        TEMPLATE_HEAVY_MARKERS.iter().any(|m| lower.contains(m))
    }) {
        cost += 1;
    }
    cost.clamp(COMPILE_TOKEN_MIN, COMPILE_TOKEN_MAX)
}

/// Estimated token cost of a linker invocation, clamped to
/// [`LINK_TOKEN_MIN`]`..=`[`LINK_TOKEN_MAX`].
///
/// Link-time code generation triples the base cost: the backend re-runs
/// over every LTCG object at once. Full debug info and very large input
/// sets each add one.
#[must_use]
pub fn link_token_cost(args: &[String]) -> u32 {
    let mut cost = LINK_TOKEN_MIN;
    if is_ltcg(args) {
        cost *= 3;
    }
    if args.iter().any(|a| flag_matches(a, "DEBUG")) {
        cost += 1;
    }
    let inputs = args.iter().filter(|a| is_link_input(a)).count();
    if inputs > LARGE_LINK_INPUTS {
        cost += 1;
    }
    cost.clamp(LINK_TOKEN_MIN, LINK_TOKEN_MAX)
}

/// Whether link-time code generation is in effect (`/LTCG` on the link, or
/// `/GL` objects being passed through).
#[must_use]
pub fn is_ltcg(args: &[String]) -> bool {
    args.iter()
        .any(|a| flag_matches(a, "LTCG") || flag_matches(a, "GL"))
}

/// The first source-file argument, if any. Reported to the governor for
/// log correlation.
#[must_use]
pub fn primary_source(args: &[String]) -> Option<&str> {
    args.iter().find(|a| is_source_file(a)).map(String::as_str)
}

/// Stable short hash of the full argument vector, 12 hex chars.
///
/// Used only for logging and deduplication, so the truncation is fine.
#[must_use]
pub fn args_hash(args: &[String]) -> String {
    let mut hasher = Sha256::new();
    for arg in args {
        hasher.update(arg.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    digest[..6].iter().map(|b| format!("{b:02x}")).collect()
}

fn is_source_file(arg: &str) -> bool {
    let lower = arg.to_ascii_lowercase();
    [".cpp", ".cc", ".cxx", ".c"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}

fn is_link_input(arg: &str) -> bool {
    let lower = arg.to_ascii_lowercase();
    lower.ends_with(".obj") || lower.ends_with(".lib") || lower.ends_with(".o")
}

/// Matches `/NAME`, `-NAME`, and `/NAME:suffix` forms, ASCII
/// case-insensitively (MSVC accepts either prefix; linker flags are
/// case-insensitive).
fn flag_matches(arg: &str, name: &str) -> bool {
    let Some(body) = arg.strip_prefix('/').or_else(|| arg.strip_prefix('-')) else {
        return false;
    };
    let head = body.split(':').next().unwrap_or(body);
    head.eq_ignore_ascii_case(name)
}

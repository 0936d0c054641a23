//! Post-exit failure classifier.
//!
//! When a governed tool exits nonzero, the interesting question is whether
//! it hit an ordinary compile error or was killed by commit exhaustion;
//! the latter surfaces as cryptic aborts rather than a readable
//! out-of-memory message. [`classify`] combines the exit code, the commit
//! trajectory, the child's peak memory, and whether the tool said anything
//! on stderr into a monotone evidence score, then bands the score into a
//! verdict with retry advice.
//!
//! The weights and thresholds are empirical calibration data, carried in
//! [`ClassifierConfig`] rather than hardcoded at the call sites.

use serde::{Deserialize, Serialize};

use crate::memory::BYTES_PER_GIB;

/// Outcome label for a finished tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    /// Exit code zero.
    Success,
    /// Nonzero exit with the tool's own diagnostics on stderr and no
    /// memory-pressure evidence.
    NormalCompileError,
    /// Strong evidence the invocation died of commit exhaustion.
    #[serde(rename = "LikelyOOM")]
    LikelyOom,
    /// Moderate evidence: the host was likely thrashing or paging when the
    /// tool died.
    LikelyPagingDeath,
    /// Nonzero exit, silent stderr, no pressure evidence.
    Unknown,
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "Success",
            Self::NormalCompileError => "NormalCompileError",
            Self::LikelyOom => "LikelyOOM",
            Self::LikelyPagingDeath => "LikelyPagingDeath",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Evidence weights and thresholds for the classifier.
///
/// Defaults reflect field calibration on large C++ builds; treat them as a
/// starting point when the commit-accounting basis changes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifierConfig {
    /// Commit ratio at exit that scores [`Self::exit_ratio_hard_weight`].
    pub exit_ratio_hard: f64,
    /// Weight added when the exit-time commit ratio is at or above
    /// [`Self::exit_ratio_hard`].
    pub exit_ratio_hard_weight: f64,
    /// Commit ratio at exit that scores [`Self::exit_ratio_soft_weight`]
    /// when the hard threshold was not met.
    pub exit_ratio_soft: f64,
    /// Weight added when only the soft exit-ratio threshold is met.
    pub exit_ratio_soft_weight: f64,
    /// Peak commit ratio during execution that scores
    /// [`Self::peak_ratio_weight`].
    pub peak_ratio: f64,
    /// Weight added when the peak commit ratio threshold is met.
    pub peak_ratio_weight: f64,
    /// Per-process peak commit, in GiB, that scores
    /// [`Self::process_commit_weight`].
    pub process_commit_gb: f64,
    /// Weight added when the per-process peak commit threshold is met.
    pub process_commit_weight: f64,
    /// Weight added when the tool produced no diagnostics of its own.
    pub silent_stderr_weight: f64,
    /// Duration below which a heavy process counts as a fast failure, in
    /// milliseconds.
    pub fast_fail_ms: u64,
    /// Per-process peak commit, in GiB, above which a fast failure scores.
    pub fast_fail_commit_gb: f64,
    /// Weight added for a fast failure while holding significant commit.
    pub fast_fail_weight: f64,
    /// Evidence at or above which the verdict is [`Classification::LikelyOom`].
    pub oom_threshold: f64,
    /// Evidence at or above which the verdict is
    /// [`Classification::LikelyPagingDeath`].
    pub paging_threshold: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            exit_ratio_hard: 0.92,
            exit_ratio_hard_weight: 0.40,
            exit_ratio_soft: 0.88,
            exit_ratio_soft_weight: 0.25,
            peak_ratio: 0.95,
            peak_ratio_weight: 0.30,
            process_commit_gb: 2.5,
            process_commit_weight: 0.20,
            silent_stderr_weight: 0.20,
            fast_fail_ms: 5000,
            fast_fail_commit_gb: 1.5,
            fast_fail_weight: 0.15,
            oom_threshold: 0.60,
            paging_threshold: 0.40,
        }
    }
}

/// Everything the classifier looks at for one finished invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifyInput {
    /// Label of the tool that ran, e.g. "cl" or "link".
    pub tool: String,
    /// The tool's exit code.
    pub exit_code: i32,
    /// Wall-clock duration of the invocation, in milliseconds.
    pub duration_ms: u64,
    /// Host commit ratio observed at release time.
    pub commit_ratio_at_exit: f64,
    /// Max of the acquire-time and release-time commit ratios.
    pub peak_commit_ratio: f64,
    /// Peak committed bytes of the child process itself.
    pub peak_process_commit_bytes: u64,
    /// Whether stderr matched the tool's diagnostic predicate.
    pub stderr_had_diagnostics: bool,
    /// Host commit charge at release time, in bytes.
    pub commit_charge_bytes: u64,
    /// Host commit limit at release time, in bytes.
    pub commit_limit_bytes: u64,
    /// Parallelism recommendation from the current budget.
    pub recommended_parallelism: u32,
}

/// Verdict plus the evidence trail that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    /// The outcome label.
    pub classification: Classification,
    /// Accumulated evidence score in `[0, ~1.3]`.
    pub oom_evidence: f64,
    /// Human-facing diagnostic, present for OOM, paging-death, and unknown
    /// verdicts.
    pub message: Option<String>,
    /// Whether the caller should retry with fewer tokens.
    pub should_retry: bool,
}

/// Classifies one finished invocation.
///
/// Pure: same input and config always yield the same result. The evidence
/// score is monotone: raising the exit-time commit ratio or silencing
/// stderr never lowers it.
#[must_use]
pub fn classify(input: &ClassifyInput, config: &ClassifierConfig) -> ClassificationResult {
    if input.exit_code == 0 {
        return ClassificationResult {
            classification: Classification::Success,
            oom_evidence: 0.0,
            message: None,
            should_retry: false,
        };
    }

    let peak_process_gb = input.peak_process_commit_bytes as f64 / BYTES_PER_GIB as f64;
    let mut evidence = 0.0;
    let mut reasons: Vec<String> = Vec::new();

    if input.commit_ratio_at_exit >= config.exit_ratio_hard {
        evidence += config.exit_ratio_hard_weight;
        reasons.push(format!(
            "commit ratio at exit {:.2} >= {:.2}",
            input.commit_ratio_at_exit, config.exit_ratio_hard
        ));
    } else if input.commit_ratio_at_exit >= config.exit_ratio_soft {
        evidence += config.exit_ratio_soft_weight;
        reasons.push(format!(
            "commit ratio at exit {:.2} >= {:.2}",
            input.commit_ratio_at_exit, config.exit_ratio_soft
        ));
    }

    if input.peak_commit_ratio >= config.peak_ratio {
        evidence += config.peak_ratio_weight;
        reasons.push(format!(
            "peak commit ratio {:.2} >= {:.2} during execution",
            input.peak_commit_ratio, config.peak_ratio
        ));
    }

    if peak_process_gb >= config.process_commit_gb {
        evidence += config.process_commit_weight;
        reasons.push(format!(
            "process peaked at {:.1} GiB committed",
            peak_process_gb
        ));
    }

    if !input.stderr_had_diagnostics {
        evidence += config.silent_stderr_weight;
        reasons.push("tool was silent on stderr".to_string());
    }

    if input.duration_ms < config.fast_fail_ms && peak_process_gb >= config.fast_fail_commit_gb {
        evidence += config.fast_fail_weight;
        reasons.push(format!(
            "died after {} ms while holding {:.1} GiB",
            input.duration_ms, peak_process_gb
        ));
    }

    let (classification, message, should_retry) = if evidence >= config.oom_threshold {
        (
            Classification::LikelyOom,
            Some(diagnostic_message(
                input,
                "likely out-of-memory kill",
                &reasons,
                peak_process_gb,
            )),
            true,
        )
    } else if evidence >= config.paging_threshold {
        (
            Classification::LikelyPagingDeath,
            Some(diagnostic_message(
                input,
                "likely death by paging/thrashing",
                &reasons,
                peak_process_gb,
            )),
            true,
        )
    } else if input.stderr_had_diagnostics {
        (Classification::NormalCompileError, None, false)
    } else {
        (
            Classification::Unknown,
            Some(format!(
                "{} exited with code {} but the governor was unable to \
                 determine the cause",
                input.tool, input.exit_code
            )),
            false,
        )
    };

    ClassificationResult {
        classification,
        oom_evidence: evidence,
        message,
        should_retry,
    }
}

/// Formats the human-facing diagnostic for OOM / paging-death verdicts.
///
/// The message states the exit code, the commit figures at exit, the
/// child's peak, every reason that scored, and the parallelism
/// recommendation in the vocabulary of each common build driver.
fn diagnostic_message(
    input: &ClassifyInput,
    headline: &str,
    reasons: &[String],
    peak_process_gb: f64,
) -> String {
    let n = input.recommended_parallelism.max(1);
    let charge_gb = input.commit_charge_bytes as f64 / BYTES_PER_GIB as f64;
    let limit_gb = input.commit_limit_bytes as f64 / BYTES_PER_GIB as f64;
    format!(
        "{headline}: {tool} exited with code {code}\n\
         \x20 commit charge at exit: {charge_gb:.1} GiB / {limit_gb:.1} GiB \
         (ratio {ratio:.2})\n\
         \x20 peak process commit:   {peak_process_gb:.1} GiB\n\
         \x20 evidence: {reasons}\n\
         \x20 reduce build parallelism to {n}:\n\
         \x20   cmake:   --parallel {n}  (or CMAKE_BUILD_PARALLEL_LEVEL={n})\n\
         \x20   msbuild: /m:{n}\n\
         \x20   ninja/make: -j {n}",
        tool = input.tool,
        code = input.exit_code,
        ratio = input.commit_ratio_at_exit,
        reasons = reasons.join("; "),
    )
}

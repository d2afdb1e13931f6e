//! Compile pipeline: option resolution and external tool invocation.
//!
//! - `options` - toolchain/output-kind records and extension defaults
//! - `runner` - scratch-dir tool invocation and artifact readback

pub mod options;
pub mod runner;

pub use options::{CompileOptions, OutputKind, Toolchain};
pub use runner::{Compile, CompileRunner};

/// Outcome of one compile invocation.
///
/// Built fresh per invocation and broadcast by value; never mutated after
/// construction.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileResult {
    pub success: bool,
    pub output: String,
    /// Tool diagnostics, empty on success.
    pub error: String,
    /// The source text the result was produced from, echoed back verbatim.
    pub source_code: String,
    /// Resolved language tag (e.g. "c", "java"); empty when unresolvable.
    pub language: String,
}

impl CompileResult {
    pub fn success(output: impl Into<String>, source: impl Into<String>, language: &str) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: String::new(),
            source_code: source.into(),
            language: language.to_string(),
        }
    }

    pub fn failure(error: impl Into<String>, source: impl Into<String>, language: &str) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: error.into(),
            source_code: source.into(),
            language: language.to_string(),
        }
    }
}

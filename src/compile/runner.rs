//! External toolchain invocation.
//!
//! Each invocation writes the source into a private scratch directory,
//! runs the toolchain there, and reads the designated artifact back.
//! Non-zero exit becomes a failed [`CompileResult`] carrying the tool's
//! combined stdout/stderr verbatim; nothing here is retried or fatal.

use std::path::Path;

use crate::compile::{CompileOptions, CompileResult, OutputKind, Toolchain};
use crate::exec::{Cmd, combined_output};

/// Seam for the dispatcher and sessions: anything that can turn a source
/// file into a [`CompileResult`]. Production code uses [`CompileRunner`];
/// tests substitute a recording fake.
pub trait Compile: Send + Sync {
    fn compile(&self, file_name: &str, source: &str, options: &CompileOptions) -> CompileResult;
}

/// Runs the real toolchains. Stateless; safe to share across tasks.
pub struct CompileRunner;

impl Compile for CompileRunner {
    fn compile(&self, file_name: &str, source: &str, options: &CompileOptions) -> CompileResult {
        let language = options.toolchain.language();

        let scratch = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                return CompileResult::failure(
                    format!("failed to create scratch directory: {e}"),
                    source,
                    language,
                );
            }
        };

        let src_path = scratch.path().join(file_name);
        if let Err(e) = std::fs::write(&src_path, source) {
            return CompileResult::failure(
                format!("failed to stage source file: {e}"),
                source,
                language,
            );
        }

        let outcome = match options.toolchain {
            Toolchain::Clang => run_clang(scratch.path(), file_name, options),
            Toolchain::Javac => run_javac(scratch.path(), file_name, options),
        };

        match outcome {
            Ok(output) => CompileResult::success(output, source, language),
            Err(diagnostics) => CompileResult::failure(diagnostics, source, language),
        }
    }
}

/// clang -S [-emit-llvm] <src> -o <artifact>, then read the artifact.
fn run_clang(scratch: &Path, file_name: &str, options: &CompileOptions) -> Result<String, String> {
    let artifact_ext = match options.output {
        OutputKind::Asm => "s",
        _ => "ll",
    };
    let artifact = Path::new(file_name).with_extension(artifact_ext);

    let mut cmd = Cmd::new("clang").cwd(scratch).arg("-S");
    if options.output != OutputKind::Asm {
        cmd = cmd.arg("-emit-llvm");
    }
    let output = cmd
        .args(&options.flags)
        .arg(file_name)
        .arg("-o")
        .arg(&artifact)
        .run()
        .map_err(|e| e.to_string())?;

    if !output.status.success() {
        return Err(format!("compilation failed: {}", combined_output(&output)));
    }

    std::fs::read_to_string(scratch.join(&artifact))
        .map_err(|e| format!("failed to read {}: {e}", artifact.display()))
}

/// javac <src>, then javap -c -p -v on the resulting class.
fn run_javac(scratch: &Path, file_name: &str, options: &CompileOptions) -> Result<String, String> {
    let output = Cmd::new("javac")
        .cwd(scratch)
        .args(&options.flags)
        .arg(file_name)
        .run()
        .map_err(|e| e.to_string())?;

    if !output.status.success() {
        return Err(format!("compilation failed: {}", combined_output(&output)));
    }

    let class_name = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| format!("cannot derive class name from {file_name}"))?;

    let output = Cmd::new("javap")
        .cwd(scratch)
        .args(["-c", "-p", "-v"])
        .arg(&class_name)
        .run()
        .map_err(|e| e.to_string())?;

    if !output.status.success() {
        return Err(format!(
            "failed to get bytecode: {}",
            combined_output(&output)
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

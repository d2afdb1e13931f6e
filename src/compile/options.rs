//! Compile option records and file-extension defaults.

use std::path::Path;

use crate::protocol::ClientMessage;

/// Which external toolchain produces the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toolchain {
    /// clang, emitting LLVM IR or assembly
    Clang,
    /// javac + javap, emitting a bytecode listing
    Javac,
}

impl Toolchain {
    /// Language tag reported to viewers.
    pub fn language(self) -> &'static str {
        match self {
            Self::Clang => "c",
            Self::Javac => "java",
        }
    }

    /// Output kind used when the viewer did not pick one.
    pub fn default_kind(self) -> OutputKind {
        match self {
            Self::Clang => OutputKind::LlvmIr,
            Self::Javac => OutputKind::Bytecode,
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "clang" => Some(Self::Clang),
            "javac" => Some(Self::Javac),
            _ => None,
        }
    }

    /// Whether this toolchain can produce the given output kind.
    fn supports(self, kind: OutputKind) -> bool {
        match self {
            Self::Clang => matches!(kind, OutputKind::LlvmIr | OutputKind::Asm),
            Self::Javac => kind == OutputKind::Bytecode,
        }
    }
}

/// What the viewer wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    LlvmIr,
    Asm,
    Bytecode,
}

impl OutputKind {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "llvm-ir" => Some(Self::LlvmIr),
            "asm" => Some(Self::Asm),
            "bytecode" => Some(Self::Bytecode),
            _ => None,
        }
    }
}

/// Options in effect for one compile invocation.
///
/// A session replaces its own copy between compile cycles; nothing mutates
/// another session's copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    pub toolchain: Toolchain,
    pub output: OutputKind,
    /// Extra flags passed to the compiler, in order.
    pub flags: Vec<String>,
}

impl CompileOptions {
    /// Extension-derived defaults. `None` means the file type is
    /// unsupported and no tool must be invoked.
    pub fn defaults_for(file_name: &str) -> Option<Self> {
        let ext = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())?
            .to_ascii_lowercase();

        let toolchain = match ext.as_str() {
            "c" => Toolchain::Clang,
            "java" => Toolchain::Javac,
            _ => return None,
        };

        Some(Self {
            toolchain,
            output: toolchain.default_kind(),
            flags: Vec::new(),
        })
    }

    /// Apply a viewer's option-update on top of these options.
    ///
    /// Unset fields keep their current value. Unrecognized tool or output
    /// names are ignored rather than failing the session; an output kind
    /// the selected toolchain cannot produce falls back to that
    /// toolchain's default.
    pub fn apply(&self, update: &ClientMessage) -> Self {
        let ClientMessage::Options {
            compiler,
            output_kind,
            flags,
        } = update;

        let mut next = self.clone();

        if let Some(name) = compiler {
            match Toolchain::parse(name) {
                Some(toolchain) => next.toolchain = toolchain,
                None => crate::debug!("compile"; "ignoring unknown compiler: {}", name),
            }
        }
        if let Some(name) = output_kind {
            match OutputKind::parse(name) {
                Some(kind) => next.output = kind,
                None => crate::debug!("compile"; "ignoring unknown output kind: {}", name),
            }
        }
        if let Some(flags) = flags {
            next.flags = flags.clone();
        }

        if !next.toolchain.supports(next.output) {
            next.output = next.toolchain.default_kind();
        }

        next
    }

    /// Build options from an update alone, for files whose extension has
    /// no defaults. The update must name a recognizable toolchain.
    pub fn from_update(update: &ClientMessage) -> Option<Self> {
        let ClientMessage::Options {
            compiler,
            output_kind,
            flags,
        } = update;

        let toolchain = Toolchain::parse(compiler.as_deref()?)?;
        let mut options = Self {
            toolchain,
            output: toolchain.default_kind(),
            flags: flags.clone().unwrap_or_default(),
        };
        if let Some(kind) = output_kind.as_deref().and_then(OutputKind::parse)
            && toolchain.supports(kind)
        {
            options.output = kind;
        }
        Some(options)
    }
}

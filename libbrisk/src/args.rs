//! Link options consumed by the core passes. The command-line driver (out of
//! scope here) parses the option table into this structure.

#[derive(Debug)]
pub struct Args {
    pub output_kind: OutputKind,
    pub entry: Option<String>,

    /// Symbols named by `--undefined`. They act as roots for the liveness
    /// sweep and may drag archive members into the link.
    pub undefined: Vec<String>,

    /// Symbols named by `--require-defined`. Like `undefined`, but it is an
    /// error if the symbol is still undefined once resolution completes.
    pub require_defined: Vec<String>,

    /// `--defsym=name=expr` pairs. The right-hand side is either a hex or
    /// decimal literal or the name of another symbol.
    pub defsyms: Vec<(String, String)>,

    /// Compiled version-script clauses, in script order.
    pub version_patterns: Vec<VersionPattern>,

    /// Version names introduced by the script, in definition order. Index `i`
    /// corresponds to version index `i + VER_NDX_LAST_RESERVED + 1`.
    pub version_definitions: Vec<String>,

    pub soname: Option<String>,
    pub dynamic_linker: Option<String>,
    pub b_symbolic: bool,
    pub b_symbolic_functions: bool,
    pub eh_frame_hdr: bool,
    pub hash_style_sysv: bool,
    pub hash_style_gnu: bool,
    pub build_id: BuildIdOption,
    pub repro: bool,
    pub z_relro: bool,

    /// Archive basenames (or "ALL") whose members should not have their
    /// symbols exported to the dynamic symbol table.
    pub exclude_libs: Vec<String>,

    /// GNU property feature bits every input is expected to carry; inputs
    /// missing one only produce a warning.
    pub required_features: u32,

    pub image_base: u64,

    /// The original command line, kept so it can be recorded in `.comment`
    /// when debugging is requested.
    pub cmdline: Vec<String>,
}

impl Default for Args {
    fn default() -> Args {
        Args {
            output_kind: OutputKind::Executable,
            entry: Some("_start".to_owned()),
            undefined: Vec::new(),
            require_defined: Vec::new(),
            defsyms: Vec::new(),
            version_patterns: Vec::new(),
            version_definitions: Vec::new(),
            soname: None,
            dynamic_linker: Some("/lib64/ld-linux-x86-64.so.2".to_owned()),
            b_symbolic: false,
            b_symbolic_functions: false,
            eh_frame_hdr: true,
            hash_style_sysv: false,
            hash_style_gnu: true,
            build_id: BuildIdOption::None,
            repro: false,
            z_relro: true,
            exclude_libs: Vec::new(),
            required_features: 0,
            image_base: 0x200000,
            cmdline: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// A non-relocatable executable loaded at a fixed address.
    Executable,
    PositionIndependentExecutable,
    SharedObject,
}

impl OutputKind {
    pub fn is_executable(self) -> bool {
        !matches!(self, OutputKind::SharedObject)
    }

    pub fn is_shared_object(self) -> bool {
        matches!(self, OutputKind::SharedObject)
    }

    /// Whether the output's code must avoid absolute addresses.
    pub fn is_pic(self) -> bool {
        !matches!(self, OutputKind::Executable)
    }
}

/// One version-script clause. Literal names (no glob metacharacters) are kept
/// separate from glob patterns so they can be bound by hash lookup.
#[derive(Debug, Clone)]
pub struct VersionPattern {
    pub ver_idx: u16,
    pub patterns: Vec<String>,
    pub cpp_patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildIdOption {
    None,
    Fast,
    Uuid,
    Sha1,
    Hex(Vec<u8>),
}

impl BuildIdOption {
    pub(crate) fn hash_size(&self) -> usize {
        match self {
            BuildIdOption::None => 0,
            BuildIdOption::Fast => 8,
            BuildIdOption::Uuid => 16,
            BuildIdOption::Sha1 => 20,
            BuildIdOption::Hex(bytes) => bytes.len(),
        }
    }
}

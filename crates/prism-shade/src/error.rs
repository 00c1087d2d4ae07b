/// Errors produced while assembling or decoding kernel bytecode.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShadeError {
    #[error("line {line}: {message}")]
    Syntax { line: u32, message: String },

    #[error("line {line}: undefined macro ${name}")]
    UndefinedMacro { line: u32, name: String },

    #[error("entry point '{entry}' not found")]
    EntryNotFound { entry: String },

    #[error("bytecode truncated")]
    Truncated,

    #[error("bad container magic 0x{found:08X}")]
    BadMagic { found: u32 },

    #[error("unsupported container version {found}")]
    UnsupportedVersion { found: u32 },

    #[error("malformed bytecode: {message}")]
    Malformed { message: String },
}

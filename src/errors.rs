use thiserror::Error;

pub type Result<T> = std::result::Result<T, PatchError>;

/// Errors produced while editing a Mach-O image.
///
/// Every kind is fatal to the current run: the mapping is released, nothing
/// is retried, and the error is reported as-is.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("unsupported image: magic {0:#010x} is not a 64-bit little-endian Mach-O")]
    UnsupportedImage(u32),
    #[error("load command {index} extends past sizeofcmds")]
    TruncatedCommands { index: u32 },
    #[error("malformed image: {0}")]
    MalformedImage(&'static str),
    #[error("no LC_DYLD_INFO_ONLY load command")]
    MissingDyldInfo,
    #[error("malformed uleb128: stream ends before a terminator byte")]
    MalformedLeb,
    #[error("uleb128 does not fit in 64 bits")]
    LebOverflow,
    #[error("uleb128 needs {needed} byte(s) but only {reserved} are reserved")]
    LebTooLong { needed: usize, reserved: usize },
    #[error("not enough space after load commands: need {needed} byte(s), have {available}")]
    InsufficientHeaderSpace { needed: usize, available: usize },
    #[error("load command tail at offset {0:#x} is not zero padded")]
    HeaderNotZeroPadded(usize),
    #[error("dylib ordinal {0} does not fit in an immediate opcode")]
    OrdinalOutOfImmRange(u64),
    #[error("hook dylib {0:?} is not a load command of the target")]
    UnknownHookDylib(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Layout(#[from] scroll::Error),
    #[error(transparent)]
    Object(#[from] goblin::error::Error),
}

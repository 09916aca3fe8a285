use std::string::FromUtf8Error;

/// DBGp protocol error codes understood by IDEs.
const CODE_INVALID_OPTIONS: u32 = 3;
const CODE_UNIMPLEMENTED: u32 = 4;
const CODE_BREAKPOINT_SET_FAILED: u32 = 200;
const CODE_BREAKPOINT_TYPE_UNSUPPORTED: u32 = 201;
const CODE_EVAL_FAILED: u32 = 205;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- initialization errors -------------------------------------
    #[error("instrumentation file malformed: {0}")]
    InstrumentationMalformed(String),
    #[error("duplicate instrumentation mapping for `{0}`")]
    DuplicateMapping(String),
    #[error("replay handshake: {0}")]
    ReplayHandshake(&'static str),

    // --------------------------------- session errors --------------------------------------------
    #[error("gdb: {0}")]
    NativeDbg(String),
    #[error("gdb session closed")]
    GdbClosed,
    #[error("mi output unparsable: {0}")]
    MiParse(String),
    #[error("ide protocol: {0}")]
    IdeProtocol(String),
    #[error("breakpoint invalid: {0}")]
    BreakpointInvalid(String),
    #[error("unsupported breakpoint type `{0}`")]
    BreakpointTypeUnsupported(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    // --------------------------------- transparent wrappers --------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, nix::Error),
    #[error(transparent)]
    FromUtf8(#[from] FromUtf8Error),
    #[error("packet data is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl Error {
    /// Return a hint to the callers - whether the session can continue after
    /// this error or is beyond recovery.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::NativeDbg(_) => false,
            Error::MiParse(_) => false,
            Error::IdeProtocol(_) => false,
            Error::BreakpointInvalid(_) => false,
            Error::BreakpointTypeUnsupported(_) => false,
            Error::IO(_) => false,
            Error::FromUtf8(_) => false,
            Error::Base64(_) => false,

            // initialization failures abort the bridge before a session exists
            Error::InstrumentationMalformed(_) => true,
            Error::DuplicateMapping(_) => true,
            Error::ReplayHandshake(_) => true,
            Error::Syscall(_, _) => true,
            Error::GdbClosed => true,
            Error::InvariantViolation(_) => true,
        }
    }

    /// True for errors that should be answered with a DBGp `<error>` response
    /// instead of tearing the IDE connection down.
    pub fn is_protocol_answerable(&self) -> bool {
        matches!(
            self,
            Error::NativeDbg(_)
                | Error::BreakpointInvalid(_)
                | Error::BreakpointTypeUnsupported(_)
                | Error::Base64(_)
                | Error::FromUtf8(_)
        )
    }

    /// DBGp error code used when this error is reported back to the IDE.
    pub fn dbgp_code(&self) -> u32 {
        match self {
            Error::BreakpointInvalid(_) => CODE_BREAKPOINT_SET_FAILED,
            Error::BreakpointTypeUnsupported(_) => CODE_BREAKPOINT_TYPE_UNSUPPORTED,
            Error::NativeDbg(_) => CODE_EVAL_FAILED,
            Error::Base64(_) | Error::FromUtf8(_) => CODE_INVALID_OPTIONS,
            _ => CODE_UNIMPLEMENTED,
        }
    }
}

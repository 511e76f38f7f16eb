//! The module containing the [`ErrorCode`] type.

use thiserror_no_std::Error;

/// The error type shared by every fallible initialization path of this crate.
///
/// VM-exit handlers never return this type; architectural violations are
/// injected back into the guest instead (see the `vmexit` module).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The page pool ran out of memory.
    #[error("not enough memory")]
    NotEnoughMemory,

    /// A caller-supplied parameter was malformed.
    #[error("invalid argument")]
    InvalidArgument,

    /// The requested operation does not apply to this object.
    #[error("not supported")]
    NotSupported,

    /// The processor does not implement a required VMX/EPT capability.
    #[error("feature unavailable")]
    FeatureUnavailable,

    /// A VMX instruction failed. Contains the VM-instruction error number.
    ///
    /// See: 31.4 VM INSTRUCTION ERROR NUMBERS
    #[error("VMX instruction error {0}")]
    VmxInstructionError(u32),
}

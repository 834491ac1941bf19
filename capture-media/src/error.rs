// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

//! Error types for the capture pipeline.
//!
//! Every failure the pipeline can report synchronously is a variant of
//! [`Error`]. Errors raised on the dispatch worker never reach a caller; they
//! are logged and dropped there. At the host boundary each error is reduced to
//! a 32-bit status code with [`Error::code`].

/// Convenience result type using [`Error`] as the error variant.
pub type Result<T> = core::result::Result<T, Error>;

/// Host status code for success.
pub const STATUS_OK: i32 = 0;

// Status codes reported to the host. Values follow the platform media
// framework so existing host-side handling keeps working.
const E_INVALIDARG: u32 = 0x8007_0057;
const E_OUTOFMEMORY: u32 = 0x8007_000E;
const E_UNEXPECTED: u32 = 0x8000_FFFF;
const E_NOT_VALID_STATE: u32 = 0x8007_139F;
const ERROR_CANCELLED: u32 = 0x8007_04C7;
const ERROR_TIMEOUT: u32 = 0x8007_05B4;
const ERROR_INVALID_INDEX: u32 = 0x8007_0585;
const MF_E_INVALIDREQUEST: u32 = 0xC00D_36B2;
const MF_E_INVALIDSTREAMNUMBER: u32 = 0xC00D_36B3;
const MF_E_INVALIDMEDIATYPE: u32 = 0xC00D_36B4;
const MF_E_NOTACCEPTING: u32 = 0xC00D_36B5;
const MF_E_NOT_FOUND: u32 = 0xC00D_36D5;
const MF_E_SHUTDOWN: u32 = 0xC00D_3E85;
const MF_E_STREAMSINK_EXISTS: u32 = 0xC00D_4A3B;

/// Errors that can occur in the capture pipeline.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// An argument was null, empty, or out of range.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not valid in the component's current lifecycle state
    /// (for example a sample delivered to a paused stream).
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The component has been shut down.
    #[error("Shut down")]
    ShutDown,

    /// The stream has no outstanding sample request, or has reached end of
    /// stream, and cannot take another sample.
    #[error("Not accepting samples")]
    NotAccepting,

    /// A lookup missed (stream, locator, device, attribute).
    #[error("Not found: {0}")]
    NotFound(String),

    /// A stream with this identifier is already registered.
    #[error("Stream {0} already exists")]
    AlreadyExists(u32),

    /// No stream with this identifier is registered.
    #[error("Invalid stream number {0}")]
    InvalidStreamNumber(u32),

    /// An index-based lookup was out of range.
    #[error("Invalid index {0}")]
    InvalidIndex(usize),

    /// The offered media type does not match the stream's format.
    #[error("Invalid media type")]
    InvalidMediaType,

    /// The camera view transform cannot be inverted.
    #[error("Singular transform")]
    SingularTransform,

    /// Calibration blobs are missing, malformed, or carry no transforms.
    #[error("Invalid calibration: {0}")]
    InvalidCalibration(String),

    /// Allocation of a device, texture, handle, or instance slot failed.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A platform call failed with its own status code.
    #[error("Platform error {code:#010x}: {message}")]
    Platform {
        /// Raw platform status code.
        code: i32,
        /// Human readable description from the platform.
        message: String,
    },

    /// The operation was preempted by shutdown or a competing request.
    #[error("Canceled")]
    Canceled,

    /// A bounded wait elapsed before the operation completed.
    #[error("Timeout")]
    Timeout,

    /// A generic error for failures without a dedicated variant.
    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Returns the host status code reported for this error.
    ///
    /// The host only ever receives these translated codes, never a raw error
    /// value, except for [`Error::Platform`] whose code is passed through.
    ///
    /// # Examples
    ///
    /// ```
    /// use capture_media::Error;
    ///
    /// assert_eq!(Error::ShutDown.code(), 0xC00D_3E85_u32 as i32);
    /// assert!(Error::Canceled.code() < 0);
    /// ```
    pub fn code(&self) -> i32 {
        let code = match self {
            Error::InvalidArgument(_) => E_INVALIDARG,
            Error::InvalidState(_) => MF_E_INVALIDREQUEST,
            Error::ShutDown => MF_E_SHUTDOWN,
            Error::NotAccepting => MF_E_NOTACCEPTING,
            Error::NotFound(_) => MF_E_NOT_FOUND,
            Error::AlreadyExists(_) => MF_E_STREAMSINK_EXISTS,
            Error::InvalidStreamNumber(_) => MF_E_INVALIDSTREAMNUMBER,
            Error::InvalidIndex(_) => ERROR_INVALID_INDEX,
            Error::InvalidMediaType => MF_E_INVALIDMEDIATYPE,
            Error::SingularTransform | Error::InvalidCalibration(_) => E_NOT_VALID_STATE,
            Error::ResourceExhausted(_) => E_OUTOFMEMORY,
            Error::Platform { code, .. } => return *code,
            Error::Canceled => ERROR_CANCELLED,
            Error::Timeout => ERROR_TIMEOUT,
            Error::Other(_) => E_UNEXPECTED,
        };
        code as i32
    }

    /// Converts a host status code into a [`Result`].
    ///
    /// Non-negative codes are success. Negative codes become
    /// [`Error::Platform`] carrying the original value.
    pub fn from_status(status: i32) -> Result<()> {
        if status >= STATUS_OK {
            Ok(())
        } else {
            Err(Error::Platform {
                code: status,
                message: "platform call failed".to_string(),
            })
        }
    }

    /// Builds the error reported when a mutex guarding `what` is poisoned.
    pub(crate) fn poisoned(what: &str) -> Self {
        Error::Other(format!("{what} lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_failures() {
        let errors = [
            Error::InvalidArgument("x".into()),
            Error::InvalidState("x".into()),
            Error::ShutDown,
            Error::NotAccepting,
            Error::NotFound("x".into()),
            Error::AlreadyExists(1),
            Error::InvalidStreamNumber(1),
            Error::InvalidIndex(3),
            Error::InvalidMediaType,
            Error::SingularTransform,
            Error::InvalidCalibration("x".into()),
            Error::ResourceExhausted("x".into()),
            Error::Canceled,
            Error::Timeout,
            Error::Other("x".into()),
        ];
        for error in errors {
            assert!(error.code() < 0, "{error} should map to a failure code");
        }
    }

    #[test]
    fn platform_code_passes_through() {
        let error = Error::Platform {
            code: -5,
            message: "device removed".into(),
        };
        assert_eq!(error.code(), -5);
        assert!(matches!(
            Error::from_status(-5),
            Err(Error::Platform { code: -5, .. })
        ));
        assert_eq!(Error::from_status(0), Ok(()));
    }
}

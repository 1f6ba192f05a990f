//! attendance-core — Recognition outcome classification and upload validation.
//!
//! Everything here is pure: the recognition process itself is run by
//! `attendance-runner`, and this crate only interprets what it reported.

pub mod outcome;
pub mod protocol;
pub mod upload;

pub use outcome::{classify, Classification, DecidedBy, OutcomeKind, RunReport, SuccessDetails, SuccessPolicy};
pub use upload::{validate_upload, ImageKind, UploadError, MAX_UPLOAD_BYTES};

//! Shared retry policy with exponential backoff and jitter.
//!
//! One policy type serves every upstream call site (transcription, analysis,
//! JWKS refresh). Errors decide their own fate through [`Retryable`]:
//! transport faults are retried, provider-reported validation errors are
//! terminal on the first attempt.

pub mod retry;

pub use retry::{with_retry, Retryable, RetryPolicy};

//! Outer surfaces: the in-process facade and the C ABI built on it.

pub mod ffi;
pub mod service;

pub use service::{RetrainCore, SubmitReceipt, TickReport};

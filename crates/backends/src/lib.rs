//! Image generation backends.
//!
//! Every backend implements [`GenerationBackend`]: one request in, one
//! decoded image or a typed [`BackendError`] out. Two variants ship:
//!
//! - [`remote::RemoteService`] -- an HTTP inference service.
//! - [`local::LocalEngine`] -- a lazily loaded inference pipeline on the
//!   local accelerator, gated by the memory accountant. The shipped
//!   pipeline ([`command::CommandLoader`]) drives an external
//!   stable-diffusion executable.

pub mod backend;
pub mod command;
pub mod error;
pub mod local;
pub mod remote;

pub use backend::GenerationBackend;
pub use error::BackendError;
pub use local::LocalEngine;
pub use remote::RemoteService;

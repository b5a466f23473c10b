//! Sandbox runtime for open-inspect.
//!
//! Three cooperating pieces live in this crate:
//!
//! - [`supervisor`]: owns the agent and bridge processes inside a sandbox,
//!   restarting the bridge on crash with capped exponential backoff.
//! - [`bridge`]: executes control-plane commands (prompt, push) against the
//!   local git checkout and the coding agent.
//! - [`image_builder`]: drives image builds by tailing the build sandbox's JSON
//!   logs and reporting the outcome through an authenticated callback.
//!
//! Every service-to-service call is authenticated with the HMAC tokens in
//! [`auth`].

pub mod auth;
pub mod bridge;
pub mod callback;
pub mod clock;
pub mod errors;
pub mod image_builder;
pub mod process;
pub mod supervisor;
pub mod tools;

pub use auth::{generate_internal_token, verify_internal_token};
pub use callback::{CallbackConfig, CallbackRetrier};
pub use errors::{SandboxError, SandboxResult};

//! The ncps core library.
//!
//! Shared types used by both the server and the admin binary: chunking,
//! hashing, signing, error types, and stream utilities.

#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

pub mod chunking;
pub mod error;
pub mod hash;
pub mod mime;
pub mod signing;
#[cfg(feature = "stream")]
pub mod stream;
#[cfg(feature = "tokio")]
pub mod util;

pub use error::{CoreError, CoreResult};

//! Common types shared by the token agent crates

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};

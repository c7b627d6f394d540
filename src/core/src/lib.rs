//! Shared kolite types: errors, cancellation, configuration, references,
//! platforms, and image names.

pub mod cancel;
pub mod config;
pub mod error;
pub mod name;
pub mod platform;
pub mod reference;

pub use cancel::CancelToken;
pub use error::{KoError, Result};
pub use name::ImageName;
pub use platform::Platform;
pub use reference::Reference;

pub mod cancel;
pub mod crypto;
pub mod error;
pub mod presentation;
pub mod traits;
pub mod types;

pub use cancel::*;
pub use crypto::*;
pub use error::*;
pub use presentation::*;
pub use traits::*;
pub use types::*;

pub mod errors;
pub mod events;
pub mod limits;
pub mod photos;
pub mod progress;
pub mod sanitize;
pub mod verdict;

pub use errors::{VerificationError, VerificationErrorKind};
pub use verdict::{validate, Verdict};

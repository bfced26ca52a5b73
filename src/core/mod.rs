//! Core constants, identifiers, errors and traits (always included).

mod constants;
mod error;
mod ids;
mod traits;

pub use constants::*;
pub use error::*;
pub use ids::*;
pub use traits::*;

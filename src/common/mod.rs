pub mod errors;
pub mod guard;
pub mod logger;
pub mod types;

pub use errors::*;
pub use guard::*;
pub use types::*;

pub mod paths;
pub mod store;

pub use paths::*;
pub use store::*;

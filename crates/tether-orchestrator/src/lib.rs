pub mod errors;
pub mod executor;
pub mod hierarchy;
pub mod lifecycle;
pub mod registry;
pub mod testing;

pub use errors::*;
pub use executor::*;
pub use hierarchy::*;
pub use lifecycle::*;
pub use registry::*;

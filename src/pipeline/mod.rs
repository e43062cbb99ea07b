//! Pipeline module - task construction and the incremental sync pass.

mod configurator;
mod sync;

pub use configurator::*;
pub use sync::*;

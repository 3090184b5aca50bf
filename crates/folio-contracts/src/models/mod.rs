mod registry;
mod selectors;

pub use registry::{Capability, ModelRegistry, ModelSpec, Provider};
pub use selectors::{ModelSelection, ModelSelector};

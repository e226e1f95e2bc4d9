mod classifier;
mod presets;

pub use classifier::*;
pub use presets::*;

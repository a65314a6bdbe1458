pub mod loader;
pub mod types;

pub use loader::{load_targets_file, resolve_options, PipelineLoader};
pub use types::{CapPolicy, PipelineConfig, RunOptions, SkillConfig};

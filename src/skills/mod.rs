pub mod catalog;
pub mod dns_resolve;
pub mod echo;
pub mod registry;

pub use registry::SkillRegistry;

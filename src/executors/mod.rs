pub mod command;
pub mod emitter;
pub mod inprocess;
pub mod lines;
pub mod runners;
pub mod toolchain;

pub use command::{SkillInputs, SpawnedSkill};
pub use emitter::Emitter;
pub use inprocess::{InProcessSkill, SkillHandler};
pub use runners::{execute, CellStatus, ExecOutcome, Gate, Limits, Skill, SkillContext};

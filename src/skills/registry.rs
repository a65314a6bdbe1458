use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::{catalog, dns_resolve, echo};
use crate::config::{PipelineConfig, SkillConfig};
use crate::core::errors::PipelineError;
use crate::core::scheduler::Stage;
use crate::executors::{InProcessSkill, Skill, SkillInputs, SpawnedSkill};

/// Where a registered skill came from. Later sources override earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SkillSource {
    Catalog,
    Builtin,
    Pipeline,
}

/// Skills addressable by id.
#[derive(Default)]
pub struct SkillRegistry {
    skills: BTreeMap<String, (SkillSource, Arc<dyn Skill>)>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding only the in-process built-ins.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            SkillSource::Builtin,
            Arc::new(InProcessSkill::new(dns_resolve::ID, Arc::new(dns_resolve::DnsResolve))),
        );
        registry.register(
            SkillSource::Builtin,
            Arc::new(InProcessSkill::new(echo::ID, Arc::new(echo::Echo))),
        );
        registry
    }

    /// Resolution order, highest first: the pipeline `skills` table, the
    /// built-ins, then scripts discovered under `skills_dir`.
    pub fn from_pipeline(pipeline: &PipelineConfig, skills_dir: Option<&Path>) -> Result<Self> {
        let mut registry = Self::new();

        if let Some(dir) = skills_dir {
            for manifest in catalog::discover(dir)? {
                registry.register(SkillSource::Catalog, Arc::new(manifest.to_spawned()));
            }
        }

        for (id, (source, skill)) in Self::builtin().skills {
            registry.insert(id, source, skill);
        }

        for (id, config) in &pipeline.skills {
            let skill = spawned_from_config(id, config)
                .with_context(|| format!("Invalid definition for skill {:?}", id))?;
            registry.register(SkillSource::Pipeline, Arc::new(skill));
        }

        registry.log_summary();
        Ok(registry)
    }

    pub fn register(&mut self, source: SkillSource, skill: Arc<dyn Skill>) {
        let id = skill.id().to_string();
        self.insert(id, source, skill);
    }

    fn insert(&mut self, id: String, source: SkillSource, skill: Arc<dyn Skill>) {
        if let Some((previous, _)) = self.skills.get(&id) {
            tracing::debug!("Skill {} from {:?} overrides {:?}", id, source, previous);
        }
        self.skills.insert(id, (source, skill));
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Skill>> {
        self.skills.get(id).map(|(_, skill)| Arc::clone(skill))
    }

    pub fn source(&self, id: &str) -> Option<SkillSource> {
        self.skills.get(id).map(|(source, _)| *source)
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    /// Bind every stage's skill references, failing on the first unknown id.
    pub fn resolve_stages(&self, pipeline: &PipelineConfig) -> Result<Vec<Stage>, PipelineError> {
        pipeline
            .stages
            .iter()
            .map(|stage| {
                let skills = stage
                    .skills
                    .iter()
                    .map(|id| {
                        tracing::debug!("Stage {} uses {} ({:?})", stage.name, id, self.source(id));
                        self.get(id).ok_or_else(|| PipelineError::UnknownSkill {
                            stage: stage.name.clone(),
                            skill: id.clone(),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Stage {
                    name: stage.name.clone(),
                    destructive: stage.destructive,
                    skills,
                })
            })
            .collect()
    }

    fn log_summary(&self) {
        let count = |wanted: SkillSource| {
            self.skills.values().filter(|(source, _)| *source == wanted).count()
        };
        tracing::info!(
            "Skill registry: {} total ({} pipeline, {} builtin, {} catalog)",
            self.len(),
            count(SkillSource::Pipeline),
            count(SkillSource::Builtin),
            count(SkillSource::Catalog)
        );
    }
}

/// Turn a pipeline `skills` entry into a spawned skill.
pub fn spawned_from_config(id: &str, config: &SkillConfig) -> Result<SpawnedSkill> {
    let mut words = shell_words::split(&config.command)
        .with_context(|| format!("Failed to split command {:?}", config.command))?;
    if words.is_empty() {
        anyhow::bail!("command is empty");
    }
    let program = words.remove(0);
    words.extend(config.args.iter().cloned());

    let inputs = match &config.inputs {
        Some(names) => SkillInputs::from_names(names),
        None => SkillInputs::all(),
    };

    Ok(SpawnedSkill::new(id, program, words)
        .with_env(config.env.clone())
        .with_inputs(inputs)
        .with_cwd(config.cwd.clone())
        .with_timeout(config.timeout_secs.map(Duration::from_secs)))
}

use anyhow::{Context, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use walkdir::WalkDir;

use crate::executors::{toolchain, SkillInputs, SpawnedSkill};

/// Header tags are only looked for near the top of a script.
const HEADER_LINES: usize = 40;

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"@(skill|inputs|outputs|tools):\s*(.*?)\s*$").unwrap()
});

/// A script skill found on disk, described by its header tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillManifest {
    pub id: String,
    pub path: PathBuf,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub tools: Vec<String>,
}

impl SkillManifest {
    /// Read the `@skill:` family of tags from script text. Scripts without an
    /// `@skill:` tag are not skills.
    pub fn parse(path: &Path, text: &str) -> Option<Self> {
        let mut id = None;
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        let mut tools = Vec::new();

        for line in text.lines().take(HEADER_LINES) {
            let Some(caps) = TAG_RE.captures(line) else {
                continue;
            };
            let value = &caps[2];
            match &caps[1] {
                "skill" if !value.is_empty() => id = Some(value.to_string()),
                "inputs" => inputs = split_list(value),
                "outputs" => outputs = split_list(value),
                "tools" => tools = split_list(value),
                _ => {}
            }
        }

        Some(Self {
            id: id?,
            path: path.to_path_buf(),
            inputs,
            outputs,
            tools,
        })
    }

    /// Interpreter picked from the file extension; `None` means exec directly.
    pub fn interpreter(&self) -> Option<&'static str> {
        match self.path.extension().and_then(|e| e.to_str()) {
            Some("py") => Some("python3"),
            Some("sh") => Some("sh"),
            _ => None,
        }
    }

    pub fn to_spawned(&self) -> SpawnedSkill {
        let script = self.path.to_string_lossy().to_string();
        let skill = match self.interpreter() {
            Some(interpreter) => SpawnedSkill::new(&self.id, interpreter, vec![script]),
            None => SpawnedSkill::new(&self.id, script, Vec::new()),
        };
        skill.with_inputs(SkillInputs::from_names(&self.inputs))
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Walk `dir` for script skills, in path order. Duplicate ids keep the first
/// script found.
pub fn discover(dir: &Path) -> Result<Vec<SkillManifest>> {
    if !dir.is_dir() {
        tracing::debug!("Skills directory {:?} not present; catalog is empty", dir);
        return Ok(Vec::new());
    }

    let mut found: BTreeMap<String, SkillManifest> = BTreeMap::new();
    let walker = WalkDir::new(dir)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk skills directory {:?}", dir))?;
        if !entry.file_type().is_file() {
            continue;
        }
        // Binary or unreadable files are not scripts.
        let Ok(text) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let Some(manifest) = SkillManifest::parse(entry.path(), &text) else {
            continue;
        };

        if let Some(existing) = found.get(&manifest.id) {
            tracing::warn!(
                "Skill id {} declared by both {:?} and {:?}; keeping the first",
                manifest.id,
                existing.path,
                manifest.path
            );
            continue;
        }
        tracing::debug!(
            "Discovered skill {} at {:?} (inputs {:?}, outputs {:?})",
            manifest.id,
            manifest.path,
            manifest.inputs,
            manifest.outputs
        );
        toolchain::warn_missing(&manifest.id, &manifest.tools);
        found.insert(manifest.id.clone(), manifest);
    }

    tracing::info!("Discovered {} script skills under {:?}", found.len(), dir);
    Ok(found.into_values().collect())
}

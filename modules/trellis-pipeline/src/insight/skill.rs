//! Insight skills: YAML-defined prompt templates with required-input
//! gating and cache policy. Three built-ins ship with the crate; a skill
//! directory (`INSIGHT_SKILL_DIR`) overrides or extends them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::{Context as _, Result};
use serde::Deserialize;
use tracing::info;

pub const DOC_SKILL: &str = "doc-insight.v1";
pub const WORK_SKILL: &str = "work-insight.v1";
pub const GENERIC_SKILL: &str = "generic-insight.v1";

fn default_max_insights() -> usize {
    3
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InputSchema {
    #[serde(default)]
    pub required: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelSpec {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub temperature: f32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSpec {
    #[serde(default)]
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Skill {
    pub id: String,
    pub template: String,
    #[serde(default)]
    pub input_schema: InputSchema,
    #[serde(default)]
    pub model: ModelSpec,
    #[serde(default)]
    pub cache: CacheSpec,
    #[serde(default)]
    pub prefer_cdm: bool,
    #[serde(default = "default_max_insights")]
    pub max_insights: usize,
}

#[derive(Default)]
pub struct SkillRegistry {
    skills: RwLock<HashMap<String, Arc<Skill>>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with the three built-in skills.
    pub fn with_builtins() -> Result<Self> {
        let registry = Self::new();
        for source in [
            include_str!("../../skills/doc-insight.v1.yaml"),
            include_str!("../../skills/work-insight.v1.yaml"),
            include_str!("../../skills/generic-insight.v1.yaml"),
        ] {
            let skill: Skill = serde_yaml::from_str(source).context("parsing built-in skill")?;
            registry.insert(skill);
        }
        Ok(registry)
    }

    pub fn insert(&self, skill: Skill) {
        let mut skills = self.skills.write().expect("skill registry poisoned");
        skills.insert(skill.id.clone(), Arc::new(skill));
    }

    /// Load every `.yaml`/`.yml` file in a directory, overriding any
    /// built-in with the same id. Returns the number loaded.
    pub fn load_dir(&self, dir: &Path) -> Result<usize> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
            let path = entry?.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false);
            if !is_yaml {
                continue;
            }
            let source = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let skill: Skill = serde_yaml::from_str(&source)
                .with_context(|| format!("parsing skill {}", path.display()))?;
            info!(skill_id = %skill.id, path = %path.display(), "Loaded insight skill");
            self.insert(skill);
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Skill>> {
        let skills = self.skills.read().expect("skill registry poisoned");
        skills.get(id).cloned()
    }

    /// Skill selection by source family: document stores get the doc
    /// skill, work trackers the work skill, everything else generic.
    pub fn pick_for(&self, source_family: &str) -> Option<Arc<Skill>> {
        let preferred = match source_family {
            "confluence" | "notion" | "sharepoint" | "gdrive" => DOC_SKILL,
            "jira" | "github" | "gitlab" | "azure_devops" => WORK_SKILL,
            _ => GENERIC_SKILL,
        };
        self.get(preferred).or_else(|| self.get(GENERIC_SKILL))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_parse_and_resolve() {
        let registry = SkillRegistry::with_builtins().unwrap();
        assert!(registry.get(DOC_SKILL).is_some());
        assert!(registry.get(WORK_SKILL).is_some());
        assert!(registry.get(GENERIC_SKILL).is_some());

        assert_eq!(registry.pick_for("confluence").unwrap().id, DOC_SKILL);
        assert_eq!(registry.pick_for("jira").unwrap().id, WORK_SKILL);
        assert_eq!(registry.pick_for("salesforce").unwrap().id, GENERIC_SKILL);
    }

    #[test]
    fn builtin_doc_skill_has_expected_shape() {
        let registry = SkillRegistry::with_builtins().unwrap();
        let skill = registry.get(DOC_SKILL).unwrap();
        assert!(skill.prefer_cdm);
        assert_eq!(skill.input_schema.required, vec!["title".to_string()]);
        assert!(skill.template.contains("{{payload}}"));
        assert_eq!(skill.cache.ttl_seconds, 86400);
    }

    #[test]
    fn insert_overrides_by_id() {
        let registry = SkillRegistry::with_builtins().unwrap();
        registry.insert(Skill {
            id: GENERIC_SKILL.to_string(),
            template: "override {{payload}}".to_string(),
            input_schema: InputSchema::default(),
            model: ModelSpec::default(),
            cache: CacheSpec::default(),
            prefer_cdm: false,
            max_insights: 1,
        });
        assert_eq!(registry.get(GENERIC_SKILL).unwrap().template, "override {{payload}}");
    }
}

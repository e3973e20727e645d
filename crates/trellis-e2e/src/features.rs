//! Scenario source: loads `.feature` files into flat scenario declarations.
//!
//! Parsing uses the Gherkin parser bundled with `cucumber`. Background steps
//! (feature-level, then rule-level) are prepended to every scenario, and tags
//! are inherited feature → rule → scenario, keeping the first occurrence of
//! each.

use cucumber::gherkin::{self, GherkinEnv};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading features.
#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("no .feature files found under {0}")]
    NoFeatures(PathBuf),
}

/// One step of a scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDecl {
    /// `Given`, `When`, `Then`, `And` or `But`.
    pub keyword: String,
    pub text: String,
    pub docstring: Option<String>,
}

impl StepDecl {
    pub fn new(keyword: &str, text: &str) -> Self {
        Self {
            keyword: keyword.trim().to_string(),
            text: text.trim().to_string(),
            docstring: None,
        }
    }

    pub fn with_docstring(mut self, docstring: impl Into<String>) -> Self {
        self.docstring = Some(docstring.into());
        self
    }
}

/// A runnable scenario with inherited tags and background steps resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioDecl {
    pub feature: String,
    pub name: String,
    /// Tags without `@`, feature-level first.
    pub tags: Vec<String>,
    pub steps: Vec<StepDecl>,
    pub source: Option<PathBuf>,
}

impl ScenarioDecl {
    /// Stable identifier: `feature-slug/scenario-slug`.
    pub fn id(&self) -> String {
        format!("{}/{}", slug(&self.feature), slug(&self.name))
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        let tag = tag.strip_prefix('@').unwrap_or(tag);
        self.tags.iter().any(|t| t == tag)
    }
}

/// Lowercase, dash-separated form of `text` for ids and file names.
pub fn slug(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut dash = false;
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            dash = false;
        } else if !dash && !out.is_empty() {
            out.push('-');
            dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

fn push_tags(into: &mut Vec<String>, tags: &[String]) {
    for tag in tags {
        let tag = tag.strip_prefix('@').unwrap_or(tag);
        if !into.iter().any(|t| t == tag) {
            into.push(tag.to_string());
        }
    }
}

fn convert_steps(steps: &[gherkin::Step]) -> Vec<StepDecl> {
    steps
        .iter()
        .map(|step| StepDecl {
            keyword: step.keyword.trim().to_string(),
            text: step.value.trim().to_string(),
            docstring: step.docstring.clone(),
        })
        .collect()
}

fn scenario_decl(
    feature: &gherkin::Feature,
    inherited_tags: &[String],
    background: &[StepDecl],
    scenario: &gherkin::Scenario,
) -> ScenarioDecl {
    let mut tags = inherited_tags.to_vec();
    push_tags(&mut tags, &scenario.tags);

    let mut steps = background.to_vec();
    steps.extend(convert_steps(&scenario.steps));

    ScenarioDecl {
        feature: feature.name.clone(),
        name: scenario.name.clone(),
        tags,
        steps,
        source: feature.path.clone(),
    }
}

/// Flattens a parsed feature into scenarios, in file order (rules last).
pub fn flatten(feature: &gherkin::Feature) -> Vec<ScenarioDecl> {
    let mut feature_tags = Vec::new();
    push_tags(&mut feature_tags, &feature.tags);
    let feature_background = feature
        .background
        .as_ref()
        .map(|b| convert_steps(&b.steps))
        .unwrap_or_default();

    let mut scenarios: Vec<ScenarioDecl> = feature
        .scenarios
        .iter()
        .map(|s| scenario_decl(feature, &feature_tags, &feature_background, s))
        .collect();

    for rule in &feature.rules {
        let mut rule_tags = feature_tags.clone();
        push_tags(&mut rule_tags, &rule.tags);
        let mut background = feature_background.clone();
        if let Some(rule_background) = &rule.background {
            background.extend(convert_steps(&rule_background.steps));
        }
        scenarios.extend(
            rule.scenarios
                .iter()
                .map(|s| scenario_decl(feature, &rule_tags, &background, s)),
        );
    }

    scenarios
}

/// Parses Gherkin source held in memory.
pub fn parse_str(source: &str, origin: &Path) -> Result<Vec<ScenarioDecl>, FeatureError> {
    let feature =
        gherkin::Feature::parse(source, GherkinEnv::default()).map_err(|e| FeatureError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })?;
    Ok(flatten(&feature))
}

/// Parses one `.feature` file.
pub fn load_file(path: &Path) -> Result<Vec<ScenarioDecl>, FeatureError> {
    let feature =
        gherkin::Feature::parse_path(path, GherkinEnv::default()).map_err(|e| {
            FeatureError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
        })?;
    tracing::debug!("Loaded feature '{}' from {}", feature.name, path.display());
    Ok(flatten(&feature))
}

fn collect_feature_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), FeatureError> {
    let entries = std::fs::read_dir(dir).map_err(|source| FeatureError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let path = entry
            .map_err(|source| FeatureError::Io {
                path: dir.to_path_buf(),
                source,
            })?
            .path();
        if path.is_dir() {
            collect_feature_files(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "feature") {
            out.push(path);
        }
    }
    Ok(())
}

/// Loads every scenario under `paths` (files or directories, searched
/// recursively). Files are read in sorted path order.
pub fn load(paths: &[PathBuf]) -> Result<Vec<ScenarioDecl>, FeatureError> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let before = files.len();
            collect_feature_files(path, &mut files)?;
            if files.len() == before {
                return Err(FeatureError::NoFeatures(path.clone()));
            }
        } else if path.exists() {
            files.push(path.clone());
        } else {
            return Err(FeatureError::Io {
                path: path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            });
        }
    }
    files.sort();
    files.dedup();

    let mut scenarios = Vec::new();
    for file in &files {
        scenarios.extend(load_file(file)?);
    }
    Ok(scenarios)
}

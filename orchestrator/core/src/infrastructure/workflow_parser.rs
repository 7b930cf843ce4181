// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Workflow Definition Parser
//!
//! Translates the external workflow format (YAML or JSON, camelCase keys,
//! millisecond timeouts) into a [`WorkflowDefinition`]. Graph checks such as
//! cycles and unknown dependencies happen later in [`Dag::build`](crate::domain::workflow::Dag::build).
//!
//! # Format
//!
//! ```yaml
//! name: release
//! maxConcurrency: 2
//! policy: continue_independent
//! phases:
//!   - name: analyze
//!     agent: analyst
//!     timeoutMs: 5000
//!   - name: review
//!     agent: reviewer
//!     priority: high
//!     consensus:
//!       requiredAgents: [x, y, z]
//!       threshold: 2
//!       timeoutMs: 2000
//! dependencies:
//!   - { from: analyze, to: review }
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::domain::agent::AgentId;
use crate::domain::context::Priority;
use crate::domain::workflow::{
    ConsensusSpec, Dependency, FailurePolicy, PhaseDefinition, PhaseName, WorkflowDefinition,
    WorkflowError,
};

// ============================================================================
// External representation
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WorkflowDocument {
    pub name: String,
    pub phases: Vec<PhaseDocument>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencyDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<FailurePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PhaseDocument {
    pub name: String,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus: Option<ConsensusDocument>,
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConsensusDocument {
    pub required_agents: Vec<String>,
    pub threshold: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependencyDocument {
    pub from: String,
    pub to: String,
}

// ============================================================================
// Parser
// ============================================================================

pub struct WorkflowParser;

impl WorkflowParser {
    /// Parse a workflow file; `.json` files are read as JSON, anything else as YAML.
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<WorkflowDefinition, WorkflowError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| WorkflowError::Parse(format!("{}: {}", path.display(), e)))?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::parse_json(&content)
        } else {
            Self::parse_yaml(&content)
        }
    }

    pub fn parse_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
        let document: WorkflowDocument =
            serde_yaml::from_str(yaml).map_err(|e| WorkflowError::Parse(e.to_string()))?;
        Self::convert(document)
    }

    pub fn parse_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
        let document: WorkflowDocument =
            serde_json::from_str(json).map_err(|e| WorkflowError::Parse(e.to_string()))?;
        Self::convert(document)
    }

    pub fn to_yaml(definition: &WorkflowDefinition) -> Result<String, WorkflowError> {
        serde_yaml::to_string(&Self::to_document(definition))
            .map_err(|e| WorkflowError::Parse(e.to_string()))
    }

    fn convert(document: WorkflowDocument) -> Result<WorkflowDefinition, WorkflowError> {
        if document.name.trim().is_empty() {
            return Err(WorkflowError::Parse("workflow name must not be empty".to_string()));
        }

        let phases = document
            .phases
            .into_iter()
            .map(Self::convert_phase)
            .collect::<Result<Vec<_>, _>>()?;

        let dependencies = document
            .dependencies
            .into_iter()
            .map(|d| {
                Ok(Dependency {
                    from: PhaseName::new(d.from)?,
                    to: PhaseName::new(d.to)?,
                })
            })
            .collect::<Result<Vec<_>, WorkflowError>>()?;

        Ok(WorkflowDefinition {
            name: document.name,
            phases,
            dependencies,
            policy: document.policy,
            max_concurrency: document.max_concurrency,
        })
    }

    fn convert_phase(phase: PhaseDocument) -> Result<PhaseDefinition, WorkflowError> {
        let consensus = phase.consensus.map(|c| ConsensusSpec {
            required_agents: c.required_agents.into_iter().map(AgentId::new).collect(),
            threshold: c.threshold,
            timeout: c.timeout_ms.map(Duration::from_millis),
        });

        Ok(PhaseDefinition {
            name: PhaseName::new(phase.name)?,
            agent: AgentId::new(phase.agent),
            timeout: phase.timeout_ms.map(Duration::from_millis),
            consensus,
            priority: phase.priority,
        })
    }

    fn to_document(definition: &WorkflowDefinition) -> WorkflowDocument {
        WorkflowDocument {
            name: definition.name.clone(),
            phases: definition
                .phases
                .iter()
                .map(|p| PhaseDocument {
                    name: p.name.to_string(),
                    agent: p.agent.to_string(),
                    timeout_ms: p.timeout.map(duration_to_millis),
                    consensus: p.consensus.as_ref().map(|c| ConsensusDocument {
                        required_agents: c.required_agents.iter().map(ToString::to_string).collect(),
                        threshold: c.threshold,
                        timeout_ms: c.timeout.map(duration_to_millis),
                    }),
                    priority: p.priority,
                })
                .collect(),
            dependencies: definition
                .dependencies
                .iter()
                .map(|d| DependencyDocument {
                    from: d.from.to_string(),
                    to: d.to.to_string(),
                })
                .collect(),
            policy: definition.policy,
            max_concurrency: definition.max_concurrency,
        }
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::workflow::Dag;

    const RELEASE: &str = r#"
name: release
maxConcurrency: 2
policy: continue_independent
phases:
  - name: analyze
    agent: analyst
    timeoutMs: 5000
  - name: review
    agent: reviewer
    priority: high
    consensus:
      requiredAgents: [x, y, z]
      threshold: 2
      timeoutMs: 2000
dependencies:
  - { from: analyze, to: review }
"#;

    #[test]
    fn test_parse_yaml_workflow() {
        let definition = WorkflowParser::parse_yaml(RELEASE).unwrap();

        assert_eq!(definition.name, "release");
        assert_eq!(definition.max_concurrency, Some(2));
        assert_eq!(definition.policy, Some(FailurePolicy::ContinueIndependent));
        assert_eq!(definition.phases[0].timeout, Some(Duration::from_secs(5)));

        let review = &definition.phases[1];
        assert_eq!(review.priority, Priority::High);
        let consensus = review.consensus.as_ref().unwrap();
        assert_eq!(consensus.threshold, 2);
        assert_eq!(consensus.required_agents.len(), 3);
        assert_eq!(consensus.timeout, Some(Duration::from_secs(2)));

        let dag = Dag::build(definition).unwrap();
        assert_eq!(dag.topological_order()[0].as_str(), "analyze");
    }

    #[test]
    fn test_parse_json_workflow() {
        let json = r#"{
            "name": "pair",
            "phases": [
                { "name": "a", "agent": "alpha" },
                { "name": "b", "agent": "beta", "timeoutMs": 250 }
            ],
            "dependencies": [{ "from": "a", "to": "b" }]
        }"#;

        let definition = WorkflowParser::parse_json(json).unwrap();
        assert_eq!(definition.phases.len(), 2);
        assert_eq!(definition.phases[1].timeout, Some(Duration::from_millis(250)));
        assert_eq!(definition.policy, None);
    }

    #[test]
    fn test_rejects_malformed_documents() {
        assert!(matches!(
            WorkflowParser::parse_yaml("name: x\nphases:\n  - name: a\n"),
            Err(WorkflowError::Parse(_))
        ));
        assert!(matches!(
            WorkflowParser::parse_yaml("name: x\nphases:\n  - name: a b\n    agent: q\n"),
            Err(WorkflowError::InvalidPhaseName(_))
        ));
        assert!(matches!(
            WorkflowParser::parse_yaml("name: x\nstages: []\nphases: []\n"),
            Err(WorkflowError::Parse(_))
        ));
    }

    #[test]
    fn test_misspelled_dependency_key_is_named() {
        let yaml = "name: x\nphases:\n  - { name: a, agent: q }\n  - { name: b, agent: q }\ndependencies:\n  - { form: a, to: b }\n";
        match WorkflowParser::parse_yaml(yaml) {
            Err(WorkflowError::Parse(message)) => assert!(message.contains("unknown field `form`"), "{message}"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_huge_timeouts_saturate_when_serialized() {
        assert_eq!(duration_to_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(duration_to_millis(Duration::MAX), u64::MAX);

        let mut definition = WorkflowParser::parse_yaml(RELEASE).unwrap();
        definition.phases[0].timeout = Some(Duration::MAX);
        let yaml = WorkflowParser::to_yaml(&definition).unwrap();
        assert!(yaml.contains(&format!("timeoutMs: {}", u64::MAX)));
    }

    #[test]
    fn test_parse_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.json");
        fs::write(&path, r#"{ "name": "solo", "phases": [{ "name": "only", "agent": "a" }] }"#).unwrap();

        let definition = WorkflowParser::parse_file(&path).unwrap();
        assert_eq!(definition.name, "solo");

        let missing = WorkflowParser::parse_file(dir.path().join("missing.yaml"));
        assert!(matches!(missing, Err(WorkflowError::Parse(_))));
    }

    #[test]
    fn test_to_yaml_uses_external_format() {
        let definition = WorkflowParser::parse_yaml(RELEASE).unwrap();
        let yaml = WorkflowParser::to_yaml(&definition).unwrap();

        assert!(yaml.contains("timeoutMs: 5000"));
        assert!(yaml.contains("requiredAgents"));
        assert_eq!(WorkflowParser::parse_yaml(&yaml).unwrap(), definition);
    }
}

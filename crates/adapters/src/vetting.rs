//! ComfyUI workflow vetting.
//!
//! Every workflow is checked before it is submitted. The policy follows the
//! execution mode:
//!
//! - `production`: only nodes and models on the platform allowlist; custom
//!   node repositories are never allowed.
//! - `self-hosted-production`: nodes, models and repositories on the
//!   administrator's allowlist.
//! - `developer`: everything runs, and every resource is logged.
//!
//! Violations fail the segment with `UNSUPPORTED_CAPABILITY`, which is not
//! retried; the segment has to be edited.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use foundry_core::config::ExecutionMode;
use foundry_core::hashing::sha256_hex;
use serde::Deserialize;
use serde_json::Value;

use crate::error::AdapterError;

/// Node types approved on a self-hosted deployment without an allowlist.
const SELF_HOSTED_DEFAULT_NODES: [&str; 2] = ["LoadImage", "SaveImage"];

/// Loader inputs that name a model file. Any other input whose name
/// contains `model` counts as well.
const MODEL_INPUT_KEYS: [&str; 5] = ["ckpt_name", "lora_name", "unet_name", "vae_name", "clip_name"];

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

/// Something a workflow makes ComfyUI load or execute.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkflowResource {
    /// A node `class_type`.
    Node(String),
    /// A model file referenced by a node input.
    Model(String),
    /// A custom node repository from a node's `_meta.custom_repo`.
    Repository(String),
}

/// Every resource referenced by an API-format workflow, without duplicates.
pub fn extract_resources(workflow: &Value) -> Vec<WorkflowResource> {
    let mut resources = BTreeSet::new();
    let Some(nodes) = workflow.as_object() else {
        return Vec::new();
    };

    for node in nodes.values() {
        let Some(class_type) = node.get("class_type").and_then(Value::as_str) else {
            continue;
        };
        resources.insert(WorkflowResource::Node(class_type.to_string()));

        if let Some(inputs) = node.get("inputs").and_then(Value::as_object) {
            for (key, value) in inputs {
                let Some(name) = value.as_str() else {
                    continue;
                };
                if MODEL_INPUT_KEYS.contains(&key.as_str())
                    || key.to_ascii_lowercase().contains("model")
                {
                    resources.insert(WorkflowResource::Model(name.to_string()));
                }
            }
        }

        if let Some(repo) = node
            .get("_meta")
            .and_then(|meta| meta.get("custom_repo"))
            .and_then(Value::as_str)
        {
            resources.insert(WorkflowResource::Repository(repo.to_string()));
        }
    }

    resources.into_iter().collect()
}

// ---------------------------------------------------------------------------
// Allowlist
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AllowlistError {
    #[error("Cannot read workflow allowlist {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid workflow allowlist {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Approved nodes, models and repositories.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowAllowlist {
    pub nodes: BTreeSet<String>,
    pub models: BTreeSet<String>,
    pub repositories: BTreeSet<String>,
}

/// One document of the allowlist file.
///
/// ```json
/// {
///   "execution_mode": "production",
///   "nodes": [{ "type": "KSampler" }],
///   "models": [{ "identifier": "sd_xl_base_1.0.safetensors" }],
///   "repositories": [{ "url": "https://github.com/org/nodes" }]
/// }
/// ```
///
/// The file holds one document or an array of them, one per mode.
#[derive(Debug, Deserialize)]
struct AllowlistDocument {
    execution_mode: String,
    #[serde(default)]
    nodes: Vec<NodeEntry>,
    #[serde(default)]
    models: Vec<ModelEntry>,
    #[serde(default)]
    repositories: Vec<RepositoryEntry>,
}

#[derive(Debug, Deserialize)]
struct NodeEntry {
    #[serde(rename = "type")]
    node_type: String,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    identifier: String,
}

#[derive(Debug, Deserialize)]
struct RepositoryEntry {
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AllowlistFile {
    Documents(Vec<AllowlistDocument>),
    Document(AllowlistDocument),
}

impl From<AllowlistDocument> for WorkflowAllowlist {
    fn from(doc: AllowlistDocument) -> Self {
        Self {
            nodes: doc.nodes.into_iter().map(|n| n.node_type).collect(),
            models: doc.models.into_iter().map(|m| m.identifier).collect(),
            repositories: doc.repositories.into_iter().map(|r| r.url).collect(),
        }
    }
}

impl WorkflowAllowlist {
    /// Parse an allowlist file and return the document for `mode`, if any.
    pub fn parse(json: &str, mode: ExecutionMode) -> Result<Option<Self>, serde_json::Error> {
        let documents = match serde_json::from_str::<AllowlistFile>(json)? {
            AllowlistFile::Documents(documents) => documents,
            AllowlistFile::Document(document) => vec![document],
        };
        Ok(documents
            .into_iter()
            .find(|doc| doc.execution_mode == mode.as_str())
            .map(Self::from))
    }

    /// Read the document for `mode` from `path`. A missing file is `None`.
    pub fn load(path: &Path, mode: ExecutionMode) -> Result<Option<Self>, AllowlistError> {
        let json = match std::fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Workflow allowlist not found");
                return Ok(None);
            }
            Err(source) => {
                return Err(AllowlistError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::parse(&json, mode).map_err(|source| AllowlistError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn self_hosted_default() -> Self {
        Self {
            nodes: SELF_HOSTED_DEFAULT_NODES.iter().map(|n| n.to_string()).collect(),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Vetting policy of one execution mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowVetting {
    Production(WorkflowAllowlist),
    SelfHosted(WorkflowAllowlist),
    Developer,
}

impl WorkflowVetting {
    /// Policy for `mode`, reading its allowlist from `allowlist_path`.
    ///
    /// Production without an allowlist approves nothing. Self-hosted
    /// without one approves only `LoadImage` and `SaveImage`.
    pub fn for_mode(
        mode: ExecutionMode,
        allowlist_path: Option<&Path>,
    ) -> Result<Self, AllowlistError> {
        let allowlist = match allowlist_path {
            Some(path) if mode != ExecutionMode::Developer => WorkflowAllowlist::load(path, mode)?,
            _ => None,
        };
        let policy = match mode {
            ExecutionMode::Developer => Self::Developer,
            ExecutionMode::Production => Self::Production(allowlist.unwrap_or_else(|| {
                tracing::warn!("No production workflow allowlist, every workflow will be rejected");
                WorkflowAllowlist::default()
            })),
            ExecutionMode::SelfHostedProduction => {
                Self::SelfHosted(allowlist.unwrap_or_else(WorkflowAllowlist::self_hosted_default))
            }
        };
        if let Self::Production(list) | Self::SelfHosted(list) = &policy {
            tracing::info!(
                mode = mode.as_str(),
                nodes = list.nodes.len(),
                models = list.models.len(),
                repositories = list.repositories.len(),
                "Workflow allowlist loaded"
            );
        }
        Ok(policy)
    }

    pub fn mode(&self) -> ExecutionMode {
        match self {
            Self::Production(_) => ExecutionMode::Production,
            Self::SelfHosted(_) => ExecutionMode::SelfHostedProduction,
            Self::Developer => ExecutionMode::Developer,
        }
    }

    /// Check `workflow` against the policy.
    pub fn vet(&self, workflow: &Value) -> Result<(), AdapterError> {
        let digest = sha256_hex(workflow.to_string().as_bytes());
        let workflow_id = &digest[..12];
        let resources = extract_resources(workflow);

        let violations = match self {
            Self::Developer => {
                for resource in &resources {
                    match resource {
                        WorkflowResource::Repository(url) => tracing::warn!(
                            workflow_id,
                            repository = %url,
                            "Untrusted custom node repository, running anyway in developer mode"
                        ),
                        other => tracing::debug!(workflow_id, resource = ?other, "Workflow resource"),
                    }
                }
                Vec::new()
            }
            Self::Production(list) => violations(&resources, list, false),
            Self::SelfHosted(list) => violations(&resources, list, true),
        };

        if violations.is_empty() {
            tracing::info!(workflow_id, mode = self.mode().as_str(), "Workflow approved");
            return Ok(());
        }
        let message = format!("Workflow security violations: {}", violations.join("; "));
        tracing::warn!(workflow_id, mode = self.mode().as_str(), reason = %message, "Workflow rejected");
        Err(AdapterError::UnsupportedCapability(message))
    }
}

fn violations(
    resources: &[WorkflowResource],
    list: &WorkflowAllowlist,
    repositories_allowed: bool,
) -> Vec<String> {
    resources
        .iter()
        .filter_map(|resource| match resource {
            WorkflowResource::Node(node) if !list.nodes.contains(node) => {
                Some(format!("node '{node}' is not approved"))
            }
            WorkflowResource::Model(model) if !list.models.contains(model) => {
                Some(format!("model '{model}' is not approved"))
            }
            WorkflowResource::Repository(url) if !repositories_allowed => {
                Some(format!("custom repository '{url}' is not allowed in production"))
            }
            WorkflowResource::Repository(url) if !list.repositories.contains(url) => {
                Some(format!("repository '{url}' is not approved"))
            }
            _ => None,
        })
        .collect()
}

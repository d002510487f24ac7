//! Task wire types.

use edgecoder_primitives::{sha256, AccountId, Buf32, TaskId};
use serde::{Deserialize, Serialize};

/// Hardware class a task must run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    Cpu,
    Gpu,
}

impl ResourceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
        }
    }
}

/// Project-level scheduling metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMeta {
    pub project_id: String,
    pub resource_class: ResourceClass,
    /// Higher runs first within a project.
    pub priority: i32,
}

impl Default for ProjectMeta {
    fn default() -> Self {
        Self {
            project_id: "default".to_owned(),
            resource_class: ResourceClass::Cpu,
            priority: 0,
        }
    }
}

/// A task as submitted, offered over gossip, or forwarded between
/// coordinators. Execution state lives with the coordinator, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: TaskId,
    pub kind: String,
    pub language: String,
    pub input: String,
    pub timeout_ms: u64,
    /// Reference to a workspace snapshot the worker should restore.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_ref: Option<String>,
    #[serde(default)]
    pub project: ProjectMeta,
    /// Minimum model parameter size (in billions) needed to execute.
    pub required_model_size: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_account: Option<AccountId>,
}

impl TaskSpec {
    /// Stable content hash binding credit transactions to this task.
    pub fn input_hash(&self) -> Buf32 {
        sha256(self.input.as_bytes())
    }
}

/// Terminal outcome of a task execution, as announced on the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskResultStatus {
    Completed,
    Failed,
}

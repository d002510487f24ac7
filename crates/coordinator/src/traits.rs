//! Adapter traits the coordinator consumes; the node binary provides the
//! implementations.

use async_trait::async_trait;
use edgecoder_mesh_types::TaskSpec;
use edgecoder_primitives::{Buf64, TxId};
use tokio::sync::watch;

/// A model served by the local backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub name: String,
    /// Parameter count in billions, if the backend reports one.
    pub param_size: Option<f64>,
}

/// Output of one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    pub output: String,
    pub cpu_seconds: f64,
}

/// The local inference backend (e.g. an Ollama server).
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
    ) -> Result<GenerationOutput, anyhow::Error>;
    async fn list_models(&self) -> Result<Vec<ModelInfo>, anyhow::Error>;
    async fn health(&self) -> bool;
}

/// What a worker hands back for a finished task: the output plus the
/// provider-signed settlement terms.
#[derive(Debug, Clone)]
pub struct WorkerOutput {
    pub output: String,
    pub cpu_seconds: f64,
    pub tx_id: TxId,
    /// Provider signature over the settlement bytes
    /// ([`edgecoder_mesh_types::CreditTransaction::provider_signing_bytes`]).
    pub signature: Buf64,
}

/// Executes claimed tasks. Implementations must honor the shutdown signal:
/// a cancelled execution either never starts or leaves no partial effects.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn execute(
        &self,
        task: TaskSpec,
        shutdown: watch::Receiver<bool>,
    ) -> Result<WorkerOutput, anyhow::Error>;
}

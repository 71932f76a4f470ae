use async_trait::async_trait;
use eltflow_utils::error::Error;
use eltflow_utils::EltResult;
use serde::{Deserialize, Serialize};

/// Exit status and captured output of one external transform run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformOutcome {
    pub selector: String,
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl TransformOutcome {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// A non-zero exit becomes `Error::Transform` carrying stderr.
    pub fn into_result(self) -> EltResult<TransformOutcome> {
        if self.success() {
            return Ok(self);
        }
        let stderr = if self.stderr.trim().is_empty() {
            self.stdout
        } else {
            self.stderr
        };
        Err(Error::Transform {
            selector: self.selector,
            status: self.status,
            stderr: stderr.trim().to_string(),
        })
    }
}

/// Boundary to an external transformation tool.
#[async_trait]
pub trait TransformRunner: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, selector: &str) -> EltResult<TransformOutcome>;
}

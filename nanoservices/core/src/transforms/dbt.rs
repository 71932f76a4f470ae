use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use eltflow_utils::error::Error;
use eltflow_utils::EltResult;
use tokio::process::Command;

use super::traits::{TransformOutcome, TransformRunner};

/// Runs `dbt build` for a selector in a project directory.
#[derive(Debug, Clone)]
pub struct DbtRunner {
    program: String,
    project_dir: PathBuf,
    profiles_dir: PathBuf,
}

impl DbtRunner {
    pub fn new(project_dir: impl Into<PathBuf>, profiles_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: "dbt".to_string(),
            project_dir: project_dir.into(),
            profiles_dir: profiles_dir.into(),
        }
    }

    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn args(&self, selector: &str) -> Vec<String> {
        vec![
            "build".to_string(),
            "--project-dir".to_string(),
            self.project_dir.display().to_string(),
            "--profiles-dir".to_string(),
            self.profiles_dir.display().to_string(),
            "-s".to_string(),
            selector.to_string(),
        ]
    }
}

#[async_trait]
impl TransformRunner for DbtRunner {
    fn name(&self) -> &str {
        &self.program
    }

    async fn invoke(&self, selector: &str) -> EltResult<TransformOutcome> {
        tracing::info!(program = %self.program, selector, project = %self.project_dir.display(), "invoking transform");
        let output = Command::new(&self.program)
            .args(self.args(selector))
            .current_dir(&self.project_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                return Err(Error::Transform {
                    selector: selector.to_string(),
                    status: -1,
                    stderr: format!("failed to start `{}`: {e}", self.program),
                })
            }
        };

        let outcome = TransformOutcome {
            selector: selector.to_string(),
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        for line in outcome.stdout.lines().filter(|l| !l.trim().is_empty()) {
            tracing::info!(target: "eltflow::dbt", "{line}");
        }
        if !outcome.success() {
            tracing::error!(selector, status = outcome.status, "transform exited with failure");
        }
        Ok(outcome)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// A stand-in `dbt` that echoes its arguments and exits with `code`.
    fn fake_dbt(dir: &std::path::Path, code: i32) -> PathBuf {
        let path = dir.join("dbt");
        let script = format!("#!/bin/sh\necho \"args: $*\"\necho \"model failed\" >&2\nexit {code}\n");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn passes_selector_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_dbt(dir.path(), 0);
        let runner = DbtRunner::new(dir.path(), dir.path().join("profiles")).program(program.display().to_string());

        let outcome = runner.invoke("+mart_ecom_sales_summary").await.unwrap();
        assert!(outcome.success());
        assert!(outcome.stdout.contains("build --project-dir"));
        assert!(outcome.stdout.contains("-s +mart_ecom_sales_summary"));
    }

    #[tokio::test]
    async fn failing_run_captures_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_dbt(dir.path(), 1);
        let runner = DbtRunner::new(dir.path(), dir.path()).program(program.display().to_string());

        let err = runner.invoke("+mart").await.unwrap().into_result().unwrap_err();
        assert!(matches!(err, Error::Transform { status: 1, ref stderr, .. } if stderr == "model failed"));
    }

    #[tokio::test]
    async fn missing_program_is_transform_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = DbtRunner::new(dir.path(), dir.path()).program("/nonexistent/dbt");
        let err = runner.invoke("+mart").await.unwrap_err();
        assert!(matches!(err, Error::Transform { status: -1, .. }));
    }
}

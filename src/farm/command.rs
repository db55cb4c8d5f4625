//! Farm submit-command client
//!
//! ## Table of Contents
//! - **CommandFarmClient**: Writes job/plugin info files and runs the submit command
//! - **parse_job_id**: Extracts `JobID=` from the command's output

use super::{FarmClient, FarmJob};
use crate::error::{PublishError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info};

/// Client running a farm submit command as `<command> <job file> <plugin file>`
#[derive(Debug, Clone)]
pub struct CommandFarmClient {
    command: String,
}

impl CommandFarmClient {
    /// Client running `command`
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

/// `key=value` lines; non-ASCII characters are dropped
fn write_info(info: &BTreeMap<String, String>, suffix: &str) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("farm_")
        .suffix(suffix)
        .tempfile()?;
    for (k, v) in info {
        let line: String = format!("{}={}", k, v).chars().filter(char::is_ascii).collect();
        writeln!(file, "{}", line)?;
    }
    file.flush()?;
    Ok(file)
}

/// Job id from a submit command's standard output
pub fn parse_job_id(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("JobID="))
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

#[async_trait]
impl FarmClient for CommandFarmClient {
    async fn submit(&self, job: &FarmJob) -> Result<String> {
        let job_file = write_info(&job.job_info(), ".job")?;
        let plugin_file = write_info(&job.plugin_info(), ".plugin")?;
        let mut args: Vec<PathBuf> = vec![job_file.path().to_path_buf(), plugin_file.path().to_path_buf()];
        if let Some(config) = job.args.get(1) {
            args.push(PathBuf::from(config));
        }

        debug!(command = %self.command, job = %job.name, "Running submit command");
        let output = Command::new(&self.command)
            .args(&args)
            .output()
            .await
            .map_err(|e| PublishError::external(format!("{}: {}", self.command, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            return Err(PublishError::external(format!(
                "submit command exited with {}: {} {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim(),
                stdout.trim()
            )));
        }
        let job_id = parse_job_id(&stdout).ok_or_else(|| {
            PublishError::external(format!("no JobID in submit output: {}", stdout.trim()))
        })?;

        info!(job = %job.name, job_id = %job_id, "Job submitted to farm");
        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FarmSettings;

    #[test]
    fn test_parse_job_id() {
        let out = "Submitting to Repository\nResult=Success\nJobID=64f0c2aa\nThe job was submitted\n";
        assert_eq!(parse_job_id(out), Some("64f0c2aa".to_string()));
        assert_eq!(parse_job_id("Result=Failure\n"), None);
        assert_eq!(parse_job_id("JobID=\n"), None);
    }

    #[test]
    fn test_info_file_is_ascii() {
        let mut info = BTreeMap::new();
        info.insert("Name".to_string(), "ch\u{e4}ir-proxy".to_string());
        info.insert("Pool".to_string(), "3d".to_string());
        let file = write_info(&info, ".job").unwrap();
        let text = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(text, "Name=chir-proxy\nPool=3d\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_submit_runs_command() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("submit.sh");
        std::fs::write(&script, "#!/bin/sh\ngrep -q '^Name=chair-proxy$' \"$1\" || exit 3\necho JobID=77\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let client = CommandFarmClient::new(script.display().to_string());
        let job = FarmJob::new("chair-proxy", "proxy", &FarmSettings::default());
        assert_eq!(client.submit(&job).await.unwrap(), "77");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_submit_failure_is_external() {
        let client = CommandFarmClient::new("false");
        let job = FarmJob::new("chair-proxy", "proxy", &FarmSettings::default());
        let err = client.submit(&job).await.unwrap_err();
        assert!(matches!(err, PublishError::ExternalTool(_)));
    }
}

//! Farm web-service client
//!
//! ## Table of Contents
//! - **HttpFarmClient**: Posts job and plugin info as JSON

use super::{FarmClient, FarmJob};
use crate::error::{PublishError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;

/// Farm web-service client
#[derive(Clone)]
pub struct HttpFarmClient {
    client: Client,
    base_url: String,
}

impl HttpFarmClient {
    /// Create a new client for `base_url`
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PublishError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }
}

/// Request body for a job submission
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobSubmitRequest {
    /// Job key/value info
    pub job_info: BTreeMap<String, String>,
    /// Plugin key/value info
    pub plugin_info: BTreeMap<String, String>,
    /// Files sent along with the job
    pub aux_files: Vec<String>,
}

impl JobSubmitRequest {
    /// Request for `job`
    pub fn from_job(job: &FarmJob) -> Self {
        Self {
            job_info: job.job_info(),
            plugin_info: job.plugin_info(),
            aux_files: Vec::new(),
        }
    }
}

/// Submission response
#[derive(Debug, Deserialize)]
pub struct JobSubmitResponse {
    /// Farm job id
    #[serde(rename = "_id")]
    pub id: String,
}

#[async_trait]
impl FarmClient for HttpFarmClient {
    async fn submit(&self, job: &FarmJob) -> Result<String> {
        let resp = self
            .client
            .post(self.url("/jobs"))
            .json(&JobSubmitRequest::from_job(job))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| PublishError::external(e.to_string()))?;

        let result: JobSubmitResponse = resp
            .json()
            .await
            .map_err(|e| PublishError::external(e.to_string()))?;

        info!(job = %job.name, job_id = %result.id, "Job submitted to farm web service");
        Ok(result.id)
    }
}

//! Review service submission
//!
//! ## Table of Contents
//! - **ReviewContext**: Project, task and entity ids, built once per publish
//! - **ReviewClient**: Review service backend, with `HttpReviewClient`
//! - **submit_review**: Creates the record and uploads its thumbnail
//! - **next_version_number**: Next free number from prior record codes

use crate::config::{Identity, ReviewSettings};
use crate::error::{PublishError, Result};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Entity a review record is linked to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id")]
pub enum EntityLink {
    /// Asset entity
    Asset(u64),
    /// Shot entity
    Shot(u64),
}

impl EntityLink {
    /// Service entity type name
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Asset(_) => "Asset",
            Self::Shot(_) => "Shot",
        }
    }

    /// Entity id
    pub fn id(&self) -> u64 {
        match self {
            Self::Asset(id) | Self::Shot(id) => *id,
        }
    }
}

/// Identifiers of one publish on the review service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewContext {
    /// Project id
    pub project_id: u64,
    /// Task id, when known
    pub task_id: Option<u64>,
    /// Linked entity
    pub entity: EntityLink,
    /// `{asset}_{task}` or `{seq}_{shot}_{task}`
    pub content: String,
    /// Artist short name
    pub user: String,
}

fn parse_id(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        None => Ok(None),
        Some(v) => v
            .trim()
            .parse::<u64>()
            .map(|id| Some(id).filter(|&id| id > 0))
            .map_err(|_| PublishError::config(format!("{} is not a numeric id: '{}'", key, v))),
    }
}

impl ReviewContext {
    /// Context from the process environment
    pub fn from_env(identity: &Identity) -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok(), identity)
    }

    /// Context through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>, identity: &Identity) -> Result<Self> {
        let project_id = parse_id(&lookup, "HAL_PROJECT_SGID")?
            .ok_or_else(|| PublishError::config("HAL_PROJECT_SGID is not set"))?;
        let task_id = parse_id(&lookup, "HAL_TASK_SGID")?;
        let entity = match (parse_id(&lookup, "HAL_ASSET_SGID")?, parse_id(&lookup, "HAL_SHOT_SGID")?) {
            (Some(id), _) => EntityLink::Asset(id),
            (None, Some(id)) => EntityLink::Shot(id),
            (None, None) => {
                return Err(PublishError::config(
                    "neither HAL_ASSET_SGID nor HAL_SHOT_SGID is set",
                ))
            }
        };
        Ok(Self {
            project_id,
            task_id,
            entity,
            content: identity.content(),
            user: identity.user.clone(),
        })
    }
}

/// Record to create
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewRecord {
    /// Record code, e.g. `chair_model_v004_abc`
    pub code: String,
    /// Project id
    pub project_id: u64,
    /// Linked entity
    pub entity: EntityLink,
    /// Linked task
    pub task_id: Option<u64>,
    /// Published interface document
    pub path: PathBuf,
    /// Initial status
    pub status: String,
    /// Free-text description
    pub description: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Created record
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewSubmission {
    /// Service id
    pub id: u64,
    /// Record code
    pub code: String,
    /// Whether the thumbnail was attached
    pub thumbnail: bool,
}

/// Review service backend
#[async_trait]
pub trait ReviewClient: Send + Sync {
    /// Codes of the records already linked to the context's entity and task
    async fn version_codes(&self, ctx: &ReviewContext) -> Result<Vec<String>>;

    /// Create a record; returns its id
    async fn create_version(&self, record: &ReviewRecord) -> Result<u64>;

    /// Attach a thumbnail image to a record
    async fn upload_thumbnail(&self, version_id: u64, path: &Path) -> Result<()>;
}

/// Shared review client handle
pub type BoxedReviewClient = Arc<dyn ReviewClient>;

/// HTTP client for the configured endpoint, authenticated from `token_env`
pub fn client_from_settings(settings: &ReviewSettings) -> Result<BoxedReviewClient> {
    let endpoint = settings
        .endpoint
        .as_deref()
        .ok_or_else(|| PublishError::config("review is enabled without an endpoint"))?;
    let mut client = HttpReviewClient::new(endpoint)?;
    if let Ok(token) = std::env::var(&settings.token_env) {
        client = client.with_token(token);
    }
    Ok(Arc::new(client))
}

/// Highest `_v(\d{3,})` number in `codes`, plus one
pub fn next_version_number(codes: &[String]) -> u64 {
    codes.iter().filter_map(|c| code_version(c)).max().unwrap_or(0) + 1
}

fn code_version(code: &str) -> Option<u64> {
    code.match_indices("_v").find_map(|(i, _)| {
        let digits: String = code[i + 2..].chars().take_while(char::is_ascii_digit).collect();
        if digits.len() >= 3 {
            digits.parse().ok()
        } else {
            None
        }
    })
}

/// `{content}_v{NNN}_{user}`
pub fn version_code(content: &str, number: u64, user: &str) -> String {
    format!("{}_v{:03}_{}", content, number, user)
}

fn host_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown-host".to_string())
}

/// Create one review record for `path` and attach `thumbnail`.
///
/// A failed thumbnail upload is logged; the record stays.
pub async fn submit_review(
    client: &dyn ReviewClient,
    ctx: &ReviewContext,
    path: &Path,
    thumbnail: Option<&Path>,
    status: &str,
    retry: &RetryPolicy,
) -> Result<ReviewSubmission> {
    let codes = retry.execute(move || client.version_codes(ctx)).await?;
    let code = version_code(&ctx.content, next_version_number(&codes), &ctx.user);

    let record = ReviewRecord {
        code: code.clone(),
        project_id: ctx.project_id,
        entity: ctx.entity,
        task_id: ctx.task_id,
        path: path.to_path_buf(),
        status: status.to_string(),
        description: format!("Asset publish from {}", host_name()),
        created_at: Utc::now(),
    };
    let id = client.create_version(&record).await?;
    info!(code = %code, id, entity = %ctx.entity.type_name(), "Review record created");

    let mut attached = false;
    if let Some(thumb) = thumbnail.filter(|p| p.is_file()) {
        match client.upload_thumbnail(id, thumb).await {
            Ok(()) => attached = true,
            Err(e) => warn!(id, thumbnail = %thumb.display(), error = %e, "Thumbnail upload failed"),
        }
    }

    Ok(ReviewSubmission {
        id,
        code,
        thumbnail: attached,
    })
}

/// Review service REST client
#[derive(Clone)]
pub struct HttpReviewClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpReviewClient {
    /// Create a new client for `base_url`
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| PublishError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Set bearer token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    fn add_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

fn link(type_name: &str, id: u64) -> Value {
    json!({ "type": type_name, "id": id })
}

/// Body of the record search
pub fn search_body(ctx: &ReviewContext) -> Value {
    let mut filters = vec![
        json!(["project", "is", link("Project", ctx.project_id)]),
        json!(["entity", "is", link(ctx.entity.type_name(), ctx.entity.id())]),
    ];
    if let Some(task) = ctx.task_id {
        filters.push(json!(["sg_task", "is", link("Task", task)]));
    }
    json!({ "filters": filters, "fields": ["code"] })
}

/// Body of the record creation
pub fn create_body(record: &ReviewRecord) -> Value {
    let mut body = json!({
        "project": link("Project", record.project_id),
        "code": record.code,
        "entity": link(record.entity.type_name(), record.entity.id()),
        "sg_path_to_geometry": record.path.display().to_string(),
        "sg_status_list": record.status,
        "description": record.description,
    });
    if let Some(task) = record.task_id {
        body["sg_task"] = link("Task", task);
    }
    body
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    data: Vec<Entity>,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    data: Entity,
}

#[derive(Debug, Deserialize)]
struct Entity {
    #[serde(default)]
    id: u64,
    #[serde(default)]
    attributes: Value,
}

#[async_trait]
impl ReviewClient for HttpReviewClient {
    async fn version_codes(&self, ctx: &ReviewContext) -> Result<Vec<String>> {
        let resp = self
            .add_auth(self.client.post(self.url("/entity/versions/_search")))
            .header("Content-Type", "application/vnd+shotgun.api3_array+json")
            .body(search_body(ctx).to_string())
            .send()
            .await?
            .error_for_status()
            .map_err(|e| PublishError::external(e.to_string()))?;

        let result: SearchResponse = resp
            .json()
            .await
            .map_err(|e| PublishError::external(e.to_string()))?;
        Ok(result
            .data
            .into_iter()
            .filter_map(|e| e.attributes.get("code").and_then(Value::as_str).map(str::to_string))
            .collect())
    }

    async fn create_version(&self, record: &ReviewRecord) -> Result<u64> {
        let resp = self
            .add_auth(self.client.post(self.url("/entity/versions")))
            .json(&create_body(record))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| PublishError::external(e.to_string()))?;

        let result: CreateResponse = resp
            .json()
            .await
            .map_err(|e| PublishError::external(e.to_string()))?;
        Ok(result.data.id)
    }

    async fn upload_thumbnail(&self, version_id: u64, path: &Path) -> Result<()> {
        let bytes = tokio::fs::read(path).await?;
        self.add_auth(
            self.client
                .put(self.url(&format!("/entity/versions/{}/image", version_id))),
        )
        .header("Content-Type", "image/png")
        .body(bytes)
        .send()
        .await?
        .error_for_status()
        .map_err(|e| PublishError::external(e.to_string()))?;

        info!(version_id, thumbnail = %path.display(), "Thumbnail uploaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    fn identity() -> Identity {
        Identity {
            asset: Some("chair".into()),
            task: Some("model".into()),
            sequence: None,
            shot: None,
            user: "abc".into(),
        }
    }

    fn ctx() -> ReviewContext {
        ReviewContext {
            project_id: 12,
            task_id: Some(40),
            entity: EntityLink::Asset(7),
            content: "chair_model".into(),
            user: "abc".into(),
        }
    }

    #[test]
    fn test_next_version_number() {
        let codes: Vec<String> = ["chair_model_v001_abc", "chair_model_v012_xyz", "chair_model_v3_abc", "notes"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(next_version_number(&codes), 13);
        assert_eq!(next_version_number(&[]), 1);
        assert_eq!(next_version_number(&["a_v1000_b".to_string()]), 1001);
    }

    #[test]
    fn test_version_code() {
        assert_eq!(version_code("chair_model", 4, "abc"), "chair_model_v004_abc");
        assert_eq!(version_code("sq01_sh010_anim", 1234, "xyz"), "sq01_sh010_anim_v1234_xyz");
    }

    #[test]
    fn test_context_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("HAL_PROJECT_SGID", "12"),
            ("HAL_TASK_SGID", "40"),
            ("HAL_ASSET_SGID", "0"),
            ("HAL_SHOT_SGID", "99"),
        ]
        .into_iter()
        .collect();
        let ctx = ReviewContext::from_lookup(|k| env.get(k).map(|v| v.to_string()), &identity()).unwrap();
        assert_eq!(ctx.entity, EntityLink::Shot(99));
        assert_eq!(ctx.task_id, Some(40));
        assert_eq!(ctx.content, "chair_model");

        let err = ReviewContext::from_lookup(|_| None, &identity()).unwrap_err();
        assert!(matches!(err, PublishError::Configuration(_)));
        let bad = ReviewContext::from_lookup(
            |k| (k == "HAL_PROJECT_SGID").then(|| "twelve".to_string()),
            &identity(),
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_request_bodies() {
        let search = search_body(&ctx());
        assert_eq!(search["filters"][1][2]["type"], "Asset");
        assert_eq!(search["filters"][2][2]["id"], 40);

        let record = ReviewRecord {
            code: "chair_model_v002_abc".into(),
            project_id: 12,
            entity: EntityLink::Asset(7),
            task_id: None,
            path: PathBuf::from("/p/chair.json"),
            status: "rev".into(),
            description: "Asset publish".into(),
            created_at: Utc::now(),
        };
        let body = create_body(&record);
        assert_eq!(body["code"], "chair_model_v002_abc");
        assert_eq!(body["sg_status_list"], "rev");
        assert!(body.get("sg_task").is_none());
    }

    #[derive(Default)]
    struct FakeReview {
        codes: Vec<String>,
        created: Mutex<Vec<ReviewRecord>>,
        thumbnails: Mutex<Vec<(u64, PathBuf)>>,
        fail_upload: bool,
    }

    #[async_trait]
    impl ReviewClient for FakeReview {
        async fn version_codes(&self, _ctx: &ReviewContext) -> Result<Vec<String>> {
            Ok(self.codes.clone())
        }

        async fn create_version(&self, record: &ReviewRecord) -> Result<u64> {
            self.created.lock().push(record.clone());
            Ok(501)
        }

        async fn upload_thumbnail(&self, version_id: u64, path: &Path) -> Result<()> {
            if self.fail_upload {
                return Err(PublishError::external("upload refused"));
            }
            self.thumbnails.lock().push((version_id, path.to_path_buf()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_submit_review_names_next_version() {
        let dir = tempfile::tempdir().unwrap();
        let thumb = dir.path().join("chair_temp.1001.png");
        std::fs::write(&thumb, b"png").unwrap();
        let client = FakeReview {
            codes: vec!["chair_model_v002_abc".into()],
            ..Default::default()
        };

        let result = submit_review(&client, &ctx(), Path::new("/p/chair.json"), Some(&thumb), "rev", &RetryPolicy::none())
            .await
            .unwrap();
        assert_eq!(result.code, "chair_model_v003_abc");
        assert!(result.thumbnail);
        assert_eq!(client.created.lock()[0].status, "rev");
        assert_eq!(client.thumbnails.lock()[0], (501, thumb));
    }

    #[test]
    fn test_missing_thumbnail_is_not_uploaded() {
        let client = FakeReview::default();
        let result = tokio_test::block_on(submit_review(
            &client,
            &ctx(),
            Path::new("/p/chair.json"),
            Some(Path::new("/nonexistent/chair_temp.1001.png")),
            "rev",
            &RetryPolicy::none(),
        ));
        let result = tokio_test::assert_ok!(result);
        assert!(!result.thumbnail);
        assert!(client.thumbnails.lock().is_empty());
    }

    #[tokio::test]
    async fn test_thumbnail_failure_keeps_record() {
        let client = FakeReview {
            fail_upload: true,
            ..Default::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let thumb = dir.path().join("t.png");
        std::fs::write(&thumb, b"png").unwrap();

        let result = submit_review(&client, &ctx(), Path::new("/p/chair.json"), Some(&thumb), "rev", &RetryPolicy::none())
            .await
            .unwrap();
        assert_eq!(result.code, "chair_model_v001_abc");
        assert!(!result.thumbnail);
        assert_eq!(client.created.lock().len(), 1);
    }
}

//! Analysis service reached over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::{AnalysisError, AnalysisOutput, AnalysisService, FeatureSet, ResultPage, StartJobRequest};
use crate::models::{JobStatus, ObjectLocation};

#[derive(Debug, Clone)]
pub struct HttpServiceConfig {
    pub base_url: String,
    /// Per-request timeout. Sync analysis adds its own deadline on top.
    pub request_timeout: Duration,
}

pub struct HttpAnalysisService {
    config: HttpServiceConfig,
    client: Client,
}

#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
    document: &'a ObjectLocation,
    features: FeatureSet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartJobResponse {
    job_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatusResponse {
    job_status: JobStatus,
}

impl HttpAnalysisService {
    pub fn new(config: HttpServiceConfig) -> Result<Self, AnalysisError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &HttpServiceConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn check(&self, resp: Response, job_id: Option<&str>) -> Result<Response, AnalysisError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(error_for_status(status, body, job_id))
    }
}

/// Map a non-success HTTP status to an analysis error.
fn error_for_status(status: StatusCode, body: String, job_id: Option<&str>) -> AnalysisError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => AnalysisError::Throttled(body),
        StatusCode::NOT_FOUND => match job_id {
            Some(id) => AnalysisError::JobNotFound(id.to_string()),
            None => AnalysisError::InvalidDocument(format!("HTTP 404: {}", body)),
        },
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::UNSUPPORTED_MEDIA_TYPE => {
            AnalysisError::InvalidDocument(format!("HTTP {}: {}", status, body))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => AnalysisError::Timeout,
        _ => AnalysisError::Service(format!("HTTP {}: {}", status, body)),
    }
}

fn map_send_error(e: reqwest::Error) -> AnalysisError {
    if e.is_timeout() {
        AnalysisError::Timeout
    } else {
        AnalysisError::Http(e)
    }
}

#[async_trait]
impl AnalysisService for HttpAnalysisService {
    async fn analyze(
        &self,
        document: &ObjectLocation,
        features: FeatureSet,
    ) -> Result<AnalysisOutput, AnalysisError> {
        let resp = self
            .client
            .post(self.url("analyze"))
            .json(&AnalyzeRequest { document, features })
            .send()
            .await
            .map_err(map_send_error)?;
        let resp = self.check(resp, None).await?;
        resp.json().await.map_err(map_send_error)
    }

    async fn start_job(&self, request: &StartJobRequest) -> Result<String, AnalysisError> {
        let resp = self
            .client
            .post(self.url("jobs"))
            .json(request)
            .send()
            .await
            .map_err(map_send_error)?;
        let resp = self.check(resp, None).await?;
        let started: StartJobResponse = resp.json().await.map_err(map_send_error)?;
        Ok(started.job_id)
    }

    async fn get_job_status(&self, job_id: &str) -> Result<JobStatus, AnalysisError> {
        let resp = self
            .client
            .get(self.url(&format!("jobs/{}", job_id)))
            .send()
            .await
            .map_err(map_send_error)?;
        let resp = self.check(resp, Some(job_id)).await?;
        let status: JobStatusResponse = resp.json().await.map_err(map_send_error)?;
        Ok(status.job_status)
    }

    async fn get_job_result(
        &self,
        job_id: &str,
        page_token: Option<&str>,
    ) -> Result<ResultPage, AnalysisError> {
        let mut request = self.client.get(self.url(&format!("jobs/{}/result", job_id)));
        if let Some(token) = page_token {
            request = request.query(&[("nextToken", token)]);
        }
        let resp = request.send().await.map_err(map_send_error)?;
        let resp = self.check(resp, Some(job_id)).await?;
        resp.json().await.map_err(map_send_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(base: &str) -> HttpAnalysisService {
        HttpAnalysisService::new(HttpServiceConfig {
            base_url: base.to_string(),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn test_url_joins_without_double_slash() {
        assert_eq!(service("http://ocr.local/").url("jobs/j1"), "http://ocr.local/jobs/j1");
        assert_eq!(service("http://ocr.local").url("analyze"), "http://ocr.local/analyze");
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            error_for_status(StatusCode::TOO_MANY_REQUESTS, "slow".into(), None),
            AnalysisError::Throttled(_)
        ));
        assert!(matches!(
            error_for_status(StatusCode::NOT_FOUND, String::new(), Some("j1")),
            AnalysisError::JobNotFound(id) if id == "j1"
        ));
        assert!(matches!(
            error_for_status(StatusCode::BAD_REQUEST, String::new(), None),
            AnalysisError::InvalidDocument(_)
        ));
        let err = error_for_status(StatusCode::SERVICE_UNAVAILABLE, String::new(), None);
        assert!(matches!(err, AnalysisError::Service(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_start_job_request_wire_format() {
        let request = StartJobRequest {
            document: ObjectLocation::new("docs", "a.pdf"),
            features: FeatureSet::default(),
            job_tag: "d1".into(),
            notification_channel: crate::analysis::NotificationChannel {
                topic: "completions".into(),
                publisher_role: "analysis-publisher".into(),
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["jobTag"], "d1");
        assert_eq!(json["notificationChannel"]["publisherRole"], "analysis-publisher");
        assert_eq!(json["features"]["tables"], true);
    }

    #[test]
    fn test_job_status_response_parses() {
        let parsed: JobStatusResponse =
            serde_json::from_str(r#"{"jobStatus":"IN_PROGRESS"}"#).unwrap();
        assert_eq!(parsed.job_status, JobStatus::InProgress);
    }
}

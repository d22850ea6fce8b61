use crate::auth::TokenSource;
use crate::{Entity, WorkspaceApi, WorkspaceApiError};
use async_trait::async_trait;
use common::WorkspaceRef;
use common::config::WorkspaceConfig;
use common::retry::{RetryPolicy, retry_with_backoff};
use reqwest::Url;
use serde::Deserialize;
use std::collections::BTreeMap;

/// HTTP client for the Firecloud/Rawls workspace API
pub struct FirecloudClient {
    base_url: Url,
    http: reqwest::Client,
    tokens: TokenSource,
    retry: RetryPolicy,
}

#[derive(Deserialize)]
struct WorkspaceResponse {
    workspace: WorkspaceDetails,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkspaceDetails {
    bucket_name: String,
}

impl FirecloudClient {
    pub fn new(config: &WorkspaceConfig) -> Result<Self, WorkspaceApiError> {
        let base_url = Url::parse(&config.api_url).map_err(|e| {
            WorkspaceApiError::Unexpected(format!("invalid API URL {}: {e}", config.api_url))
        })?;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            base_url,
            http,
            tokens: TokenSource::new(config.access_token.clone()),
            retry: RetryPolicy::new(config.max_retries),
        })
    }

    /// Swap the token source, e.g. for a fixed token
    pub fn with_tokens(mut self, tokens: TokenSource) -> Self {
        self.tokens = tokens;
        self
    }

    /// `{base}/api/workspaces/{namespace}/{name}/{extra...}`
    pub(crate) fn workspace_url(
        &self,
        workspace: &WorkspaceRef,
        extra: &[&str],
    ) -> Result<Url, WorkspaceApiError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                WorkspaceApiError::Unexpected(format!("{} cannot be a base URL", self.base_url))
            })?;
            segments
                .pop_if_empty()
                .extend([
                    "api",
                    "workspaces",
                    workspace.namespace.as_str(),
                    workspace.name.as_str(),
                ])
                .extend(extra);
        }
        Ok(url)
    }

    /// GET a JSON document, retrying transient connection errors
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, &str)],
    ) -> Result<T, WorkspaceApiError> {
        tracing::debug!(url = %url, "GET");

        retry_with_backoff(self.retry, WorkspaceApiError::is_transient, || async {
            let token = self.tokens.token().await?;
            let resp = self
                .http
                .get(url.clone())
                .bearer_auth(token)
                .query(query)
                .send()
                .await?;
            handle_response(resp).await
        })
        .await
    }
}

async fn handle_response<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, WorkspaceApiError> {
    if resp.status().is_success() {
        let body = resp.text().await?;
        Ok(serde_json::from_str(&body)?)
    } else {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(WorkspaceApiError::Api { status, body })
    }
}

#[async_trait]
impl WorkspaceApi for FirecloudClient {
    async fn bucket_name(&self, workspace: &WorkspaceRef) -> Result<String, WorkspaceApiError> {
        let url = self.workspace_url(workspace, &[])?;
        let resp: WorkspaceResponse = self
            .get_json(url, &[("fields", "workspace.bucketName")])
            .await?;
        Ok(resp.workspace.bucket_name)
    }

    async fn entity_types(
        &self,
        workspace: &WorkspaceRef,
    ) -> Result<Vec<String>, WorkspaceApiError> {
        let url = self.workspace_url(workspace, &["entities"])?;
        // keyed by entity type, values carry counts and column names
        let types: BTreeMap<String, serde_json::Value> = self.get_json(url, &[]).await?;
        Ok(types.into_keys().collect())
    }

    async fn entities(
        &self,
        workspace: &WorkspaceRef,
        entity_type: &str,
    ) -> Result<Vec<Entity>, WorkspaceApiError> {
        let url = self.workspace_url(workspace, &["entities", entity_type])?;
        self.get_json(url, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn client(api_url: &str) -> FirecloudClient {
        let config = WorkspaceConfig {
            api_url: api_url.to_string(),
            ..Default::default()
        };
        FirecloudClient::new(&config)
            .unwrap()
            .with_tokens(TokenSource::fixed("token"))
    }

    #[test]
    fn test_workspace_url() {
        let ws = WorkspaceRef::new("my-ns", "my ws");
        let url = client("https://api.firecloud.org/")
            .workspace_url(&ws, &["entities", "sample"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.firecloud.org/api/workspaces/my-ns/my%20ws/entities/sample"
        );
    }

    #[test]
    fn test_workspace_url_without_trailing_slash() {
        let ws = WorkspaceRef::new("ns", "ws");
        let url = client("http://localhost:8080").workspace_url(&ws, &[]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/api/workspaces/ns/ws");
    }

    #[test]
    fn test_invalid_api_url() {
        let config = WorkspaceConfig {
            api_url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(FirecloudClient::new(&config).is_err());
    }

    #[test]
    fn test_entity_deserialization() {
        let json = r#"[{
            "name": "s1",
            "entityType": "sample",
            "attributes": {
                "bam": "gs://bkt/s1.bam",
                "files": {"itemsType": "AttributeValue", "items": ["gs://bkt/a", "gs://bkt/b"]}
            }
        }]"#;
        let entities: Vec<Entity> = serde_json::from_str(json).unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].entity_type, "sample");
        assert_eq!(entities[0].attributes.len(), 2);
    }

    #[tokio::test]
    async fn test_connection_refused_is_fatal_without_retries() {
        let config = WorkspaceConfig {
            // nothing listens on the discard port
            api_url: "http://127.0.0.1:9".to_string(),
            max_retries: 0,
            ..Default::default()
        };
        let client = FirecloudClient::new(&config)
            .unwrap()
            .with_tokens(TokenSource::fixed("token"));

        let err = client
            .bucket_name(&WorkspaceRef::new("ns", "ws"))
            .await
            .unwrap_err();
        assert!(err.is_transient(), "expected connection error, got {err}");
    }

    #[tokio::test]
    async fn test_timeout_is_retried_then_fatal() {
        // accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicU32::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(socket);
            }
        });

        let config = WorkspaceConfig {
            api_url: format!("http://{addr}"),
            request_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let mut client = FirecloudClient::new(&config)
            .unwrap()
            .with_tokens(TokenSource::fixed("token"));
        client.retry = RetryPolicy {
            max_retries: 1,
            waiter: |_| 0.0,
        };

        let err = client
            .bucket_name(&WorkspaceRef::new("ns", "ws"))
            .await
            .unwrap_err();
        assert!(err.is_transient(), "expected a timeout, got {err}");
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }
}

//! GitHub Gist REST API backend.

use super::{BackendError, BackendResult, ContainerBackend, ContainerFile, ContainerInfo, FileMap};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use tracing::debug;

pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Gists refuse to be created without at least one file.
const PLACEHOLDER_FILE: &str = "README.md";

#[derive(Debug, Deserialize)]
struct GistFile {
    #[serde(default)]
    size: u64,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    truncated: bool,
    #[serde(default)]
    raw_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Gist {
    id: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    files: BTreeMap<String, GistFile>,
}

impl Gist {
    fn into_info(self) -> ContainerInfo {
        ContainerInfo {
            id: self.id,
            description: self.description.unwrap_or_default(),
            files: self
                .files
                .into_iter()
                .map(|(name, file)| (name, ContainerFile { size: file.size }))
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct CreateGist<'a> {
    description: &'a str,
    public: bool,
    files: Map<String, Value>,
}

#[derive(Clone)]
pub struct GistBackend {
    client: Client,
    api_url: String,
    token: String,
}

impl GistBackend {
    pub fn new(token: impl Into<String>, api_url: impl Into<String>) -> BackendResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("gist-shard-store/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| BackendError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_url, path))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn send(&self, builder: RequestBuilder) -> BackendResult<Response> {
        builder
            .send()
            .await
            .map_err(|err| BackendError::Transport(err.to_string()))
    }

    async fn expect_success(response: Response, container_id: &str) -> BackendResult<Response> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(BackendError::ContainerNotFound(container_id.to_string()));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(BackendError::Http {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    async fn fetch_gist(&self, container_id: &str) -> BackendResult<Gist> {
        let response = self
            .send(self.request(Method::GET, &format!("/gists/{}", container_id)))
            .await?;
        let response = Self::expect_success(response, container_id).await?;
        response
            .json::<Gist>()
            .await
            .map_err(|err| BackendError::Transport(err.to_string()))
    }

    async fn patch_files(&self, files: Map<String, Value>, container_id: &str) -> BackendResult<()> {
        let response = self
            .send(
                self.request(Method::PATCH, &format!("/gists/{}", container_id))
                    .json(&json!({ "files": files })),
            )
            .await?;
        Self::expect_success(response, container_id).await?;
        Ok(())
    }
}

#[async_trait]
impl ContainerBackend for GistBackend {
    async fn get_file_content(&self, filename: &str, container_id: &str) -> BackendResult<Option<String>> {
        let mut gist = self.fetch_gist(container_id).await?;
        let Some(file) = gist.files.remove(filename) else {
            return Ok(None);
        };
        if !file.truncated {
            return Ok(file.content);
        }

        // Large files are truncated in the gist payload; fetch the raw blob.
        let Some(raw_url) = file.raw_url else {
            return Ok(file.content);
        };
        debug!("fetching truncated gist file {} from raw url", filename);
        let response = self.send(self.client.get(raw_url).bearer_auth(&self.token)).await?;
        let response = Self::expect_success(response, container_id).await?;
        response
            .text()
            .await
            .map(Some)
            .map_err(|err| BackendError::Transport(err.to_string()))
    }

    async fn update_files(&self, files: FileMap, container_id: &str) -> BackendResult<()> {
        let payload = files
            .into_iter()
            .map(|(name, content)| (name, json!({ "content": content })))
            .collect();
        self.patch_files(payload, container_id).await
    }

    async fn delete_files(&self, filenames: &[String], container_id: &str) -> BackendResult<()> {
        if filenames.is_empty() {
            return Ok(());
        }
        let payload = filenames
            .iter()
            .map(|name| (name.clone(), Value::Null))
            .collect();
        self.patch_files(payload, container_id).await
    }

    async fn create_container(&self, description: &str, files: FileMap) -> BackendResult<ContainerInfo> {
        let mut payload: Map<String, Value> = files
            .into_iter()
            .map(|(name, content)| (name, json!({ "content": content })))
            .collect();
        if payload.is_empty() {
            payload.insert(
                PLACEHOLDER_FILE.to_string(),
                json!({ "content": format!("# {}", description) }),
            );
        }

        let body = CreateGist {
            description,
            public: false,
            files: payload,
        };
        let response = self.send(self.request(Method::POST, "/gists").json(&body)).await?;
        let response = Self::expect_success(response, "new").await?;
        let gist = response
            .json::<Gist>()
            .await
            .map_err(|err| BackendError::Transport(err.to_string()))?;
        Ok(gist.into_info())
    }

    async fn delete_container(&self, container_id: &str) -> BackendResult<()> {
        let response = self
            .send(self.request(Method::DELETE, &format!("/gists/{}", container_id)))
            .await?;
        Self::expect_success(response, container_id).await?;
        Ok(())
    }

    async fn get_container(&self, container_id: &str) -> BackendResult<Option<ContainerInfo>> {
        match self.fetch_gist(container_id).await {
            Ok(gist) => Ok(Some(gist.into_info())),
            Err(BackendError::ContainerNotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gist_payload_maps_to_container_info() {
        let raw = r#"{
            "id": "abc123",
            "description": "Media shard media-2",
            "files": {
                "shard-manifest.json": {"size": 42, "content": "{}", "truncated": false},
                "media_aHR0cA": {"size": 7}
            }
        }"#;
        let gist: Gist = serde_json::from_str(raw).unwrap();
        let info = gist.into_info();
        assert_eq!(info.id, "abc123");
        assert_eq!(info.description, "Media shard media-2");
        assert_eq!(info.files["shard-manifest.json"].size, 42);
        assert_eq!(info.files.len(), 2);
    }

    #[test]
    fn api_url_is_normalized() {
        let backend = GistBackend::new("t", "https://api.github.com/").unwrap();
        assert_eq!(backend.api_url, "https://api.github.com");
    }
}

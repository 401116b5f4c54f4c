//! HTTP client for `covend`, over its Unix-domain control socket.
//!
//! Mirrors the teacher's `reqwest`-based `Client` in shape (one method per
//! endpoint, a `ClientError` covering connection/HTTP/parse failures) but
//! talks `hyperlocal`'s `UnixConnector` instead of TCP, since `covend` binds
//! no network port at all (spec Section 6 filesystem layout: `covend.sock`).

use std::path::{Path, PathBuf};

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::client::legacy::Client as HyperClient;
use hyperlocal::{UnixClientExt, UnixConnector, Uri as UnixUri};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("covend is not running at {socket}\n  → start it with: covend --workspace={workspace}")]
    NotRunning { socket: String, workspace: String },

    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("invalid response from covend: {0}")]
    InvalidResponse(String),

    #[error("request failed: {0}")]
    Transport(String),
}

#[derive(Debug, serde::Deserialize)]
struct ErrorBody {
    error: String,
}

pub struct Client {
    socket_path: PathBuf,
    workspace: PathBuf,
    http: HyperClient<UnixConnector, Full<Bytes>>,
}

impl Client {
    pub fn new(workspace: &Path) -> Self {
        Self {
            socket_path: workspace.join(".coven").join("covend.sock"),
            workspace: workspace.to_path_buf(),
            http: HyperClient::unix(),
        }
    }

    async fn send<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Req>,
    ) -> Result<Resp, ClientError> {
        let bytes = self.send_raw(method, path, body).await?;
        serde_json::from_slice(&bytes).map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    async fn send_raw<Req: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Req>,
    ) -> Result<Vec<u8>, ClientError> {
        let uri: hyper::Uri = UnixUri::new(&self.socket_path, path).into();
        let body_bytes = match body {
            Some(b) => serde_json::to_vec(b).map_err(|e| ClientError::InvalidResponse(e.to_string()))?,
            None => Vec::new(),
        };

        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let request = builder
            .body(Full::new(Bytes::from(body_bytes)))
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let response = self.http.request(request).await.map_err(|_| ClientError::NotRunning {
            socket: self.socket_path.display().to_string(),
            workspace: self.workspace.display().to_string(),
        })?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            let message = serde_json::from_slice::<ErrorBody>(&bytes)
                .map(|e| e.error)
                .unwrap_or_else(|_| status.canonical_reason().unwrap_or("unknown error").to_string());
            return Err(ClientError::Http { status: status.as_u16(), message });
        }

        Ok(bytes.to_vec())
    }

    pub async fn health(&self) -> Result<serde_json::Value, ClientError> {
        self.send::<(), _>(Method::GET, "/health", None).await
    }

    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.send_raw::<()>(Method::POST, "/shutdown", None).await.map(|_| ())
    }

    pub async fn state(&self) -> Result<serde_json::Value, ClientError> {
        self.send::<(), _>(Method::GET, "/state", None).await
    }

    pub async fn list_tasks(&self) -> Result<serde_json::Value, ClientError> {
        self.send::<(), _>(Method::GET, "/tasks", None).await
    }

    pub async fn get_task(&self, id: &str) -> Result<serde_json::Value, ClientError> {
        self.send::<(), _>(Method::GET, &format!("/tasks/{id}"), None).await
    }

    pub async fn create_task(&self, body: &serde_json::Value) -> Result<serde_json::Value, ClientError> {
        self.send(Method::POST, "/tasks", Some(body)).await
    }

    pub async fn bulk_create_tasks(&self, body: &serde_json::Value) -> Result<serde_json::Value, ClientError> {
        self.send(Method::POST, "/tasks/bulk", Some(body)).await
    }

    pub async fn patch_task(&self, id: &str, body: &serde_json::Value) -> Result<serde_json::Value, ClientError> {
        self.send(Method::PATCH, &format!("/tasks/{id}"), Some(body)).await
    }

    pub async fn delete_task(&self, id: &str) -> Result<(), ClientError> {
        self.send_raw::<()>(Method::DELETE, &format!("/tasks/{id}"), None).await.map(|_| ())
    }

    pub async fn claim_task(&self, id: &str, agent_id: &str) -> Result<serde_json::Value, ClientError> {
        self.send(Method::POST, &format!("/tasks/{id}/claim"), Some(&serde_json::json!({ "agent_id": agent_id })))
            .await
    }

    pub async fn release_task(&self, id: &str) -> Result<serde_json::Value, ClientError> {
        self.send::<(), _>(Method::POST, &format!("/tasks/{id}/release"), None).await
    }

    pub async fn complete_task(&self, id: &str) -> Result<serde_json::Value, ClientError> {
        self.send::<(), _>(Method::POST, &format!("/tasks/{id}/complete"), None).await
    }

    pub async fn block_task(&self, id: &str) -> Result<serde_json::Value, ClientError> {
        self.send::<(), _>(Method::POST, &format!("/tasks/{id}/block"), None).await
    }

    pub async fn add_tags(&self, id: &str, tags: &[String]) -> Result<serde_json::Value, ClientError> {
        self.send(Method::POST, &format!("/tasks/{id}/tags"), Some(&serde_json::json!({ "tags": tags }))).await
    }

    pub async fn remove_tags(&self, id: &str, tags: &[String]) -> Result<serde_json::Value, ClientError> {
        self.send(Method::DELETE, &format!("/tasks/{id}/tags"), Some(&serde_json::json!({ "tags": tags }))).await
    }

    pub async fn reparent_task(&self, id: &str, new_parent_id: &str) -> Result<serde_json::Value, ClientError> {
        self.send(
            Method::POST,
            &format!("/tasks/{id}/reparent"),
            Some(&serde_json::json!({ "new_parent_id": new_parent_id })),
        )
        .await
    }

    pub async fn children(&self, id: &str) -> Result<serde_json::Value, ClientError> {
        self.send::<(), _>(Method::GET, &format!("/tasks/{id}/children"), None).await
    }

    pub async fn history(&self, id: &str) -> Result<serde_json::Value, ClientError> {
        self.send::<(), _>(Method::GET, &format!("/tasks/{id}/history"), None).await
    }

    pub async fn list_workflows(&self) -> Result<serde_json::Value, ClientError> {
        self.send::<(), _>(Method::GET, "/workflows", None).await
    }

    pub async fn get_workflow(&self, id: &str) -> Result<serde_json::Value, ClientError> {
        self.send::<(), _>(Method::GET, &format!("/workflows/{id}"), None).await
    }

    pub async fn workflow_log(&self, id: &str) -> Result<String, ClientError> {
        let bytes = self.send_raw::<()>(Method::GET, &format!("/workflows/{id}/log"), None).await?;
        String::from_utf8(bytes).map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn cancel_workflow(&self, id: &str) -> Result<(), ClientError> {
        self.send_raw::<()>(Method::POST, &format!("/workflows/{id}/cancel"), None).await.map(|_| ())
    }

    pub async fn retry_workflow(&self, id: &str) -> Result<(), ClientError> {
        self.send_raw::<()>(Method::POST, &format!("/workflows/{id}/retry"), None).await.map(|_| ())
    }

    pub async fn approve_merge(&self, id: &str) -> Result<(), ClientError> {
        self.send_raw::<()>(Method::POST, &format!("/workflows/{id}/approve-merge"), None).await.map(|_| ())
    }

    pub async fn reject_merge(&self, id: &str) -> Result<(), ClientError> {
        self.send_raw::<()>(Method::POST, &format!("/workflows/{id}/reject-merge"), None).await.map(|_| ())
    }

    pub async fn agent_output(&self, id: &str, since: Option<usize>) -> Result<serde_json::Value, ClientError> {
        let path = match since {
            Some(n) => format!("/agents/{id}/output?since={n}"),
            None => format!("/agents/{id}/output"),
        };
        self.send::<(), _>(Method::GET, &path, None).await
    }

    pub async fn answer_question(&self, id: &str, answer: &str) -> Result<serde_json::Value, ClientError> {
        self.send(Method::POST, &format!("/questions/{id}/answer"), Some(&serde_json::json!({ "answer": answer })))
            .await
    }
}

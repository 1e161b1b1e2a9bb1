//! Client for the external code-execution sandbox.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use warden_core::ids::SessionId;

use crate::error::SandboxError;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
}

impl ExecOutput {
    /// Combined output as shown to the client.
    pub fn render(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Operations a tool call may perform inside a session's sandbox.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn execute(
        &self,
        session_id: &SessionId,
        command: &str,
        working_dir: Option<&str>,
    ) -> Result<ExecOutput, SandboxError>;

    async fn read_file(&self, session_id: &SessionId, path: &str) -> Result<String, SandboxError>;

    async fn write_file(
        &self,
        session_id: &SessionId,
        path: &str,
        content: &str,
    ) -> Result<String, SandboxError>;

    async fn list_files(
        &self,
        session_id: &SessionId,
        path: &str,
    ) -> Result<Vec<String>, SandboxError>;
}

#[derive(Serialize)]
struct ExecuteBody<'a> {
    session_id: &'a str,
    command: &'a str,
    language: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    working_dir: Option<&'a str>,
}

#[derive(Serialize)]
struct ReadBody<'a> {
    session_id: &'a str,
    file_path: &'a str,
}

#[derive(Serialize)]
struct WriteBody<'a> {
    session_id: &'a str,
    file_path: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ListBody<'a> {
    session_id: &'a str,
    path: &'a str,
}

#[derive(Deserialize)]
struct Reply<T> {
    #[serde(default)]
    error: Option<String>,
    #[serde(flatten)]
    body: T,
}

#[derive(Deserialize)]
struct ContentReply {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct MessageReply {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct FilesReply {
    #[serde(default)]
    files: Vec<String>,
}

/// JSON-over-HTTP sandbox.
#[derive(Clone)]
pub struct HttpSandbox {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSandbox {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SandboxError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, SandboxError> {
        let url = format!("{}{path}", self.base_url);
        let response = self.client.post(&url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SandboxError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let reply: Reply<T> = response.json().await?;
        match reply.error {
            Some(error) if !error.is_empty() => Err(SandboxError::Remote(error)),
            _ => Ok(reply.body),
        }
    }
}

#[async_trait]
impl Sandbox for HttpSandbox {
    #[instrument(skip(self, command), fields(session_id = %session_id))]
    async fn execute(
        &self,
        session_id: &SessionId,
        command: &str,
        working_dir: Option<&str>,
    ) -> Result<ExecOutput, SandboxError> {
        let out: ExecOutput = self
            .post(
                "/execute",
                &ExecuteBody {
                    session_id: session_id.as_str(),
                    command,
                    language: "bash",
                    working_dir,
                },
            )
            .await?;
        debug!(exit_code = out.exit_code, "sandbox command finished");
        Ok(out)
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn read_file(&self, session_id: &SessionId, path: &str) -> Result<String, SandboxError> {
        let reply: ContentReply = self
            .post(
                "/file/read",
                &ReadBody {
                    session_id: session_id.as_str(),
                    file_path: path,
                },
            )
            .await?;
        Ok(reply.content)
    }

    #[instrument(skip(self, content), fields(session_id = %session_id, bytes = content.len()))]
    async fn write_file(
        &self,
        session_id: &SessionId,
        path: &str,
        content: &str,
    ) -> Result<String, SandboxError> {
        let reply: MessageReply = self
            .post(
                "/file/write",
                &WriteBody {
                    session_id: session_id.as_str(),
                    file_path: path,
                    content,
                },
            )
            .await?;
        Ok(reply.message)
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn list_files(
        &self,
        session_id: &SessionId,
        path: &str,
    ) -> Result<Vec<String>, SandboxError> {
        let reply: FilesReply = self
            .post(
                "/file/list",
                &ListBody {
                    session_id: session_id.as_str(),
                    path,
                },
            )
            .await?;
        Ok(reply.files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn sandbox() -> (MockServer, HttpSandbox) {
        let server = MockServer::start().await;
        let client = HttpSandbox::new(server.uri(), Duration::from_secs(5)).unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn execute_posts_command_and_parses_output() {
        let (server, client) = sandbox().await;
        let session = SessionId::from_raw("sess_exec");
        Mock::given(method("POST"))
            .and(path("/execute"))
            .and(body_partial_json(json!({
                "session_id": "sess_exec",
                "command": "echo hi",
                "language": "bash"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "stdout": "hi\n",
                "stderr": "",
                "exit_code": 0
            })))
            .expect(1)
            .mount(&server)
            .await;

        let out = client.execute(&session, "echo hi", None).await.unwrap();
        assert_eq!(out.stdout, "hi\n");
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.render(), "hi\n");
    }

    #[tokio::test]
    async fn error_field_becomes_remote_error() {
        let (server, client) = sandbox().await;
        Mock::given(method("POST"))
            .and(path("/file/read"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "error",
                "error": "no such file"
            })))
            .mount(&server)
            .await;

        let err = client
            .read_file(&SessionId::new(), "missing.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Remote(ref m) if m == "no such file"));
    }

    #[tokio::test]
    async fn empty_error_field_is_success() {
        let (server, client) = sandbox().await;
        Mock::given(method("POST"))
            .and(path("/file/write"))
            .and(body_partial_json(json!({"file_path": "a.txt", "content": "body"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "message": "written",
                "error": ""
            })))
            .mount(&server)
            .await;

        let msg = client
            .write_file(&SessionId::new(), "a.txt", "body")
            .await
            .unwrap();
        assert_eq!(msg, "written");
    }

    #[tokio::test]
    async fn list_files_returns_names() {
        let (server, client) = sandbox().await;
        Mock::given(method("POST"))
            .and(path("/file/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "files": ["a.txt", "src/"]
            })))
            .mount(&server)
            .await;

        let files = client.list_files(&SessionId::new(), ".").await.unwrap();
        assert_eq!(files, vec!["a.txt".to_string(), "src/".to_string()]);
    }

    #[tokio::test]
    async fn http_failure_carries_status_and_body() {
        let (server, client) = sandbox().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = client
            .execute(&SessionId::new(), "ls", Some("/work"))
            .await
            .unwrap_err();
        match err {
            SandboxError::Status { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_body_is_decode_error() {
        let (server, client) = sandbox().await;
        Mock::given(method("POST"))
            .and(path("/file/list"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = client.list_files(&SessionId::new(), ".").await.unwrap_err();
        assert!(matches!(err, SandboxError::Decode(_)));
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let client = HttpSandbox::new("http://sandbox:8090/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://sandbox:8090");
    }

    #[test]
    fn render_joins_streams() {
        let out = ExecOutput {
            stdout: "out".into(),
            stderr: "err".into(),
            exit_code: 1,
        };
        assert_eq!(out.render(), "out\nerr");
    }
}

//! Thin HTTP client for the server API, with the CLI's exit-code taxonomy.
//!
//! Exit codes: 0 success, 1 user error, 2 remote error, 3 timeout.

use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliErrorKind {
    /// Bad input or local misuse → exit 1.
    User,
    /// Server/network failure → exit 2.
    Remote,
    /// Watch deadline elapsed → exit 3.
    Timeout,
}

#[derive(Debug)]
pub struct CliError {
    pub kind: CliErrorKind,
    pub message: String,
}

impl CliError {
    pub fn user(message: impl Into<String>) -> Self {
        CliError {
            kind: CliErrorKind::User,
            message: message.into(),
        }
    }

    pub fn remote(message: impl Into<String>) -> Self {
        CliError {
            kind: CliErrorKind::Remote,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        CliError {
            kind: CliErrorKind::Timeout,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self.kind {
            CliErrorKind::User => 1,
            CliErrorKind::Remote => 2,
            CliErrorKind::Timeout => 3,
        }
    }
}

pub struct Api {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl Api {
    pub fn new(server: &str, token: &str) -> Self {
        Api {
            http: reqwest::Client::builder()
                .user_agent(concat!("kitt-cli/", env!("CARGO_PKG_VERSION")))
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base: server.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{path}", self.base)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, CliError> {
        let url = self.url(path);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| CliError::remote(format!("GET {url}: {e}")))?;
        Self::decode(url, resp).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, CliError> {
        let url = self.url(path);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(|e| CliError::remote(format!("POST {url}: {e}")))?;
        Self::decode(url, resp).await
    }

    pub async fn post_empty<T: DeserializeOwned>(&self, path: &str) -> Result<T, CliError> {
        self.post(path, &serde_json::json!({})).await
    }

    async fn decode<T: DeserializeOwned>(url: String, resp: reqwest::Response) -> Result<T, CliError> {
        let status = resp.status();
        if status.is_success() {
            return resp
                .json()
                .await
                .map_err(|e| CliError::remote(format!("{url}: bad response body: {e}")));
        }

        let detail = resp
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
            .unwrap_or_else(|| status.to_string());

        // 4xx is on the operator; everything else is the server's problem.
        if status.is_client_error() {
            Err(CliError::user(format!("{url}: {detail}")))
        } else {
            Err(CliError::remote(format!("{url}: {detail}")))
        }
    }
}

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use url::Url;

use super::RemoteStore;
use crate::cache::Payload;
use crate::error::SyncError;
use crate::mutation::MutationKind;
use crate::records::record_id;

/// REST-style remote store.
///
/// - `GET {base}/{domain}` returns a JSON array of records
/// - `POST {base}/{domain}` creates
/// - `PUT {base}/{domain}/{id}` updates
/// - `DELETE {base}/{domain}/{id}` deletes
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  base: Url,
  id_field: String,
}

impl HttpRemote {
  pub fn new(base_url: &str, id_field: &str) -> Result<Self> {
    let mut base =
      Url::parse(base_url).map_err(|e| eyre!("Invalid remote url '{}': {}", base_url, e))?;

    // Url::join replaces the last segment unless the path ends with a slash
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      id_field: id_field.to_string(),
    })
  }

  fn endpoint(&self, domain: &str, id: Option<&str>) -> Result<Url, SyncError> {
    let path = match id {
      Some(id) => format!("{}/{}", domain, id),
      None => domain.to_string(),
    };
    self
      .base
      .join(&path)
      .map_err(|e| SyncError::fatal(format!("Invalid endpoint '{}': {}", path, e)))
  }

  async fn send(&self, method: Method, url: Url, body: Option<&Value>) -> Result<Vec<u8>, SyncError> {
    let mut request = self.client.request(method.clone(), url.clone());
    if let Some(body) = body {
      let bytes = serde_json::to_vec(body)
        .map_err(|e| SyncError::fatal(format!("Failed to serialize payload: {}", e)))?;
      request = request
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(bytes);
    }

    let response = request.send().await.map_err(classify_transport)?;
    let status = response.status();
    let bytes = response.bytes().await.map_err(classify_transport)?;

    if status.is_success() {
      tracing::debug!(%method, %url, %status, "remote call ok");
      Ok(bytes.to_vec())
    } else {
      let body = String::from_utf8_lossy(&bytes).into_owned();
      tracing::debug!(%method, %url, %status, "remote call rejected");
      Err(classify_status(status, body))
    }
  }
}

#[async_trait]
impl RemoteStore for HttpRemote {
  async fn fetch_domain(&self, domain: &str) -> Result<Payload, SyncError> {
    let url = self.endpoint(domain, None)?;
    let bytes = self.send(Method::GET, url, None).await?;

    serde_json::from_slice(&bytes)
      .map_err(|e| SyncError::fatal(format!("Failed to parse {} payload: {}", domain, e)))
  }

  async fn write_entity(
    &self,
    domain: &str,
    kind: MutationKind,
    payload: &Value,
  ) -> Result<Option<Value>, SyncError> {
    let (method, url, body) = match kind {
      MutationKind::Create => (Method::POST, self.endpoint(domain, None)?, Some(payload)),
      MutationKind::Update | MutationKind::Delete => {
        let id = record_id(payload, &self.id_field).ok_or_else(|| {
          SyncError::validation(format!("Payload has no '{}' field", self.id_field))
        })?;
        let url = self.endpoint(domain, Some(&id))?;
        if kind == MutationKind::Update {
          (Method::PUT, url, Some(payload))
        } else {
          (Method::DELETE, url, None)
        }
      }
    };

    let bytes = self.send(method, url, body).await?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
      return Ok(None);
    }

    serde_json::from_slice(&bytes)
      .map(Some)
      .map_err(|e| SyncError::fatal(format!("Failed to parse write response: {}", e)))
  }
}

fn classify_transport(err: reqwest::Error) -> SyncError {
  if err.is_timeout() {
    SyncError::Timeout {
      message: err.to_string(),
    }
  } else if err.is_connect() || err.is_request() || err.is_body() {
    SyncError::network(err.to_string())
  } else {
    SyncError::fatal(err.to_string())
  }
}

/// Map an HTTP error status onto the error taxonomy.
pub(crate) fn classify_status(status: StatusCode, body: String) -> SyncError {
  let message = if body.trim().is_empty() {
    status.to_string()
  } else {
    body
  };

  match status {
    StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => SyncError::conflict(message),
    StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => SyncError::validation(message),
    StatusCode::REQUEST_TIMEOUT
    | StatusCode::TOO_MANY_REQUESTS
    | StatusCode::BAD_GATEWAY
    | StatusCode::SERVICE_UNAVAILABLE
    | StatusCode::GATEWAY_TIMEOUT => SyncError::network(message),
    _ => SyncError::fatal(message),
  }
}

// ABOUTME: reqwest-backed RemoteService speaking a plain REST collection API.
// ABOUTME: Maps change kinds to POST/PUT/DELETE and HTTP statuses to transient or permanent errors.

use std::time::Duration;

use async_trait::async_trait;
use fieldsync_core::ChangeKind;
use reqwest::{StatusCode, Url};
use thiserror::Error;

use crate::remote::{RemoteError, RemoteRequest, RemoteService};

/// Errors building an HttpRemote.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("invalid remote url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// How a response status settles a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Accepted,
    Transient,
    Rejected,
}

fn classify(kind: ChangeKind, status: StatusCode) -> Disposition {
    if status.is_success() {
        return Disposition::Accepted;
    }
    // Already gone on the remote: the delete has the effect the caller wanted
    if kind == ChangeKind::Delete && status == StatusCode::NOT_FOUND {
        return Disposition::Accepted;
    }
    if status.is_client_error()
        && status != StatusCode::REQUEST_TIMEOUT
        && status != StatusCode::TOO_MANY_REQUESTS
    {
        return Disposition::Rejected;
    }
    Disposition::Transient
}

/// Remote record service over HTTP.
///
/// - create: `POST {base}/{entity_type}`
/// - update: `PUT {base}/{entity_type}/{entity_id}`
/// - delete: `DELETE {base}/{entity_type}/{entity_id}`
///
/// Every request carries the change id in an `Idempotency-Key` header.
pub struct HttpRemote {
    client: reqwest::Client,
    base: Url,
    timeout: Duration,
}

impl HttpRemote {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, EndpointError> {
        let base = Url::parse(base_url).map_err(|e| EndpointError::InvalidUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        if base.cannot_be_a_base() {
            return Err(EndpointError::InvalidUrl {
                url: base_url.to_string(),
                reason: "url cannot carry a path".to_string(),
            });
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base,
            timeout,
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, entity_type: &str, entity_id: Option<&str>) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(entity_type);
            if let Some(id) = entity_id {
                segments.push(id);
            }
        }
        url
    }
}

#[async_trait]
impl RemoteService for HttpRemote {
    async fn apply(&self, request: &RemoteRequest) -> Result<(), RemoteError> {
        let builder = match request.kind {
            ChangeKind::Create => self
                .client
                .post(self.endpoint(&request.entity_type, None))
                .json(&request.payload),
            ChangeKind::Update => self
                .client
                .put(self.endpoint(&request.entity_type, Some(&request.entity_id)))
                .json(&request.payload),
            ChangeKind::Delete => self
                .client
                .delete(self.endpoint(&request.entity_type, Some(&request.entity_id))),
        };

        let response = builder
            .header("Idempotency-Key", request.idempotency_key.to_string())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RemoteError::Timeout(self.timeout)
                } else {
                    RemoteError::Transient(e.to_string())
                }
            })?;

        let status = response.status();
        match classify(request.kind, status) {
            Disposition::Accepted => Ok(()),
            disposition => {
                let body = response.text().await.unwrap_or_default();
                let message = if body.is_empty() {
                    status.to_string()
                } else {
                    format!("{}: {}", status, body)
                };
                if disposition == Disposition::Rejected {
                    Err(RemoteError::Rejected(message))
                } else {
                    Err(RemoteError::Transient(message))
                }
            }
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_statuses_are_accepted() {
        assert_eq!(classify(ChangeKind::Create, StatusCode::CREATED), Disposition::Accepted);
        assert_eq!(classify(ChangeKind::Update, StatusCode::OK), Disposition::Accepted);
        assert_eq!(
            classify(ChangeKind::Delete, StatusCode::NO_CONTENT),
            Disposition::Accepted
        );
    }

    #[test]
    fn not_found_is_only_accepted_for_deletes() {
        assert_eq!(
            classify(ChangeKind::Delete, StatusCode::NOT_FOUND),
            Disposition::Accepted
        );
        assert_eq!(
            classify(ChangeKind::Update, StatusCode::NOT_FOUND),
            Disposition::Rejected
        );
    }

    #[test]
    fn client_errors_are_permanent_except_timeouts_and_throttling() {
        assert_eq!(
            classify(ChangeKind::Create, StatusCode::UNPROCESSABLE_ENTITY),
            Disposition::Rejected
        );
        assert_eq!(classify(ChangeKind::Create, StatusCode::CONFLICT), Disposition::Rejected);
        assert_eq!(
            classify(ChangeKind::Create, StatusCode::REQUEST_TIMEOUT),
            Disposition::Transient
        );
        assert_eq!(
            classify(ChangeKind::Create, StatusCode::TOO_MANY_REQUESTS),
            Disposition::Transient
        );
    }

    #[test]
    fn server_errors_are_transient() {
        assert_eq!(
            classify(ChangeKind::Update, StatusCode::SERVICE_UNAVAILABLE),
            Disposition::Transient
        );
        assert_eq!(
            classify(ChangeKind::Update, StatusCode::INTERNAL_SERVER_ERROR),
            Disposition::Transient
        );
    }

    #[test]
    fn endpoints_append_collection_and_id() {
        let remote = HttpRemote::new("http://localhost:9000/api/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            remote.endpoint("migrants", None).as_str(),
            "http://localhost:9000/api/migrants"
        );
        assert_eq!(
            remote.endpoint("migrants", Some("M 1")).as_str(),
            "http://localhost:9000/api/migrants/M%201"
        );
    }

    #[test]
    fn rejects_unusable_base_urls() {
        assert!(matches!(
            HttpRemote::new("not a url", Duration::from_secs(1)),
            Err(EndpointError::InvalidUrl { .. })
        ));
        assert!(matches!(
            HttpRemote::new("mailto:ops@example.org", Duration::from_secs(1)),
            Err(EndpointError::InvalidUrl { .. })
        ));
    }
}

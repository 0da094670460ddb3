//! Typed REST client for the secrets API.
//!
//! Speaks just enough of the Kubernetes API for the monitor: listing
//! secrets and following the change stream of a watch request. Responses
//! deserialize into a reduced schema; anything that does not decode as a
//! secret is rejected at this boundary, so the reconciliation core never
//! sees an object of the wrong kind.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use certwatch_common::SecretRef;
use futures_util::{stream, Stream, StreamExt, TryStreamExt};
use thiserror::Error;
use tracing::{debug, warn};

use super::config::{KubeAuth, ResolvedKubeConfig};

/// Decoded view of one secret: data fields as raw bytes.
///
/// The API server ships data values base64-encoded; they are decoded here
/// once so the scanner only ever deals with the actual bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretRecord {
    /// Field name → decoded value
    pub data: HashMap<String, Vec<u8>>,
}

/// One decoded entry of a watch stream.
#[derive(Debug)]
pub enum WatchEvent {
    /// New secret
    Added {
        key: SecretRef,
        record: SecretRecord,
        resource_version: Option<String>,
    },
    /// Changed secret
    Modified {
        key: SecretRef,
        record: SecretRecord,
        resource_version: Option<String>,
    },
    /// Removed secret
    Deleted {
        key: SecretRef,
        resource_version: Option<String>,
    },
    /// Progress marker carrying only a resume point
    Bookmark { resource_version: String },
}

/// Errors talking to the API server.
#[derive(Debug, Error)]
pub enum KubeClientError {
    #[error("building HTTP client: {0}")]
    Build(#[source] reqwest::Error),
    #[error("invalid CA or client identity: {0}")]
    Identity(#[source] reqwest::Error),
    #[error("requesting {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("API server returned {status} for {url}")]
    Status {
        status: reqwest::StatusCode,
        url: String,
    },
    #[error("decoding watch line: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("watch stream error: {0}")]
    WatchStream(#[source] reqwest::Error),
    #[error("API server watch error: {message} (code {code})")]
    WatchError { message: String, code: i32 },
}

/// Reduced wire schema for the secrets API.
mod wire {
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Deserialize)]
    pub struct SecretList {
        pub metadata: ListMeta,
        #[serde(default)]
        pub items: Vec<Secret>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ListMeta {
        pub resource_version: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Secret {
        pub metadata: ObjectMeta,
        #[serde(default)]
        pub data: HashMap<String, String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ObjectMeta {
        pub name: String,
        pub namespace: String,
        pub resource_version: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct WatchLine {
        #[serde(rename = "type")]
        pub kind: String,
        pub object: serde_json::Value,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct WatchStatus {
        #[serde(default)]
        pub message: String,
        #[serde(default)]
        pub code: i32,
    }

    #[derive(Debug, Deserialize)]
    pub struct BookmarkObject {
        pub metadata: BookmarkMeta,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct BookmarkMeta {
        pub resource_version: String,
    }
}

/// Client scoped to the secrets resource, optionally to one namespace.
pub struct SecretClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    namespace: Option<String>,
}

impl SecretClient {
    /// Build a client from resolved connection configuration.
    ///
    /// `namespace = None` watches secrets cluster-wide.
    pub fn new(
        config: &ResolvedKubeConfig,
        namespace: Option<String>,
    ) -> Result<Self, KubeClientError> {
        let mut builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify)
            .connect_timeout(std::time::Duration::from_secs(10));

        if let Some(ca) = &config.ca_cert {
            let cert = reqwest::Certificate::from_pem(ca).map_err(KubeClientError::Identity)?;
            builder = builder.add_root_certificate(cert);
        }

        let token = match &config.auth {
            KubeAuth::Token(token) => Some(token.clone()),
            KubeAuth::ClientCert { cert, key } => {
                let mut bundle = key.clone();
                bundle.extend_from_slice(cert);
                let identity = reqwest::Identity::from_pem(&bundle)
                    .map_err(KubeClientError::Identity)?;
                builder = builder.identity(identity);
                None
            }
            KubeAuth::None => None,
        };

        let http = builder.build().map_err(KubeClientError::Build)?;

        Ok(Self {
            http,
            base_url: config.server.trim_end_matches('/').to_string(),
            token,
            namespace,
        })
    }

    fn secrets_url(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/api/v1/namespaces/{}/secrets", self.base_url, ns),
            None => format!("{}/api/v1/secrets", self.base_url),
        }
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// List all visible secrets.
    ///
    /// Returns the decoded records and the list's resource version, the
    /// resume point for a subsequent watch.
    pub async fn list(
        &self,
    ) -> Result<(Vec<(SecretRef, SecretRecord)>, Option<String>), KubeClientError> {
        let url = self.secrets_url();
        debug!(url = %url, "listing secrets");

        let response = self
            .authorized(self.http.get(&url))
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await
            .map_err(|source| KubeClientError::Request {
                url: url.clone(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(KubeClientError::Status {
                status: response.status(),
                url,
            });
        }

        let list: wire::SecretList =
            response
                .json()
                .await
                .map_err(|source| KubeClientError::Request {
                    url: url.clone(),
                    source,
                })?;

        let resource_version = list.metadata.resource_version;
        let items = list.items.into_iter().map(decode_secret).collect();

        Ok((items, resource_version))
    }

    /// Open a watch on the secrets resource.
    ///
    /// Yields decoded [`WatchEvent`]s until the server closes the stream;
    /// the caller is expected to re-list and re-watch when that happens.
    pub async fn watch(
        &self,
        resource_version: Option<&str>,
    ) -> Result<impl Stream<Item = Result<WatchEvent, KubeClientError>>, KubeClientError> {
        let mut url = format!("{}?watch=true&allowWatchBookmarks=true", self.secrets_url());
        if let Some(rv) = resource_version {
            url.push_str("&resourceVersion=");
            url.push_str(rv);
        }
        debug!(url = %url, "opening watch");

        let response = self
            .authorized(self.http.get(&url))
            .send()
            .await
            .map_err(|source| KubeClientError::Request {
                url: url.clone(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(KubeClientError::Status {
                status: response.status(),
                url,
            });
        }

        // The watch body is newline-delimited JSON; reassemble lines across
        // chunk boundaries before decoding.
        let lines = response
            .bytes_stream()
            .map_err(KubeClientError::WatchStream)
            .scan(Vec::new(), |buffer, chunk| {
                let out: Vec<Result<WatchEvent, KubeClientError>> = match chunk {
                    Ok(bytes) => {
                        buffer.extend_from_slice(&bytes);
                        drain_lines(buffer)
                            .into_iter()
                            .filter_map(|line| decode_watch_line(&line))
                            .collect()
                    }
                    Err(err) => vec![Err(err)],
                };
                futures_util::future::ready(Some(out))
            })
            .flat_map(stream::iter);

        Ok(lines)
    }
}

/// Split complete newline-terminated lines off the front of `buffer`,
/// leaving any partial trailing line in place.
fn drain_lines(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let mut line: Vec<u8> = buffer.drain(..=pos).collect();
        line.pop(); // trailing newline
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}

/// Decode one watch line into an event.
///
/// Returns `None` for empty results; a malformed line yields `Some(Err)` so
/// the informer can log and drop it (an object of the wrong kind never
/// reaches the queue).
fn decode_watch_line(line: &[u8]) -> Option<Result<WatchEvent, KubeClientError>> {
    let envelope: wire::WatchLine = match serde_json::from_slice(line) {
        Ok(envelope) => envelope,
        Err(err) => return Some(Err(err.into())),
    };

    let event = match envelope.kind.as_str() {
        "ADDED" | "MODIFIED" => {
            let secret: wire::Secret = match serde_json::from_value(envelope.object) {
                Ok(secret) => secret,
                Err(err) => return Some(Err(err.into())),
            };
            let resource_version = secret.metadata.resource_version.clone();
            let (key, record) = decode_secret(secret);
            if envelope.kind == "ADDED" {
                WatchEvent::Added {
                    key,
                    record,
                    resource_version,
                }
            } else {
                WatchEvent::Modified {
                    key,
                    record,
                    resource_version,
                }
            }
        }
        "DELETED" => {
            let secret: wire::Secret = match serde_json::from_value(envelope.object) {
                Ok(secret) => secret,
                Err(err) => return Some(Err(err.into())),
            };
            let resource_version = secret.metadata.resource_version.clone();
            let (key, _) = decode_secret(secret);
            WatchEvent::Deleted {
                key,
                resource_version,
            }
        }
        "BOOKMARK" => {
            let bookmark: wire::BookmarkObject = match serde_json::from_value(envelope.object) {
                Ok(bookmark) => bookmark,
                Err(err) => return Some(Err(err.into())),
            };
            WatchEvent::Bookmark {
                resource_version: bookmark.metadata.resource_version,
            }
        }
        "ERROR" => {
            let status: wire::WatchStatus = serde_json::from_value(envelope.object)
                .unwrap_or_else(|_| wire::WatchStatus {
                    message: "unparseable error object".to_string(),
                    code: 0,
                });
            return Some(Err(KubeClientError::WatchError {
                message: status.message,
                code: status.code,
            }));
        }
        other => {
            warn!(kind = other, "unknown watch event type, dropping");
            return None;
        }
    };

    Some(Ok(event))
}

/// Convert a wire secret into its identity and decoded record.
///
/// Data values that fail base64 decoding are dropped with a warning; one
/// corrupt field must not hide the rest of the secret.
fn decode_secret(secret: wire::Secret) -> (SecretRef, SecretRecord) {
    let key = SecretRef::new(secret.metadata.namespace, secret.metadata.name);

    let mut data = HashMap::with_capacity(secret.data.len());
    for (field, encoded) in secret.data {
        match BASE64.decode(&encoded) {
            Ok(decoded) => {
                data.insert(field, decoded);
            }
            Err(err) => {
                warn!(key = %key, field = %field, error = %err, "dropping undecodable data field");
            }
        }
    }

    (key, SecretRecord { data })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_lines_handles_partial_chunks() {
        let mut buffer = b"{\"a\":1}\n{\"b\"".to_vec();
        let lines = drain_lines(&mut buffer);
        assert_eq!(lines, vec![b"{\"a\":1}".to_vec()]);
        assert_eq!(buffer, b"{\"b\"".to_vec());

        buffer.extend_from_slice(b":2}\n");
        let lines = drain_lines(&mut buffer);
        assert_eq!(lines, vec![b"{\"b\":2}".to_vec()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn decodes_added_event() {
        let line = serde_json::json!({
            "type": "ADDED",
            "object": {
                "metadata": {"name": "alpha", "namespace": "ns", "resourceVersion": "42"},
                "data": {"tls.crt": BASE64.encode(b"cert-bytes")},
            }
        })
        .to_string();

        match decode_watch_line(line.as_bytes()) {
            Some(Ok(WatchEvent::Added {
                key,
                record,
                resource_version,
            })) => {
                assert_eq!(key, SecretRef::new("ns", "alpha"));
                assert_eq!(record.data["tls.crt"], b"cert-bytes");
                assert_eq!(resource_version.as_deref(), Some("42"));
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn wrong_object_shape_is_an_error_not_a_panic() {
        let line = r#"{"type":"ADDED","object":{"spec":{"replicas":3}}}"#;
        assert!(matches!(
            decode_watch_line(line.as_bytes()),
            Some(Err(KubeClientError::Decode(_)))
        ));
    }

    #[test]
    fn server_error_events_surface_as_watch_errors() {
        let line = r#"{"type":"ERROR","object":{"message":"too old resource version","code":410}}"#;
        match decode_watch_line(line.as_bytes()) {
            Some(Err(KubeClientError::WatchError { message, code })) => {
                assert_eq!(code, 410);
                assert!(message.contains("too old"));
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn undecodable_data_fields_are_dropped() {
        let secret = serde_json::from_value::<wire::Secret>(serde_json::json!({
            "metadata": {"name": "alpha", "namespace": "ns"},
            "data": {"good": BASE64.encode(b"ok"), "bad": "!!! not base64 !!!"},
        }))
        .unwrap();

        let (key, record) = decode_secret(secret);
        assert_eq!(key, SecretRef::new("ns", "alpha"));
        assert_eq!(record.data.len(), 1);
        assert_eq!(record.data["good"], b"ok");
    }
}

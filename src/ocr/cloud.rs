//! Hosted document recognition.
//!
//! The MinerU batch API works on whole documents rather than page images,
//! so it sits beside the local engine instead of behind [`super::engine`]:
//!
//! ```text
//! POST {api}/file-urls/batch                 → batch_id + presigned upload URL
//! PUT  <upload URL>                          ← document bytes
//! GET  {api}/extract-results/batch/{id}      poll until done | failed
//! GET  <full_md_url>                         → Markdown (https, public host, capped)
//! ```
//!
//! `{api}` is `<endpoint>/api/v4` first, then the bare endpoint; a 404/405
//! from one base moves on to the next.

use crate::config::CloudSettings;
use crate::error::CloudError;
use crate::progress::CloudPhase;
use futures::future::BoxFuture;
use futures::StreamExt;
use reqwest::{Method, Response, StatusCode, Url};
use serde_json::{json, Value};
use std::net::IpAddr;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const API_TIMEOUT: Duration = Duration::from_secs(60);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_REDIRECTS: usize = 3;
const ERROR_DETAIL_CHARS: usize = 240;

/// Recognises a whole document remotely and returns Markdown.
pub trait DocumentRecognizer: Send + Sync {
    fn recognize<'a>(
        &'a self,
        path: &'a Path,
        on_phase: &'a (dyn Fn(CloudPhase) + Send + Sync),
    ) -> BoxFuture<'a, Result<String, CloudError>>;
}

/// [`DocumentRecognizer`] over the MinerU batch API.
pub struct MineruClient {
    client: reqwest::Client,
    settings: CloudSettings,
}

impl MineruClient {
    pub fn new(settings: CloudSettings) -> Result<Self, CloudError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("docnorm/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none());
        if let Some(proxy) = settings.proxy.as_deref().filter(|p| !p.trim().is_empty()) {
            let proxy = reqwest::Proxy::all(proxy.trim())
                .map_err(|e| CloudError::Config(format!("invalid proxy '{proxy}': {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| CloudError::Config(format!("HTTP client: {e}")))?;
        Ok(Self { client, settings })
    }

    async fn run(
        &self,
        path: &Path,
        on_phase: &(dyn Fn(CloudPhase) + Send + Sync),
    ) -> Result<String, CloudError> {
        let provider = normalize_provider(&self.settings.provider);
        if provider != "mineru" {
            return Err(CloudError::Config(format!(
                "unsupported cloud OCR provider '{provider}'"
            )));
        }
        let api_key = self.settings.api_key.trim();
        if api_key.is_empty() {
            return Err(CloudError::Config(
                "an API key is required; set DOCNORM_OCR_CLOUD_API_KEY".into(),
            ));
        }
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| CloudError::Config(format!("cannot read '{}': {e}", path.display())))?
            .len();
        if size > self.settings.max_file_bytes {
            return Err(CloudError::Config(format!(
                "file is {size} bytes; the limit is {}",
                self.settings.max_file_bytes
            )));
        }

        let bases = candidate_bases(&self.settings.endpoint);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".into());
        let data_id: String = uuid::Uuid::new_v4().simple().to_string().chars().take(12).collect();

        on_phase(CloudPhase::Submitting);
        let payload = json!({
            "files": [{ "name": name, "data_id": data_id }],
            "model_version": self.settings.model_version,
        });
        let created = self
            .request_json(&bases, Method::POST, "file-urls/batch", Some(&payload), "create upload url")
            .await?;
        let created = response_data(created, "create upload url")?;
        let upload_url = upload_url(&created).ok_or(CloudError::Protocol {
            context: "create upload url",
            detail: "no upload URL returned".into(),
        })?;

        on_phase(CloudPhase::Uploading);
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| CloudError::Config(format!("cannot read '{}': {e}", path.display())))?;
        let uploaded = self
            .client
            .put(upload_url.as_str())
            .timeout(TRANSFER_TIMEOUT)
            .body(bytes)
            .send()
            .await
            .map_err(|e| network("file upload", e))?;
        check_status(uploaded, "file upload").await?;

        let batch_id = find_first_string(&created, &["batch_id", "batchId"]).ok_or(
            CloudError::Protocol {
                context: "create upload url",
                detail: "no batch_id returned".into(),
            },
        )?;
        info!(batch_id = %batch_id, bytes = size, "document uploaded for cloud recognition");

        on_phase(CloudPhase::Waiting);
        let deadline = Instant::now() + self.settings.timeout;
        let (entry, data) = loop {
            if Instant::now() >= deadline {
                return Err(CloudError::Timeout {
                    secs: self.settings.timeout.as_secs(),
                });
            }
            let polled = self
                .request_json(
                    &bases,
                    Method::GET,
                    &format!("extract-results/batch/{batch_id}"),
                    None,
                    "poll extract result",
                )
                .await?;
            let data = response_data(polled, "poll extract result")?;
            let entry = result_entry(&data, &data_id);
            let state = normalize_state(entry.get("state").and_then(Value::as_str).unwrap_or(""));
            match state.as_str() {
                "done" | "finished" => break (entry, data),
                "failed" | "cancelled" => {
                    let reason = find_first_string(&entry, &["error", "err_msg", "message"])
                        .unwrap_or_else(|| "task failed".into());
                    return Err(CloudError::TaskFailed(reason));
                }
                other => debug!(batch_id = %batch_id, state = other, "cloud result pending"),
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        };

        const URL_KEYS: &[&str] = &["full_md_url", "md_url", "markdown_url"];
        let inline = find_first_string(&entry, &["md_content", "markdown", "content"]);
        let markdown = match inline {
            Some(text) => text,
            None => {
                let url = find_first_string(&entry, URL_KEYS)
                    .or_else(|| find_first_string(&data, URL_KEYS))
                    .ok_or(CloudError::Protocol {
                        context: "poll extract result",
                        detail: "no Markdown content or URL returned".into(),
                    })?;
                self.download_limited(&url).await?
            }
        };
        if markdown.trim().is_empty() {
            return Err(CloudError::Protocol {
                context: "download markdown result",
                detail: "empty Markdown result".into(),
            });
        }
        on_phase(CloudPhase::Finished);
        Ok(markdown)
    }

    async fn request_json(
        &self,
        bases: &[String],
        method: Method,
        path: &str,
        body: Option<&Value>,
        context: &'static str,
    ) -> Result<Value, CloudError> {
        let token = self.settings.api_key.trim();
        let mut last_error = None;
        for base in bases {
            let url = format!("{base}/{}", path.trim_start_matches('/'));
            let mut request = self
                .client
                .request(method.clone(), &url)
                .timeout(API_TIMEOUT)
                .bearer_auth(token)
                .header("X-MinerU-User-Token", token);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    debug!(url = %url, error = %e, "cloud request failed; trying next base");
                    last_error = Some(network(context, e));
                    continue;
                }
            };
            if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED) {
                debug!(url = %url, status = %response.status(), "cloud API base rejected route");
                continue;
            }
            let response = check_status(response, context).await?;
            let value: Value = response.json().await.map_err(|e| CloudError::Protocol {
                context,
                detail: format!("invalid JSON: {e}"),
            })?;
            if !value.is_object() {
                return Err(CloudError::Protocol {
                    context,
                    detail: "payload is not a JSON object".into(),
                });
            }
            return Ok(value);
        }
        Err(last_error.unwrap_or_else(|| {
            CloudError::Config(format!(
                "endpoint '{}' has no cloud OCR API; check the endpoint setting",
                self.settings.endpoint
            ))
        }))
    }

    /// GET `url` with manual, re-validated redirects and a size cap.
    async fn download_limited(&self, url: &str) -> Result<String, CloudError> {
        const CONTEXT: &str = "download markdown result";
        let limit = self.settings.max_result_bytes;
        let mut current = validate_result_url(url).await?;
        for _ in 0..=MAX_REDIRECTS {
            let response = self
                .client
                .get(current.clone())
                .timeout(TRANSFER_TIMEOUT)
                .send()
                .await
                .map_err(|e| network(CONTEXT, e))?;
            if response.status().is_redirection() {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .ok_or(CloudError::Protocol {
                        context: CONTEXT,
                        detail: "redirect without a location".into(),
                    })?;
                let next = current.join(location).map_err(|e| CloudError::UnsafeUrl(e.to_string()))?;
                current = validate_result_url(next.as_str()).await?;
                continue;
            }
            let response = check_status(response, CONTEXT).await?;
            if response.content_length().is_some_and(|len| len > limit as u64) {
                return Err(CloudError::TooLarge { limit });
            }
            let mut body = Vec::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| network(CONTEXT, e))?;
                if body.len() + chunk.len() > limit {
                    return Err(CloudError::TooLarge { limit });
                }
                body.extend_from_slice(&chunk);
            }
            return Ok(String::from_utf8_lossy(&body).trim().to_string());
        }
        Err(CloudError::Protocol {
            context: CONTEXT,
            detail: format!("more than {MAX_REDIRECTS} redirects"),
        })
    }
}

impl DocumentRecognizer for MineruClient {
    fn recognize<'a>(
        &'a self,
        path: &'a Path,
        on_phase: &'a (dyn Fn(CloudPhase) + Send + Sync),
    ) -> BoxFuture<'a, Result<String, CloudError>> {
        Box::pin(async move {
            let outcome = self.run(path, on_phase).await;
            if let Err(e) = &outcome {
                warn!(path = %path.display(), error = %e, "cloud recognition failed");
            }
            outcome
        })
    }
}

fn network(context: &'static str, e: reqwest::Error) -> CloudError {
    CloudError::Network {
        context,
        reason: e.to_string(),
    }
}

/// Pass successful responses through; map the rest onto [`CloudError`].
async fn check_status(response: Response, context: &'static str) -> Result<Response, CloudError> {
    let status = response.status();
    if !status.is_client_error() && !status.is_server_error() {
        return Ok(response);
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(CloudError::Auth {
            status: status.as_u16(),
        }),
        StatusCode::TOO_MANY_REQUESTS => Err(CloudError::RateLimited),
        _ => {
            let text = response.text().await.unwrap_or_default();
            Err(CloudError::Http {
                status: status.as_u16(),
                context,
                detail: text.trim().chars().take(ERROR_DETAIL_CHARS).collect(),
            })
        }
    }
}

fn normalize_provider(provider: &str) -> String {
    let value = provider.trim().to_ascii_lowercase();
    if value.is_empty() {
        "mineru".into()
    } else {
        value
    }
}

/// API roots to try, most specific first.
fn candidate_bases(endpoint: &str) -> Vec<String> {
    let mut root = endpoint.trim().to_string();
    if root.is_empty() {
        root = "https://mineru.net".into();
    }
    if !root.contains("://") {
        root = format!("https://{root}");
    }
    let root = root.trim_end_matches('/').to_string();
    let mut bases = match root.strip_suffix("/api/v4") {
        Some(bare) => vec![root.clone(), bare.to_string()],
        None => vec![format!("{root}/api/v4"), root],
    };
    bases.retain(|b| !b.is_empty());
    bases.dedup();
    bases
}

/// Unwrap the `{code, msg, data}` envelope.
fn response_data(payload: Value, context: &'static str) -> Result<Value, CloudError> {
    let ok = match payload.get("code") {
        None | Some(Value::Null) => true,
        Some(Value::Number(n)) => n.as_i64() == Some(0),
        Some(Value::String(s)) => s == "0",
        Some(_) => false,
    };
    if !ok {
        let message = find_first_string(&payload, &["msg", "message"])
            .unwrap_or_else(|| "unknown error".into());
        return Err(CloudError::TaskFailed(format!("API error during {context}: {message}")));
    }
    match payload.get("data") {
        None | Some(Value::Null) => Ok(json!({})),
        Some(data @ Value::Object(_)) => Ok(data.clone()),
        Some(_) => Err(CloudError::Protocol {
            context,
            detail: "data field is not an object".into(),
        }),
    }
}

fn upload_url(data: &Value) -> Option<String> {
    let first = data.get("file_urls")?.as_array()?.first()?;
    let url = match first {
        Value::String(s) => s.as_str(),
        Value::Object(o) => ["url", "file_url", "upload_url"]
            .iter()
            .find_map(|k| o.get(*k).and_then(Value::as_str).filter(|s| !s.trim().is_empty()))?,
        _ => return None,
    };
    Some(url.trim().to_string()).filter(|u| !u.is_empty())
}

/// Depth-first search for the first non-blank string under any of `keys`.
fn find_first_string(value: &Value, keys: &[&str]) -> Option<String> {
    match value {
        Value::Object(map) => keys
            .iter()
            .find_map(|k| {
                map.get(*k)
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            })
            .or_else(|| map.values().find_map(|v| find_first_string(v, keys))),
        Value::Array(items) => items.iter().find_map(|v| find_first_string(v, keys)),
        _ => None,
    }
}

/// The result item for `data_id`, else the first item, else `data` itself.
fn result_entry(data: &Value, data_id: &str) -> Value {
    let items = match data.get("extract_result").or_else(|| data.get("results")) {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Object(map)) => map.values().cloned().collect(),
        _ => return data.clone(),
    };
    let objects = || items.iter().filter(|i| i.is_object());
    objects()
        .find(|i| i.get("data_id").and_then(Value::as_str).map(str::trim) == Some(data_id))
        .or_else(|| objects().next())
        .cloned()
        .unwrap_or_else(|| json!({}))
}

fn normalize_state(state: &str) -> String {
    match state.trim().to_ascii_lowercase().as_str() {
        "success" => "done".into(),
        other => other.to_string(),
    }
}

/// Reject result URLs that are not https, embed credentials, or resolve to
/// a non-public address.
async fn validate_result_url(raw: &str) -> Result<Url, CloudError> {
    let url = Url::parse(raw.trim()).map_err(|e| CloudError::UnsafeUrl(format!("{raw}: {e}")))?;
    if url.scheme() != "https" {
        return Err(CloudError::UnsafeUrl(format!("{raw}: not https")));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(CloudError::UnsafeUrl(format!("{raw}: embedded credentials")));
    }
    let host = url
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| CloudError::UnsafeUrl(format!("{raw}: no host")))?;

    let addresses: Vec<IpAddr> = match host.parse::<IpAddr>() {
        Ok(ip) => vec![ip],
        Err(_) => tokio::net::lookup_host((host.as_str(), 443))
            .await
            .map_err(|e| CloudError::UnsafeUrl(format!("{host}: resolve failed: {e}")))?
            .map(|addr| addr.ip())
            .collect(),
    };
    if addresses.is_empty() {
        return Err(CloudError::UnsafeUrl(format!("{host}: resolved to no address")));
    }
    if let Some(ip) = addresses.iter().find(|ip| !is_public(ip)) {
        return Err(CloudError::UnsafeUrl(format!("{host} resolves to non-public {ip}")));
    }
    Ok(url)
}

fn is_public(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_unspecified()
                || a >= 240
                || (a == 100 && (64..128).contains(&b)))
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_public(&IpAddr::V4(mapped));
            }
            let first = v6.segments()[0];
            !(v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                || first & 0xfe00 == 0xfc00
                || first & 0xffc0 == 0xfe80)
        }
    }
}

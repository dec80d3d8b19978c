//! Paginated REST source

use reqwest::{Client, StatusCode};
use serde_json::{Map, Value as Json};
use std::time::Duration;
use tracing::{debug, info};

use super::{into_raw_records, ChunkRead, Cursor};
use crate::config::{ApiSourceConfig, Pagination};
use crate::error::{ConfigError, ExtractionError};
use crate::record::{Chunk, ChunkKey};

/// Envelope keys searched for the record array, in order
const RECORD_FIELDS: [&str; 4] = ["data", "results", "items", "records"];

#[derive(Debug)]
pub struct ApiSource {
    source_id: String,
    config: ApiSourceConfig,
    page_size: usize,
    url: String,
    client: Client,
}

/// One decoded page
#[derive(Debug, Default, PartialEq)]
struct Page {
    records: Vec<Map<String, Json>>,
    /// The body was a single object without a record array
    lone_object: bool,
    /// Whether the body says more pages follow, when it says anything
    more: Option<bool>,
    next_token: Option<String>,
}

impl ApiSource {
    pub fn new(source_id: impl Into<String>, config: ApiSourceConfig, page_size: usize) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("wharf/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to build HTTP client: {e}")))?;

        let base = config.base_url.trim_end_matches('/');
        let endpoint = config.endpoint.trim_start_matches('/');
        let url = if endpoint.is_empty() {
            base.to_string()
        } else {
            format!("{base}/{endpoint}")
        };

        info!(url = %url, pagination = ?config.pagination, "API source initialized");

        Ok(Self {
            source_id: source_id.into(),
            config,
            page_size,
            url,
            client,
        })
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn skip_cursor(&self, cursor: &Cursor) -> Option<Cursor> {
        match (self.config.pagination, cursor) {
            (Pagination::Page, Cursor::Origin) => Some(Cursor::Page { page: 2 }),
            (Pagination::Page, Cursor::Page { page }) => Some(Cursor::Page { page: page + 1 }),
            (Pagination::Offset, Cursor::Origin) => Some(Cursor::Offset {
                offset: self.page_size as u64,
            }),
            (Pagination::Offset, Cursor::Offset { offset }) => Some(Cursor::Offset {
                offset: offset + self.page_size as u64,
            }),
            _ => None,
        }
    }

    pub async fn next_chunk(&self, cursor: &Cursor, key: &ChunkKey) -> Result<ChunkRead, ExtractionError> {
        let request = self.request_for(cursor)?;
        let response = request.send().await.map_err(classify_transport)?;
        let origin = response.url().to_string();

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, &origin));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ExtractionError::unavailable(format!("failed reading body from {origin}: {e}")))?;
        let json: Json = serde_json::from_str(&body)
            .map_err(|e| ExtractionError::malformed(format!("invalid JSON from {origin}: {e}")))?;

        let page = split_page(json, self.config.records_field.as_deref())?;
        if page.records.is_empty() {
            debug!(chunk = %key, "Empty page, source exhausted");
            return Ok(ChunkRead::EndOfSource);
        }

        let next = self.next_cursor(cursor, &page);
        debug!(chunk = %key, records = page.records.len(), next = %next, "Fetched page");

        Ok(ChunkRead::Chunk {
            chunk: Chunk::new(key.clone(), into_raw_records(page.records, key, Some(origin))),
            next,
        })
    }

    fn request_for(&self, cursor: &Cursor) -> Result<reqwest::RequestBuilder, ExtractionError> {
        let size = self.page_size.to_string();
        let mut query: Vec<(String, String)> = self
            .config
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut url = self.url.clone();
        match (self.config.pagination, cursor) {
            (Pagination::Page, Cursor::Origin) => {
                query.push((self.config.page_param.clone(), "1".into()));
                query.push((self.config.page_size_param.clone(), size));
            },
            (Pagination::Page, Cursor::Page { page }) => {
                query.push((self.config.page_param.clone(), page.to_string()));
                query.push((self.config.page_size_param.clone(), size));
            },
            (Pagination::Offset, Cursor::Origin) => {
                query.push((self.config.offset_param.clone(), "0".into()));
                query.push((self.config.page_size_param.clone(), size));
            },
            (Pagination::Offset, Cursor::Offset { offset }) => {
                query.push((self.config.offset_param.clone(), offset.to_string()));
                query.push((self.config.page_size_param.clone(), size));
            },
            (Pagination::Token, Cursor::Origin) => {
                query.push((self.config.page_size_param.clone(), size));
            },
            (Pagination::Token, Cursor::Token { token }) => {
                if token.starts_with("http://") || token.starts_with("https://") {
                    // Full next-page URL already carries every parameter
                    url = token.clone();
                    query.clear();
                } else {
                    query.push((self.config.token_param.clone(), token.clone()));
                    query.push((self.config.page_size_param.clone(), size));
                }
            },
            (pagination, other) => {
                return Err(ExtractionError::fatal(format!(
                    "cursor {other} is not valid for {pagination:?} pagination"
                )))
            },
        }

        let mut request = self.client.get(url).query(&query);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        Ok(request)
    }

    fn next_cursor(&self, cursor: &Cursor, page: &Page) -> Cursor {
        if page.lone_object {
            return Cursor::Exhausted;
        }

        // Without explicit signals a full page suggests more may follow
        let full_page = page.records.len() >= self.page_size;

        match self.config.pagination {
            Pagination::Page => {
                let current = match cursor {
                    Cursor::Page { page } => *page,
                    _ => 1,
                };
                if page.more.unwrap_or(full_page) {
                    Cursor::Page { page: current + 1 }
                } else {
                    Cursor::Exhausted
                }
            },
            Pagination::Offset => {
                let current = match cursor {
                    Cursor::Offset { offset } => *offset,
                    _ => 0,
                };
                if page.more.unwrap_or(full_page) {
                    Cursor::Offset {
                        offset: current + page.records.len() as u64,
                    }
                } else {
                    Cursor::Exhausted
                }
            },
            Pagination::Token => match (&page.next_token, page.more) {
                (Some(token), more) if more != Some(false) => Cursor::Token { token: token.clone() },
                _ => Cursor::Exhausted,
            },
        }
    }
}

fn classify_transport(err: reqwest::Error) -> ExtractionError {
    if err.is_builder() {
        return ExtractionError::fatal(format!("invalid request: {err}"));
    }
    // Timeouts, refused connections and dropped streams are all worth another try
    ExtractionError::unavailable(format!("request failed: {err}"))
}

fn classify_status(status: StatusCode, url: &str) -> ExtractionError {
    let message = format!("HTTP {status} from {url}");
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT {
        ExtractionError::unavailable(message)
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        ExtractionError::fatal(format!("authentication failed: {message}"))
    } else {
        ExtractionError::fatal(message)
    }
}

fn into_objects(items: Vec<Json>) -> Result<Vec<Map<String, Json>>, ExtractionError> {
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Json::Object(map) => Ok(map),
            other => Err(ExtractionError::malformed(format!(
                "record {i} is not a JSON object: {other}"
            ))),
        })
        .collect()
}

fn token_of(value: Option<&Json>) -> Option<String> {
    match value? {
        Json::String(s) if !s.is_empty() => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Split a response body into records and pagination signals
fn split_page(body: Json, records_field: Option<&str>) -> Result<Page, ExtractionError> {
    let mut object = match body {
        Json::Array(items) => {
            return Ok(Page {
                records: into_objects(items)?,
                ..Page::default()
            })
        },
        Json::Object(map) => map,
        other => return Err(ExtractionError::malformed(format!("unexpected response body: {other}"))),
    };

    let field = match records_field {
        Some(field) => match object.get(field) {
            Some(Json::Array(_)) => Some(field.to_string()),
            _ => {
                return Err(ExtractionError::malformed(format!(
                    "response has no array field {field:?}"
                )))
            },
        },
        None => RECORD_FIELDS
            .iter()
            .find(|f| matches!(object.get(**f), Some(Json::Array(_))))
            .map(|f| f.to_string()),
    };

    let Some(field) = field else {
        return Ok(Page {
            records: vec![object],
            lone_object: true,
            ..Page::default()
        });
    };

    let items = match object.remove(&field) {
        Some(Json::Array(items)) => items,
        _ => Vec::new(),
    };

    let next_value = object.get("next").or_else(|| object.get("next_page"));
    let next_token = token_of(next_value);

    let more = if let Some(has_more) = object.get("has_more").and_then(Json::as_bool) {
        Some(has_more)
    } else if object.contains_key("next") || object.contains_key("next_page") {
        Some(next_value.is_some_and(|v| !v.is_null()))
    } else {
        match (
            object.get("page").and_then(Json::as_u64),
            object.get("total_pages").and_then(Json::as_u64),
        ) {
            (Some(page), Some(total)) => Some(page < total),
            _ => None,
        }
    };

    Ok(Page {
        records: into_objects(items)?,
        lone_object: false,
        more,
        next_token,
    })
}

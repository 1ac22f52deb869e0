//! Item fetch capability
//!
//! The scan engine only needs "all items of source X". [HttpItemFetcher]
//! provides that against a JSON endpoint:
//!
//! ```text
//! GET {base}/sources/{source_id}/items[?cursor=...]
//! -> [item, ...]  or  {"items": [...], "has_more": bool, "cursor": "..."}
//! ```
//!
//! Each item needs an id (`id` or `aweme_id`, string or number) and a publish
//! time in epoch seconds (`publish_time` or `create_time`). The whole object
//! is kept as the item payload.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::scan::Item;
use crate::services::rate_limiter::{
    RateLimitConfig, RateLimitedClient, ResponseExt, RetryConfig, retry_async,
};

/// Hard stop for runaway pagination
const MAX_PAGES: usize = 500;

/// Phrases in an error body that mean the upstream is blocking us
const BLOCK_MARKERS: &[&str] = &["risk control", "rate limit", "too many requests", "captcha"];

/// Fetches every item currently published by a source
#[async_trait]
pub trait ItemFetcher: Send + Sync {
    /// Returns `Error::Fetch` for transient failures and `Error::RateLimited`
    /// when the upstream throttles or blocks.
    async fn fetch_all_items(&self, source_id: &str) -> Result<Vec<Item>>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ItemsPage {
    Bare(Vec<Value>),
    Paged {
        items: Vec<Value>,
        #[serde(default)]
        has_more: bool,
        #[serde(default)]
        cursor: Option<Value>,
    },
}

pub struct HttpItemFetcher {
    base_url: Url,
    client: RateLimitedClient,
    retry: RetryConfig,
    max_pages: usize,
}

impl HttpItemFetcher {
    pub fn new(base_url: &str, rate: RateLimitConfig, retry: RetryConfig) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("Invalid fetch base URL {base_url}: {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            base_url,
            client: RateLimitedClient::new("upstream", rate)?,
            retry,
            max_pages: MAX_PAGES,
        })
    }

    /// Fail a source whose pagination runs past `max_pages`
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let base_url = config
            .fetch_base_url
            .as_deref()
            .ok_or_else(|| Error::Config("FETCH_BASE_URL is not set".into()))?;

        Self::new(
            base_url,
            RateLimitConfig {
                requests_per_second: config.fetch_requests_per_second,
                burst_size: 1,
                timeout: config.fetch_timeout,
            },
            RetryConfig {
                max_retries: config.scan.fetch_max_retries.max(1),
                ..Default::default()
            },
        )
    }

    fn page_url(&self, source_id: &str, cursor: Option<&str>) -> Result<Url> {
        let mut url = self.base_url.clone();
        // Pushed as a segment so `/`, `?` and `#` in a source id stay escaped
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("Fetch base URL {} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .push("sources")
            .push(source_id)
            .push("items");
        if let Some(cursor) = cursor {
            url.query_pairs_mut().append_pair("cursor", cursor);
        }
        Ok(url)
    }

    async fn fetch_page(&self, url: &Url) -> Result<ItemsPage> {
        let response = self.client.get(url.as_str()).await?;
        let status = response.status();

        if response.is_rate_limited() {
            return Err(Error::RateLimited(format!("upstream returned {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::Fetch(format!("Failed to read response body: {e}")))?;

        if !status.is_success() {
            if is_block_message(&body) {
                return Err(Error::RateLimited(format!("upstream blocked request: {status}")));
            }
            return Err(Error::Fetch(format!("upstream returned {status}")));
        }

        serde_json::from_str(&body).map_err(|e| {
            if is_block_message(&body) {
                Error::RateLimited("upstream returned a block page".into())
            } else {
                Error::Fetch(format!("Invalid item list: {e}"))
            }
        })
    }
}

#[async_trait]
impl ItemFetcher for HttpItemFetcher {
    async fn fetch_all_items(&self, source_id: &str) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        let mut pages = 0;
        loop {
            // A truncated listing would let the watermark skip unseen items
            if pages == self.max_pages {
                return Err(Error::Fetch(format!(
                    "pagination for {source_id} exceeded {} pages",
                    self.max_pages
                )));
            }
            pages += 1;

            let url = self.page_url(source_id, cursor.as_deref())?;
            let page = retry_async(
                || self.fetch_page(&url),
                |e| matches!(e, Error::Fetch(_)),
                &self.retry,
                "fetch_items",
            )
            .await?;

            let (values, has_more, next) = match page {
                ItemsPage::Bare(values) => (values, false, None),
                ItemsPage::Paged {
                    items,
                    has_more,
                    cursor,
                } => (items, has_more, cursor.map(cursor_string)),
            };

            for value in values {
                match parse_item(value) {
                    Some(item) => items.push(item),
                    None => warn!(source_id = %source_id, "Skipping item without id or publish time"),
                }
            }

            if !has_more {
                break;
            }
            match next {
                Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
                _ => {
                    return Err(Error::Fetch(format!(
                        "upstream reported more items for {source_id} without a new cursor"
                    )));
                }
            }
        }

        debug!(source_id = %source_id, count = items.len(), "Fetched items");
        Ok(items)
    }
}

fn cursor_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn is_block_message(body: &str) -> bool {
    let lower = body.to_lowercase();
    BLOCK_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Build an [Item] from an upstream JSON object
pub fn parse_item(value: Value) -> Option<Item> {
    let id = ["id", "aweme_id"]
        .iter()
        .find_map(|key| match value.get(*key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })?;
    let publish_time = ["publish_time", "create_time"]
        .iter()
        .find_map(|key| value.get(*key)?.as_i64())?;

    Some(Item {
        id,
        publish_time,
        payload: value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_item_accepts_both_field_names() {
        let item = parse_item(json!({ "aweme_id": "7", "create_time": 90, "desc": "d" })).unwrap();
        assert_eq!(item.id, "7");
        assert_eq!(item.publish_time, 90);
        assert_eq!(item.payload["desc"], "d");

        let item = parse_item(json!({ "id": 8, "publish_time": 150 })).unwrap();
        assert_eq!(item.id, "8");

        assert!(parse_item(json!({ "id": "9" })).is_none());
        assert!(parse_item(json!({ "publish_time": 1 })).is_none());
    }

    #[test]
    fn test_page_shapes() {
        let bare: ItemsPage = serde_json::from_str(r#"[{"id":"1","publish_time":1}]"#).unwrap();
        assert!(matches!(bare, ItemsPage::Bare(v) if v.len() == 1));

        let paged: ItemsPage =
            serde_json::from_str(r#"{"items":[],"has_more":true,"cursor":1700}"#).unwrap();
        match paged {
            ItemsPage::Paged { has_more, cursor, .. } => {
                assert!(has_more);
                assert_eq!(cursor.map(cursor_string).as_deref(), Some("1700"));
            }
            ItemsPage::Bare(_) => panic!("expected paged response"),
        }
    }

    #[test]
    fn test_block_markers() {
        assert!(is_block_message("{\"error\":\"Risk Control triggered\"}"));
        assert!(!is_block_message("{\"error\":\"not found\"}"));
    }

    fn fast_fetcher(base_url: &str) -> HttpItemFetcher {
        HttpItemFetcher::new(
            base_url,
            RateLimitConfig {
                requests_per_second: 100,
                burst_size: 100,
                timeout: std::time::Duration::from_secs(5),
            },
            RetryConfig {
                max_retries: 1,
                ..Default::default()
            },
        )
        .unwrap()
    }

    /// Upstream serving one item per page, `pages` pages in total
    async fn serve_pages(pages: usize) -> String {
        use axum::{Json, Router, extract::Query, routing::get};
        use std::collections::HashMap;

        let app = Router::new().route(
            "/sources/{source_id}/items",
            get(move |Query(query): Query<HashMap<String, String>>| async move {
                let page: usize = query
                    .get("cursor")
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(0);
                Json(json!({
                    "items": [{ "id": format!("item_{page}"), "publish_time": page }],
                    "has_more": page + 1 < pages,
                    "cursor": page + 1,
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn test_follows_cursor_to_last_page() {
        let base = serve_pages(3).await;
        let items = fast_fetcher(&base).fetch_all_items("abc").await.unwrap();
        let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["item_0", "item_1", "item_2"]);
    }

    #[tokio::test]
    async fn test_page_cap_fails_instead_of_truncating() {
        let base = serve_pages(10).await;
        let fetcher = fast_fetcher(&base).with_max_pages(3);
        let result = fetcher.fetch_all_items("abc").await;
        assert!(matches!(result, Err(Error::Fetch(msg)) if msg.contains("exceeded 3 pages")));

        // Exactly at the cap is still a complete listing
        let base = serve_pages(3).await;
        let fetcher = fast_fetcher(&base).with_max_pages(3);
        assert_eq!(fetcher.fetch_all_items("abc").await.unwrap().len(), 3);
    }

    #[test]
    fn test_source_id_is_escaped_in_path() {
        let fetcher = fast_fetcher("http://localhost:8080/api/");
        let url = fetcher.page_url("a/b?c#d", None).unwrap();
        assert_eq!(url.path(), "/api/sources/a%2Fb%3Fc%23d/items");
        assert!(url.query().is_none());
        assert!(url.fragment().is_none());

        let url = fetcher.page_url("../admin", None).unwrap();
        assert_eq!(url.path(), "/api/sources/..%2Fadmin/items");
    }

    #[test]
    fn test_page_url() {
        let fetcher = HttpItemFetcher::new(
            "http://localhost:8080/api",
            RateLimitConfig::default(),
            RetryConfig::default(),
        )
        .unwrap();
        let url = fetcher.page_url("abc", Some("10")).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/api/sources/abc/items?cursor=10");
    }
}

// Bookmark pagination
// Pages are fetched strictly in order; each bookmark is only valid against
// the page that produced it.

use async_stream::try_stream;
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use serde_json::Value;

use crate::error::{BrightspaceError, Result};
use crate::http_client::{ApiRequest, HttpEngine};

pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const DEFAULT_MAX_PAGES: u32 = 10;

/// Page size and safety limit for one pagination run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOptions {
    pub page_size: u32,
    /// Stop after this many pages even if the server keeps returning bookmarks
    pub max_pages: u32,
}

impl Default for PageOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

/// One decoded page
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<Value>,
    pub bookmark: Option<String>,
}

fn bookmark_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl Page {
    /// Decode a page body
    ///
    /// Accepts `{Items|items, Bookmark|Next|bookmark}`, Brightspace's
    /// `{Items, PagingInfo: {Bookmark, HasMoreItems}}`, or a bare array (a
    /// single, final page).
    pub fn from_body(body: &Value) -> Result<Self> {
        let obj = match body {
            Value::Array(items) => {
                return Ok(Self {
                    items: items.clone(),
                    bookmark: None,
                })
            }
            Value::Object(obj) => obj,
            other => {
                return Err(BrightspaceError::Malformed(format!(
                    "expected a paged object or array, got {}",
                    other
                )))
            }
        };

        let items = match obj.get("Items").or_else(|| obj.get("items")) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(other) => {
                return Err(BrightspaceError::Malformed(format!(
                    "Items is not an array: {}",
                    other
                )))
            }
        };

        let bookmark = match obj.get("PagingInfo") {
            Some(info) if info.get("HasMoreItems") == Some(&Value::Bool(false)) => None,
            Some(info) => bookmark_value(info.get("Bookmark")),
            None => bookmark_value(
                obj.get("Bookmark")
                    .or_else(|| obj.get("Next"))
                    .or_else(|| obj.get("bookmark")),
            ),
        };

        Ok(Self { items, bookmark })
    }

    /// Bookmark to follow, if this page does not end the sequence
    pub fn continuation(&self) -> Option<&str> {
        if self.items.is_empty() {
            return None;
        }
        self.bookmark.as_deref()
    }
}

/// Lazy sequence of pages for `request`
///
/// Nothing is sent until the stream is polled. Calling again starts over from
/// the original parameters.
pub fn pages<'a>(
    engine: &'a HttpEngine,
    request: ApiRequest,
    options: PageOptions,
) -> impl Stream<Item = Result<Page>> + 'a {
    try_stream! {
        let base = request.set_param("pageSize", options.page_size);
        let mut bookmark: Option<String> = None;

        for page_number in 1..=options.max_pages {
            let req = match bookmark {
                Some(ref b) => base.clone().set_param("bookmark", b),
                None => base.clone(),
            };

            let outcome = engine.request(&req).await?;
            let page = Page::from_body(&outcome.body)?;

            tracing::debug!(
                path = %base.path,
                page = page_number,
                items = page.items.len(),
                has_bookmark = page.bookmark.is_some(),
                "Fetched page"
            );

            let next = page.continuation().map(str::to_string);
            yield page;

            match next {
                Some(b) => bookmark = Some(b),
                None => break,
            }

            if page_number == options.max_pages {
                tracing::warn!(
                    path = %base.path,
                    max_pages = options.max_pages,
                    "Page limit reached with more pages available"
                );
            }
        }
    }
}

/// Lazy sequence of records across all pages, in server order
///
/// Records from pages fetched before an error are still yielded; the error
/// ends the stream.
pub fn paginate<'a>(
    engine: &'a HttpEngine,
    request: ApiRequest,
    options: PageOptions,
) -> impl Stream<Item = Result<Value>> + 'a {
    pages(engine, request, options)
        .map_ok(|page| stream::iter(page.items.into_iter().map(Ok::<Value, BrightspaceError>)))
        .try_flatten()
}

/// Everything one pagination run produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PaginatedResult {
    pub items: Vec<Value>,
    /// Every bookmark followed or returned, in order
    pub bookmarks: Vec<String>,
    /// Set when the page limit stopped the run while the server had more
    pub next_bookmark: Option<String>,
}

/// Drive `pages` to completion and merge the results
pub async fn collect_pages(
    engine: &HttpEngine,
    request: ApiRequest,
    options: PageOptions,
) -> Result<PaginatedResult> {
    let mut result = PaginatedResult::default();
    let stream = pages(engine, request, options);
    futures::pin_mut!(stream);

    while let Some(page) = stream.next().await {
        let page = page?;
        result.next_bookmark = page.continuation().map(str::to_string);
        if let Some(ref b) = page.bookmark {
            result.bookmarks.push(b.clone());
        }
        result.items.extend(page.items);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_page_from_top_level_bookmark() {
        let page = Page::from_body(&json!({"Items": [1, 2], "Bookmark": "b1"})).unwrap();
        assert_eq!(page.items, vec![json!(1), json!(2)]);
        assert_eq!(page.continuation(), Some("b1"));

        let page = Page::from_body(&json!({"items": [3], "Next": null})).unwrap();
        assert_eq!(page.bookmark, None);
    }

    #[test]
    fn test_page_from_paging_info() {
        let page = Page::from_body(&json!({
            "PagingInfo": {"Bookmark": "42", "HasMoreItems": true},
            "Items": [{"Id": 1}]
        }))
        .unwrap();
        assert_eq!(page.bookmark.as_deref(), Some("42"));

        let page = Page::from_body(&json!({
            "PagingInfo": {"Bookmark": "42", "HasMoreItems": false},
            "Items": [{"Id": 1}]
        }))
        .unwrap();
        assert_eq!(page.bookmark, None);
    }

    #[test]
    fn test_empty_page_is_terminal() {
        let page = Page::from_body(&json!({"Items": [], "Bookmark": "b9"})).unwrap();
        assert_eq!(page.continuation(), None);
    }

    #[test]
    fn test_bare_array_is_single_page() {
        let page = Page::from_body(&json!([{"a": 1}, {"a": 2}])).unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.bookmark, None);
    }

    #[test]
    fn test_malformed_pages() {
        assert!(matches!(
            Page::from_body(&json!("html error page")),
            Err(BrightspaceError::Malformed(_))
        ));
        assert!(matches!(
            Page::from_body(&json!({"Items": {"not": "an array"}})),
            Err(BrightspaceError::Malformed(_))
        ));
    }
}

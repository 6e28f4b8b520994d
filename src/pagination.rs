//! Automatic aggregation of paged GET collections.

use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, CONTENT_LENGTH},
    Method,
};
use serde_json::{json, Map, Value};

use crate::{
    wire::{self, RawPageMeta},
    ApiError, ApiRequest, ApiResponse, Result, Transport,
};

/// Hard cap on fetched pages unless configured otherwise.
pub const DEFAULT_MAX_PAGES: u32 = 100;

/// Settings of the pagination layer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PaginationConfig {
    /// Safety cap on the number of pages fetched for one logical call.
    pub max_pages: u32,
    /// Query parameter carrying the page number.
    pub page_param: String,
    /// Object keys searched, in order, for the page's item list.
    pub items_keys: Vec<String>,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            max_pages: DEFAULT_MAX_PAGES,
            page_param: "page".to_owned(),
            items_keys: vec!["data".to_owned(), "items".to_owned(), "results".to_owned()],
        }
    }
}

/// Where pagination metadata was found.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MetaSource {
    /// JSON object in the `X-Pagination` header.
    StructuredHeader,
    /// `X-Total-Pages`, `X-Current-Page` and `X-Total-Count` headers.
    DiscreteHeaders,
    /// `pagination` object in the body.
    Body,
    /// `meta.pagination` object in the body.
    NestedBody,
}

/// Pagination numbers reported by one response.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PageMeta {
    pub current_page: Option<u64>,
    pub total_pages: Option<u64>,
    pub total_items: Option<u64>,
}

impl From<RawPageMeta> for PageMeta {
    fn from(raw: RawPageMeta) -> Self {
        Self {
            current_page: raw.current_page,
            total_pages: raw.total_pages,
            total_items: raw.total_items,
        }
    }
}

impl PageMeta {
    fn conflicts_with(&self, other: &PageMeta) -> bool {
        let differs =
            |a: Option<u64>, b: Option<u64>| matches!((a, b), (Some(x), Some(y)) if x != y);
        differs(self.total_pages, other.total_pages)
            || differs(self.total_items, other.total_items)
    }
}

/// Extracts pagination metadata using a fixed precedence: structured header,
/// discrete headers, body `pagination`, body `meta.pagination`.
///
/// Sources that disagree with the chosen one are logged and ignored.
pub fn extract_page_meta(
    headers: &HeaderMap,
    body: Option<&Value>,
) -> Option<(MetaSource, PageMeta)> {
    let mut found = Vec::new();

    if let Some(object) = headers
        .get(wire::PAGINATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| serde_json::from_str::<Map<String, Value>>(value).ok())
    {
        found.push((MetaSource::StructuredHeader, RawPageMeta::from_object(&object)));
    }

    let header_number = |names: &[&str]| {
        names.iter().find_map(|name| {
            headers
                .get(*name)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
        })
    };
    found.push((
        MetaSource::DiscreteHeaders,
        RawPageMeta {
            current_page: header_number(&wire::CURRENT_PAGE_HEADERS),
            total_pages: header_number(&[wire::TOTAL_PAGES_HEADER]),
            total_items: header_number(&wire::TOTAL_ITEMS_HEADERS),
        },
    ));

    if let Some(Value::Object(object)) = body {
        if let Some(Value::Object(pagination)) = object.get("pagination") {
            found.push((MetaSource::Body, RawPageMeta::from_object(pagination)));
        }
        if let Some(Value::Object(pagination)) = object
            .get("meta")
            .and_then(|meta| meta.get("pagination"))
        {
            found.push((MetaSource::NestedBody, RawPageMeta::from_object(pagination)));
        }
    }

    let mut candidates = found
        .into_iter()
        .filter(|(_, raw)| !raw.is_empty())
        .map(|(source, raw)| (source, PageMeta::from(raw)));
    let chosen = candidates.next()?;

    for (source, meta) in candidates {
        if chosen.1.conflicts_with(&meta) {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                chosen = ?chosen.0,
                ignored = ?source,
                ?meta,
                "conflicting pagination metadata; using the higher-precedence source"
            );
            #[cfg(not(feature = "tracing"))]
            let _ = source;
        }
    }

    Some(chosen)
}

/// Why a paginated call stopped.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopReason {
    /// The response carried no pagination metadata.
    NoMetadata,
    /// The page returned no items.
    EmptyPage,
    /// The declared total page count was reached.
    LastPage,
    /// The safety cap was reached.
    PageCap,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageOutcome {
    Continue,
    Done(StopReason),
}

/// Progress of a single logical paginated call.
#[derive(Debug)]
pub struct PaginationState {
    page: u32,
    max_pages: u32,
    items: Vec<Value>,
    page_sizes: Vec<usize>,
    last_meta: Option<PageMeta>,
}

impl PaginationState {
    pub fn new(max_pages: u32) -> Self {
        Self {
            page: 0,
            max_pages: max_pages.max(1),
            items: Vec::new(),
            page_sizes: Vec::new(),
            last_meta: None,
        }
    }

    /// Last page fetched; zero before the first one.
    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn next_page(&self) -> u32 {
        self.page + 1
    }

    pub fn max_pages(&self) -> u32 {
        self.max_pages
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    /// Number of items contributed by each fetched page.
    pub fn page_sizes(&self) -> &[usize] {
        &self.page_sizes
    }

    pub fn last_meta(&self) -> Option<&PageMeta> {
        self.last_meta.as_ref()
    }

    /// Records one fetched page and decides whether to continue.
    pub fn record_page(&mut self, items: Vec<Value>, meta: Option<PageMeta>) -> PageOutcome {
        self.page += 1;
        self.page_sizes.push(items.len());
        let empty = items.is_empty();
        self.items.extend(items);
        if meta.is_some() {
            self.last_meta = meta;
        }

        if empty {
            return PageOutcome::Done(StopReason::EmptyPage);
        }
        let Some(meta) = meta else {
            return PageOutcome::Done(StopReason::NoMetadata);
        };
        if meta
            .total_pages
            .is_some_and(|total| u64::from(self.page) >= total)
        {
            return PageOutcome::Done(StopReason::LastPage);
        }
        if self.page >= self.max_pages {
            return PageOutcome::Done(StopReason::PageCap);
        }
        PageOutcome::Continue
    }

    pub fn into_items(self) -> Vec<Value> {
        self.items
    }
}

/// Layout of a page body, kept to rebuild the assembled collection.
#[derive(Debug)]
enum PageShape {
    Array,
    Object { key: String, rest: Map<String, Value> },
}

/// Expands an unpinned GET into a bounded sequence of page requests and
/// returns one response holding every item.
///
/// Requests that already carry the page parameter, and non-GET requests,
/// pass through untouched. A failed page is returned as-is and the items
/// collected so far are dropped.
pub struct PaginationLayer<T> {
    inner: T,
    config: PaginationConfig,
}

impl<T> PaginationLayer<T> {
    pub fn new(inner: T, config: PaginationConfig) -> Self {
        Self { inner, config }
    }

    pub fn config(&self) -> &PaginationConfig {
        &self.config
    }

    fn applies_to(&self, request: &ApiRequest) -> bool {
        *request.method() == Method::GET && !request.has_query_param(&self.config.page_param)
    }

    fn page_request(&self, request: &ApiRequest, page: u32) -> ApiRequest {
        request
            .clone()
            .with_query_param(&self.config.page_param, &page.to_string())
    }

    fn split_items(&self, body: Value) -> Option<(PageShape, Vec<Value>)> {
        match body {
            Value::Array(items) => Some((PageShape::Array, items)),
            Value::Object(mut object) => {
                let key = self
                    .config
                    .items_keys
                    .iter()
                    .find(|key| matches!(object.get(key.as_str()), Some(Value::Array(_))))?
                    .clone();
                let Some(Value::Array(items)) = object.remove(&key) else {
                    return None;
                };
                Some((PageShape::Object { key, rest: object }, items))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl<T: Transport> Transport for PaginationLayer<T> {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        if !self.applies_to(&request) {
            return self.inner.send(request).await;
        }

        let response = self.inner.send(self.page_request(&request, 1)).await?;
        if !response.is_success() {
            return Ok(response);
        }
        let body = serde_json::from_slice::<Value>(response.body()).ok();
        let Some((_, meta)) = extract_page_meta(response.headers(), body.as_ref()) else {
            return Ok(response);
        };
        let Some((shape, items)) = body.and_then(|body| self.split_items(body)) else {
            return Ok(response);
        };

        let mut elapsed = response.elapsed();
        let (status, mut headers, _, _) = response.into_parts();
        let mut state = PaginationState::new(self.config.max_pages);
        let mut outcome = state.record_page(items, Some(meta));

        while outcome == PageOutcome::Continue {
            let response = self
                .inner
                .send(self.page_request(&request, state.next_page()))
                .await?;
            elapsed += response.elapsed();
            if !response.is_success() {
                return Ok(response);
            }

            let body = serde_json::from_slice::<Value>(response.body()).ok();
            let meta = extract_page_meta(response.headers(), body.as_ref()).map(|(_, meta)| meta);
            let Some((_, items)) = body.and_then(|body| self.split_items(body)) else {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    url = %request.url(),
                    page = state.next_page(),
                    "page body has no item list; stopping pagination"
                );
                outcome = PageOutcome::Done(StopReason::NoMetadata);
                break;
            };
            outcome = state.record_page(items, meta);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            url = %request.url(),
            pages = state.page(),
            items = state.items().len(),
            ?outcome,
            "pagination finished"
        );

        headers.remove(CONTENT_LENGTH);
        let pages = state.page();
        let items = state.into_items();
        let body = match shape {
            PageShape::Array => Value::Array(items),
            PageShape::Object { key, mut rest } => {
                let total_items = items.len();
                rest.insert(key, Value::Array(items));
                rest.insert(
                    "pagination".to_owned(),
                    json!({
                        "total_items": total_items,
                        "collected_pages": pages,
                        "auto_paginated": true,
                    }),
                );
                Value::Object(rest)
            }
        };
        let encoded = serde_json::to_vec(&body).map_err(|err| ApiError::Parse {
            message: format!("failed to encode assembled collection: {err}"),
            null_fields: Vec::new(),
        })?;

        Ok(ApiResponse::new(status, headers, encoded, elapsed))
    }
}

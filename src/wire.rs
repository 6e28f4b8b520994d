//! Shapes of the wire formats this crate consumes but does not define.

use serde_json::{Map, Value};

/// Structured pagination header carrying a JSON object.
pub const PAGINATION_HEADER: &str = "x-pagination";
pub const TOTAL_PAGES_HEADER: &str = "x-total-pages";
pub const CURRENT_PAGE_HEADERS: [&str; 2] = ["x-current-page", "x-page"];
pub const TOTAL_ITEMS_HEADERS: [&str; 2] = ["x-total-count", "x-total-items"];

const TOTAL_PAGES_KEYS: [&str; 4] = ["total_pages", "totalPages", "page_count", "pageCount"];
const CURRENT_PAGE_KEYS: [&str; 4] = ["current_page", "currentPage", "page", "page_number"];
const TOTAL_ITEMS_KEYS: [&str; 5] = [
    "total_items",
    "totalItems",
    "total_count",
    "totalCount",
    "total",
];

/// RFC 7807 members with a defined meaning.
pub const PROBLEM_MEMBERS: [&str; 5] = ["type", "title", "status", "detail", "instance"];

/// Extension members searched, in order, for validation sub-errors.
pub const VALIDATION_MEMBERS: [&str; 2] = ["errors", "validation_errors"];

/// Keys naming the offending field of a validation sub-error, in order of
/// preference. `loc` may be an array of path segments.
pub const FIELD_ERROR_FIELD_KEYS: [&str; 4] = ["field", "name", "path", "loc"];
pub const FIELD_ERROR_MESSAGE_KEYS: [&str; 3] = ["message", "msg", "detail"];

/// Pagination numbers read from a header or body object.
///
/// Fields tolerate numeric strings since several APIs quote them.
#[derive(Debug, Default)]
pub struct RawPageMeta {
    pub current_page: Option<u64>,
    pub total_pages: Option<u64>,
    pub total_items: Option<u64>,
}

impl RawPageMeta {
    pub fn from_object(object: &Map<String, Value>) -> Self {
        Self {
            current_page: first_number(object, &CURRENT_PAGE_KEYS),
            total_pages: first_number(object, &TOTAL_PAGES_KEYS),
            total_items: first_number(object, &TOTAL_ITEMS_KEYS),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.current_page.is_none() && self.total_pages.is_none() && self.total_items.is_none()
    }
}

fn first_number(object: &Map<String, Value>, keys: &[&str]) -> Option<u64> {
    keys.iter()
        .filter_map(|key| object.get(*key))
        .find_map(number_value)
}

pub fn number_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

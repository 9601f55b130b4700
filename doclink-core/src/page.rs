//! Sorting, pagination and result pages.
//!
//! This module turns the reserved `sort*`, `page` and `page_size` parameters
//! into a [`SortSpec`] and a [`Pagination`], and provides the [`Page`] struct
//! returned by paged reads.

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::{
    error::{DocumentStoreError, DocumentStoreResult},
    filter::{list_param, Params},
    schema::ID_FIELD,
};

/// Page size used when the request does not name a positive one.
pub const DEFAULT_PAGE_SIZE: u64 = 50;

/// Direction of a sort key.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    /// The native direction value, `1` or `-1`.
    pub fn value(&self) -> i32 {
        match self {
            SortDirection::Asc => 1,
            SortDirection::Desc => -1,
        }
    }

    fn from_sign(sign: f64) -> Self {
        if sign < 0.0 {
            SortDirection::Desc
        } else {
            SortDirection::Asc
        }
    }
}

/// Ordered sort keys.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SortSpec(pub Vec<(String, SortDirection)>);

impl SortSpec {
    /// Ascending by identifier.
    pub fn by_id() -> Self {
        Self(vec![(ID_FIELD.to_string(), SortDirection::Asc)])
    }

    /// Reads an explicit sort from the request, if it names one.
    ///
    /// `sort_asc` takes precedence over `sort_desc`, which takes precedence
    /// over `sort`. A numeric `sort` orders by identifier in the direction of
    /// its sign; a document `sort` gives a direction per key.
    pub fn from_params(params: &Params) -> Option<Self> {
        let ascending = list_param(params, "sort_asc");
        if !ascending.is_empty() {
            return Some(Self::uniform(ascending, SortDirection::Asc));
        }

        let descending = list_param(params, "sort_desc");
        if !descending.is_empty() {
            return Some(Self::uniform(descending, SortDirection::Desc));
        }

        match params.get("sort")? {
            Bson::Document(keys) => {
                let keys: Vec<_> = keys
                    .iter()
                    .map(|(key, value)| {
                        let sign = numeric(value).unwrap_or(1.0);
                        (key.clone(), SortDirection::from_sign(sign))
                    })
                    .collect();
                (!keys.is_empty()).then_some(Self(keys))
            }
            other => numeric(other)
                .map(|sign| Self(vec![(ID_FIELD.to_string(), SortDirection::from_sign(sign))])),
        }
    }

    fn uniform(keys: Vec<String>, direction: SortDirection) -> Self {
        Self(keys.into_iter().map(|key| (key, direction)).collect())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(key, _)| key.as_str())
    }

    /// The native `$sort` document.
    pub fn to_document(&self) -> Document {
        self.0
            .iter()
            .map(|(key, direction)| (key.clone(), Bson::Int32(direction.value())))
            .collect()
    }
}

impl Default for SortSpec {
    fn default() -> Self {
        Self::by_id()
    }
}

fn numeric(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(integer) => Some(f64::from(*integer)),
        Bson::Int64(integer) => Some(*integer as f64),
        Bson::Double(double) => Some(*double),
        Bson::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// The sort requested by `params`, defaulting to ascending identifiers.
pub fn sort_spec(params: &Params) -> SortSpec {
    SortSpec::from_params(params).unwrap_or_default()
}

/// Which slice of a result set to read, and in which order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Pagination {
    pub sort: SortSpec,
    /// Zero based page index.
    pub page: u64,
    pub page_size: u64,
}

impl Pagination {
    pub fn new(sort: SortSpec, page: u64, page_size: u64) -> Self {
        let page_size = if page_size == 0 { DEFAULT_PAGE_SIZE } else { page_size };
        Self { sort, page, page_size }
    }

    /// Number of records before this page.
    pub fn skip(&self) -> u64 {
        self.page.saturating_mul(self.page_size)
    }

    pub fn limit(&self) -> i64 {
        i64::try_from(self.page_size).unwrap_or(i64::MAX)
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(SortSpec::default(), 0, DEFAULT_PAGE_SIZE)
    }
}

fn count_param(params: &Params, key: &str) -> DocumentStoreResult<Option<u64>> {
    let Some(value) = params.get(key) else {
        return Ok(None);
    };

    match numeric(value) {
        Some(number) if number >= 0.0 && number.is_finite() => Ok(Some(number as u64)),
        _ => Err(DocumentStoreError::InvalidValue {
            field: key.to_string(),
            expected: "non-negative integer".to_string(),
        }),
    }
}

/// Reads `page`, `page_size` and the sort from request parameters.
pub fn paginate(params: &Params) -> DocumentStoreResult<Pagination> {
    let page = count_param(params, "page")?.unwrap_or(0);
    let page_size = count_param(params, "page_size")?.unwrap_or(DEFAULT_PAGE_SIZE);

    Ok(Pagination::new(sort_spec(params), page, page_size))
}

/// A single page of results.
///
/// `page` and `page_size` echo the pagination that produced it; `count` is the
/// number of matching records across all pages.
///
/// # Example
///
/// ```ignore
/// use doclink::page::Page;
///
/// let page: Page<String> = Page::builder(vec!["item1".to_string()])
///     .with_count(100)
///     .with_page(0)
///     .with_page_size(50)
///     .build();
///
/// assert_eq!(page.next_page(), Some(1));
/// assert_eq!(page.previous_page(), None);
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub results: Vec<T>,
    pub count: u64,
    pub page: u64,
    pub page_size: u64,
}

impl<T> Page<T> {
    pub fn builder(results: Vec<T>) -> PageBuilder<T> {
        PageBuilder::new(results)
    }

    /// Index of the following page, if any record lies beyond this one.
    pub fn next_page(&self) -> Option<u64> {
        let seen = self.page.saturating_add(1).saturating_mul(self.page_size);
        (seen < self.count).then(|| self.page + 1)
    }

    /// Index of the preceding page, unless this is the first.
    pub fn previous_page(&self) -> Option<u64> {
        self.page.checked_sub(1)
    }
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
            count: 0,
            page: 0,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Builder for constructing [`Page`] instances.
pub struct PageBuilder<T> {
    results: Vec<T>,
    count: u64,
    page: u64,
    page_size: u64,
}

impl<T> PageBuilder<T> {
    pub fn new(results: Vec<T>) -> Self {
        Self {
            results,
            count: 0,
            page: 0,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Sets the total count of matching records across all pages.
    pub fn with_count(mut self, count: u64) -> Self {
        self.count = count;
        self
    }

    pub fn with_page(mut self, page: u64) -> Self {
        self.page = page;
        self
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn build(self) -> Page<T> {
        Page {
            results: self.results,
            count: self.count,
            page: self.page,
            page_size: self.page_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn sort_precedence() {
        let params = doc! { "sort": -1, "sort_desc": "views", "sort_asc": "title, views" };
        assert_eq!(sort_spec(&params).to_document(), doc! { "title": 1, "views": 1 });

        let params = doc! { "sort": -1, "sort_desc": "views" };
        assert_eq!(sort_spec(&params).to_document(), doc! { "views": -1 });

        let params = doc! { "sort": "-1" };
        assert_eq!(sort_spec(&params).to_document(), doc! { "_id": -1 });

        let params = doc! { "sort": { "views": -1, "title": 1 } };
        assert_eq!(sort_spec(&params).to_document(), doc! { "views": -1, "title": 1 });

        assert_eq!(sort_spec(&doc! {}).to_document(), doc! { "_id": 1 });
        assert!(SortSpec::from_params(&doc! {}).is_none());
    }

    #[test]
    fn pagination_defaults_and_coercion() {
        let pagination = paginate(&doc! {}).unwrap();
        assert_eq!((pagination.page, pagination.page_size), (0, DEFAULT_PAGE_SIZE));

        let pagination = paginate(&doc! { "page": "2", "page_size": 10.0 }).unwrap();
        assert_eq!((pagination.page, pagination.page_size), (2, 10));
        assert_eq!(pagination.skip(), 20);

        let pagination = paginate(&doc! { "page_size": 0 }).unwrap();
        assert_eq!(pagination.page_size, DEFAULT_PAGE_SIZE);

        assert!(matches!(
            paginate(&doc! { "page": "first" }),
            Err(DocumentStoreError::InvalidValue { .. })
        ));
        assert!(paginate(&doc! { "page": -1 }).is_err());
    }

    #[test]
    fn page_navigation() {
        let page = Page::builder(vec![1, 2])
            .with_count(5)
            .with_page(1)
            .with_page_size(2)
            .build();
        assert_eq!(page.next_page(), Some(2));
        assert_eq!(page.previous_page(), Some(0));

        let last = Page::builder(vec![5])
            .with_count(5)
            .with_page(2)
            .with_page_size(2)
            .build();
        assert_eq!(last.next_page(), None);
    }
}

//! Pagination strategies over OData listings.
//!
//! A strategy turns a [`Cursor`] plus a page size into one upstream request
//! and reports the cursor of the following page. The orchestrator owns the
//! loop so it can commit and checkpoint between pages.

use super::fetcher::{FetchError, ResilientFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// OData field holding the next-page link.
pub const NEXT_LINK_FIELD: &str = "@odata.nextLink";

/// Position in a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cursor {
    /// Number of rows confirmed so far; the next request uses it as `$skip`.
    Offset { skip: u64 },
    /// Opaque next-page link (`None` = first page), how many rows of that
    /// page are already confirmed, and which filter form opened the listing.
    Link {
        token: Option<String>,
        skip: usize,
        #[serde(default)]
        variant: usize,
    },
    /// Listing fully drained.
    Done,
}

impl Cursor {
    pub fn is_done(&self) -> bool {
        matches!(self, Cursor::Done)
    }

    /// Rows at the head of the page fetched at this cursor that were already
    /// processed.
    pub fn skip_in_page(&self) -> usize {
        match self {
            Cursor::Link { skip, .. } => *skip,
            _ => 0,
        }
    }

    /// Position after the first `consumed` rows of the page fetched at `self`.
    pub fn within_page(&self, consumed: usize) -> Cursor {
        match self {
            Cursor::Offset { skip } => Cursor::Offset {
                skip: skip + consumed as u64,
            },
            Cursor::Link { token, variant, .. } => Cursor::Link {
                token: token.clone(),
                skip: consumed,
                variant: *variant,
            },
            Cursor::Done => Cursor::Done,
        }
    }

    pub fn fits(&self, mode: PaginationMode) -> bool {
        matches!(
            (self, mode),
            (Cursor::Done, _)
                | (Cursor::Offset { .. }, PaginationMode::Offset)
                | (Cursor::Link { .. }, PaginationMode::Link)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationMode {
    /// `$top`/`$skip` on the parameterised function endpoint.
    #[default]
    Offset,
    /// Follow `@odata.nextLink` on the filtered entity set.
    Link,
}

/// One fetched page.
#[derive(Debug, Clone)]
pub struct Page {
    pub rows: Vec<Value>,
    pub next: Cursor,
}

pub trait PageSource {
    fn mode(&self) -> PaginationMode;

    /// Cursor of the first page.
    fn start(&self) -> Cursor;

    fn fetch_page(
        &self,
        fetcher: &ResilientFetcher,
        cursor: &Cursor,
        page_size: usize,
    ) -> Result<Page, FetchError>;

    /// Cursor that reopens the listing under the next query form, when the
    /// first page at `cursor` came back empty or rejected.
    fn alternative(&self, _cursor: &Cursor) -> Option<Cursor> {
        None
    }
}

/// Offset pagination: `skip` advances by the rows actually received, and a
/// short or empty page ends the listing.
#[derive(Debug, Clone)]
pub struct OffsetPaging {
    url: String,
    params: Vec<(String, String)>,
}

impl OffsetPaging {
    pub fn new(url: impl Into<String>, params: Vec<(String, String)>) -> Self {
        Self {
            url: url.into(),
            params,
        }
    }
}

impl PageSource for OffsetPaging {
    fn mode(&self) -> PaginationMode {
        PaginationMode::Offset
    }

    fn start(&self) -> Cursor {
        Cursor::Offset { skip: 0 }
    }

    fn fetch_page(
        &self,
        fetcher: &ResilientFetcher,
        cursor: &Cursor,
        page_size: usize,
    ) -> Result<Page, FetchError> {
        let skip = match cursor {
            Cursor::Offset { skip } => *skip,
            Cursor::Done => {
                return Ok(Page {
                    rows: Vec::new(),
                    next: Cursor::Done,
                })
            }
            Cursor::Link { .. } => 0,
        };

        let mut params = self.params.clone();
        params.push(("$top".into(), page_size.to_string()));
        params.push(("$skip".into(), skip.to_string()));

        let body = fetcher.fetch(&self.url, &params)?;
        let rows = rows_of(&body)?;

        let next = if rows.is_empty() || rows.len() < page_size {
            Cursor::Done
        } else {
            Cursor::Offset {
                skip: skip + rows.len() as u64,
            }
        };
        Ok(Page { rows, next })
    }
}

/// Link-following pagination. The first request carries the query
/// parameters and `$top`; later requests use the next link verbatim.
///
/// Several query forms may be given for the first request. They are tried in
/// order through [`PageSource::alternative`]; the cursor remembers which one
/// opened the listing.
#[derive(Debug, Clone)]
pub struct LinkPaging {
    url: String,
    variants: Vec<Vec<(String, String)>>,
}

impl LinkPaging {
    pub fn new(url: impl Into<String>, params: Vec<(String, String)>) -> Self {
        Self::with_variants(url, vec![params])
    }

    pub fn with_variants(url: impl Into<String>, variants: Vec<Vec<(String, String)>>) -> Self {
        Self {
            url: url.into(),
            variants,
        }
    }

    /// Query of the given form; an out-of-range index falls back to the last form.
    fn params(&self, variant: usize) -> Vec<(String, String)> {
        self.variants
            .get(variant)
            .or_else(|| self.variants.last())
            .cloned()
            .unwrap_or_default()
    }
}

impl PageSource for LinkPaging {
    fn mode(&self) -> PaginationMode {
        PaginationMode::Link
    }

    fn start(&self) -> Cursor {
        Cursor::Link {
            token: None,
            skip: 0,
            variant: 0,
        }
    }

    fn fetch_page(
        &self,
        fetcher: &ResilientFetcher,
        cursor: &Cursor,
        page_size: usize,
    ) -> Result<Page, FetchError> {
        let variant = match cursor {
            Cursor::Link { variant, .. } => *variant,
            _ => 0,
        };
        let body = match cursor {
            Cursor::Link {
                token: Some(link), ..
            } => fetcher.fetch(link, &[])?,
            Cursor::Done => {
                return Ok(Page {
                    rows: Vec::new(),
                    next: Cursor::Done,
                })
            }
            _ => {
                let mut params = self.params(variant);
                params.push(("$top".into(), page_size.to_string()));
                fetcher.fetch(&self.url, &params)?
            }
        };

        let rows = rows_of(&body)?;
        let next = match body.get(NEXT_LINK_FIELD).and_then(Value::as_str) {
            Some(link) if !link.is_empty() => Cursor::Link {
                token: Some(link.to_string()),
                skip: 0,
                variant,
            },
            _ => Cursor::Done,
        };
        Ok(Page { rows, next })
    }

    fn alternative(&self, cursor: &Cursor) -> Option<Cursor> {
        match cursor {
            Cursor::Link {
                token: None,
                skip: 0,
                variant,
            } if variant + 1 < self.variants.len() => Some(Cursor::Link {
                token: None,
                skip: 0,
                variant: variant + 1,
            }),
            _ => None,
        }
    }
}

fn rows_of(body: &Value) -> Result<Vec<Value>, FetchError> {
    match body.get("value") {
        Some(Value::Array(rows)) => Ok(rows.clone()),
        Some(other) => Err(FetchError::MalformedBody(format!(
            "'value' is not an array: {}",
            crate::text::truncate_chars(&other.to_string(), 120)
        ))),
        None => Err(FetchError::MalformedBody("missing 'value' array".into())),
    }
}

/// Drain a listing from the start, collecting every row.
pub fn drain(
    source: &dyn PageSource,
    fetcher: &ResilientFetcher,
    page_size: usize,
) -> Result<Vec<Value>, FetchError> {
    let mut cursor = source.start();
    let mut rows = Vec::new();
    while !cursor.is_done() {
        let page = source.fetch_page(fetcher, &cursor, page_size)?;
        rows.extend(page.rows);
        cursor = page.next;
    }
    Ok(rows)
}

//! Pagination types for store listings.

use serde::{Deserialize, Serialize};

use crate::database::models::StatusClause;
use crate::domain::DownloadStatus;
use crate::{Error, Result};

/// Largest page size a caller may request.
pub const MAX_PER_PAGE: usize = 500;

/// Sort order for listings, by insertion order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            _ => None,
        }
    }
}

/// Status predicate: `status` keeps matching records, `!status` drops them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Is(DownloadStatus),
    Not(DownloadStatus),
}

impl StatusFilter {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (negated, name) = match s.strip_prefix('!') {
            Some(rest) => (true, rest.trim()),
            None => (false, s),
        };
        let status: DownloadStatus = name
            .parse()
            .map_err(|_| Error::Other(format!("Unknown status filter: {s}")))?;
        Ok(if negated {
            Self::Not(status)
        } else {
            Self::Is(status)
        })
    }

    pub fn matches(&self, status: DownloadStatus) -> bool {
        match self {
            Self::Is(s) => *s == status,
            Self::Not(s) => *s != status,
        }
    }

    /// The filter as a storage predicate.
    pub fn clause(&self) -> StatusClause<'static> {
        match self {
            Self::Is(s) => StatusClause {
                status: s.as_str(),
                negated: false,
            },
            Self::Not(s) => StatusClause {
                status: s.as_str(),
                negated: true,
            },
        }
    }
}

/// Clamped bounds of a requested page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    /// 1-based page number actually returned.
    pub page: usize,
    pub per_page: usize,
    /// Number of records matching the filter.
    pub total: usize,
    pub total_pages: usize,
}

impl PageWindow {
    /// `page < 1` is treated as 1 and pages past the end clamp to the last page.
    pub fn new(page: usize, per_page: usize, total: usize) -> Self {
        let per_page = per_page.clamp(1, MAX_PER_PAGE);
        let total_pages = total.div_ceil(per_page);
        Self {
            page: page.max(1).min(total_pages.max(1)),
            per_page,
            total,
            total_pages,
        }
    }

    /// Records to skip before this page.
    pub fn offset(&self) -> usize {
        (self.page - 1) * self.per_page
    }
}

/// One page of records.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub total_pages: usize,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, window: PageWindow) -> Self {
        Self {
            items,
            page: window.page,
            per_page: window.per_page,
            total: window.total,
            total_pages: window.total_pages,
        }
    }
}

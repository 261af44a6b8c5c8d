//! Expands a search region and page count into page requests.

use std::iter::FusedIterator;

use crate::model::{PageRequest, SearchRegion};
use crate::traits::PlanError;

/// Page limit applied by [`RequestPlanner::new`].
pub const DEFAULT_MAX_PAGES: usize = 1_000;

/// A validated harvest plan: one region, `pages` pages.
///
/// The plan itself is inert. [`RequestPlanner::iter`] produces the requests
/// lazily and can be called any number of times; each call starts over at
/// page 0.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestPlanner {
    region: SearchRegion,
    pages: usize,
}

impl RequestPlanner {
    pub fn new(region: SearchRegion, pages: usize) -> Result<Self, PlanError> {
        Self::with_max_pages(region, pages, DEFAULT_MAX_PAGES)
    }

    /// Like [`new`](Self::new), rejecting plans longer than `max_pages`.
    pub fn with_max_pages(
        region: SearchRegion,
        pages: usize,
        max_pages: usize,
    ) -> Result<Self, PlanError> {
        if pages < 1 || pages > max_pages {
            return Err(PlanError::InvalidPageCount(pages));
        }
        Ok(Self { region, pages })
    }

    /// Validates raw bounds and page count in one step.
    pub fn from_bounds(
        west: f64,
        east: f64,
        south: f64,
        north: f64,
        pages: usize,
    ) -> Result<Self, PlanError> {
        Self::new(SearchRegion::new(west, east, south, north)?, pages)
    }

    pub fn region(&self) -> &SearchRegion {
        &self.region
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn iter(&self) -> PageRequests {
        PageRequests {
            region: self.region,
            next: 0,
            end: self.pages,
        }
    }
}

impl<'a> IntoIterator for &'a RequestPlanner {
    type Item = PageRequest;
    type IntoIter = PageRequests;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Lazy sequence of page requests, in page-index order.
#[derive(Debug, Clone)]
pub struct PageRequests {
    region: SearchRegion,
    next: usize,
    end: usize,
}

impl Iterator for PageRequests {
    type Item = PageRequest;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let request = PageRequest::new(self.region, self.next);
        self.next += 1;
        Some(request)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for PageRequests {}

impl FusedIterator for PageRequests {}

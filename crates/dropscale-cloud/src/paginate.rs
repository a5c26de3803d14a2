//! Lazy iteration over paged list endpoints.

use std::future::Future;

use crate::error::{CloudError, CloudResult};
use crate::types::{ListOptions, PageInfo};

/// Pulls pages from a list endpoint one request at a time.
///
/// Pages are fetched only when asked for, so callers that stop early
/// (or process page-by-page, as scale-in does) never issue requests for
/// pages they do not need. A page error is surfaced once and terminates
/// the iteration.
pub struct Paginator<T, F, Fut>
where
    F: FnMut(ListOptions) -> Fut,
    Fut: Future<Output = CloudResult<(Vec<T>, PageInfo)>>,
{
    fetch: F,
    opts: ListOptions,
    done: bool,
}

impl<T, F, Fut> Paginator<T, F, Fut>
where
    F: FnMut(ListOptions) -> Fut,
    Fut: Future<Output = CloudResult<(Vec<T>, PageInfo)>>,
{
    pub fn new(fetch: F) -> Self {
        Self {
            fetch,
            opts: ListOptions::default(),
            done: false,
        }
    }

    /// Fetch the next page, or `None` once the listing is exhausted.
    pub async fn next_page(&mut self) -> Option<CloudResult<Vec<T>>> {
        if self.done {
            return None;
        }
        match (self.fetch)(self.opts).await {
            Ok((items, info)) => {
                if info.last {
                    self.done = true;
                } else {
                    self.opts.page = Some(info.current + 1);
                }
                Some(Ok(items))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }

    /// Drain every remaining page into one vector.
    pub async fn collect_all(mut self) -> CloudResult<Vec<T>> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await {
            all.extend(page?);
        }
        Ok(all)
    }
}

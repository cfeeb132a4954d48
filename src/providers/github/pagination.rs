use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::error::{ExporterError, Result};

/// Maximum page size accepted by the GitHub REST API.
pub const PER_PAGE: u32 = 100;

/// One page of a list endpoint.
#[derive(Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Page number of the next page, `None` on the last page
    pub next: Option<u32>,
}

/// Result of walking every page of a list endpoint.
///
/// A failure mid-way keeps the items fetched before it; callers log the error
/// and publish what they have.
#[derive(Debug)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub error: Option<ExporterError>,
}

/// Retry behavior for upstream calls.
///
/// Rate-limit errors always wait until the limiter's reset instant and retry
/// the same request without consuming an attempt. Other errors are retried
/// `transient_retries` times, `transient_delay` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub transient_retries: u32,
    pub transient_delay: Duration,
}

impl BackoffPolicy {
    pub const fn new(transient_retries: u32, transient_delay: Duration) -> Self {
        Self {
            transient_retries,
            transient_delay,
        }
    }

    /// Policy for list pagination: any non rate-limit error ends the walk.
    pub const fn pages() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Policy for single lookups: three attempts, two seconds apart.
    pub const fn single_call() -> Self {
        Self::new(2, Duration::from_secs(2))
    }

    /// Time to wait before retrying after `error`, or `None` to give up.
    ///
    /// `attempt` counts the transient failures seen so far, starting at 1.
    pub fn delay_for(&self, error: &ExporterError, attempt: u32) -> Option<Duration> {
        if let Some(reset) = error.reset_instant() {
            return Some(until(reset, Utc::now()));
        }

        (attempt <= self.transient_retries).then_some(self.transient_delay)
    }

    /// Runs `call` until it succeeds or the policy gives up.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let error = match call().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !error.is_rate_limited() {
                attempt += 1;
            }

            let Some(delay) = self.delay_for(&error, attempt) else {
                return Err(error);
            };

            if error.is_rate_limited() {
                warn!("{what} rate limited, pausing for {}s", delay.as_secs());
            } else {
                warn!(
                    "{what} failed ({error}), retrying in {}s ({attempt}/{})",
                    delay.as_secs(),
                    self.transient_retries
                );
            }
            tokio::time::sleep(delay).await;
        }
    }
}

fn until(reset: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (reset - now).to_std().unwrap_or(Duration::ZERO)
}

/// Fetches every page of a list endpoint, following next-page cursors.
///
/// `fetch` is called with the page number to load, starting at 1. Rate-limited
/// pages are retried after the advertised reset; any other error stops the walk
/// and is reported alongside the items gathered so far. The walk ends
/// successfully on the first page without a next cursor.
pub async fn paginate<T, F, Fut>(what: &str, policy: &BackoffPolicy, mut fetch: F) -> Paginated<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Page<T>>>,
{
    let mut items = Vec::new();
    let mut page = 1;

    loop {
        match policy.retry(what, || fetch(page)).await {
            Ok(fetched) => {
                debug!("{what}: page {page} returned {} items", fetched.items.len());
                items.extend(fetched.items);

                match fetched.next {
                    Some(next) if next != 0 => page = next,
                    _ => return Paginated { items, error: None },
                }
            }
            Err(error) => {
                return Paginated {
                    items,
                    error: Some(error),
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn create_pages(count: u32) -> Vec<Page<u32>> {
        (1..=count)
            .map(|n| Page {
                items: vec![n * 10, n * 10 + 1],
                next: (n < count).then_some(n + 1),
            })
            .collect()
    }

    fn rate_limited_now() -> ExporterError {
        ExporterError::RateLimited {
            reset: Utc::now() - chrono::Duration::seconds(1),
        }
    }

    fn transient() -> ExporterError {
        ExporterError::Api {
            status: 502,
            message: "bad gateway".to_string(),
        }
    }

    #[tokio::test]
    async fn test_visits_every_page_once_in_order() {
        let pages = RefCell::new(create_pages(3).into_iter().map(Some).collect::<Vec<_>>());
        let visited = RefCell::new(Vec::new());

        let result = paginate("test", &BackoffPolicy::pages(), |page| {
            visited.borrow_mut().push(page);
            let fetched = pages.borrow_mut()[(page - 1) as usize].take().unwrap();
            async move { Ok(fetched) }
        })
        .await;

        assert!(result.error.is_none());
        assert_eq!(*visited.borrow(), vec![1, 2, 3]);
        assert_eq!(result.items, vec![10, 11, 20, 21, 30, 31]);
    }

    #[tokio::test]
    async fn test_zero_cursor_terminates() {
        let calls = RefCell::new(0);

        let result = paginate("test", &BackoffPolicy::pages(), |_| {
            *calls.borrow_mut() += 1;
            async {
                Ok(Page {
                    items: vec![1],
                    next: Some(0),
                })
            }
        })
        .await;

        assert!(result.error.is_none());
        assert_eq!(*calls.borrow(), 1);
        assert_eq!(result.items, vec![1]);
    }

    #[tokio::test]
    async fn test_error_keeps_partial_result_and_stops() {
        let visited = RefCell::new(Vec::new());

        let result: Paginated<u32> = paginate("test", &BackoffPolicy::pages(), |page| {
            visited.borrow_mut().push(page);
            async move {
                if page == 2 {
                    Err(transient())
                } else {
                    Ok(Page {
                        items: vec![page],
                        next: Some(page + 1),
                    })
                }
            }
        })
        .await;

        assert!(result.error.is_some());
        assert_eq!(result.items, vec![1]);
        assert_eq!(*visited.borrow(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_error_on_first_page_yields_nothing() {
        let result: Paginated<u32> =
            paginate("test", &BackoffPolicy::pages(), |_| async { Err(transient()) }).await;

        assert!(result.items.is_empty());
        assert!(matches!(result.error, Some(ExporterError::Api { status: 502, .. })));
    }

    #[tokio::test]
    async fn test_rate_limit_retries_same_page() {
        let visited = RefCell::new(Vec::new());
        let limited_once = RefCell::new(false);

        let result = paginate("test", &BackoffPolicy::pages(), |page| {
            visited.borrow_mut().push(page);
            let limit_now = page == 2 && !limited_once.replace(true);
            async move {
                if limit_now {
                    Err(rate_limited_now())
                } else {
                    Ok(Page {
                        items: vec![page],
                        next: (page < 3).then_some(page + 1),
                    })
                }
            }
        })
        .await;

        assert!(result.error.is_none());
        assert_eq!(*visited.borrow(), vec![1, 2, 2, 3]);
        assert_eq!(result.items, vec![1, 2, 3]);
    }

    #[test]
    fn test_delay_until_reset_instant() {
        let policy = BackoffPolicy::pages();
        let reset = Utc::now() + chrono::Duration::seconds(120);
        let delay = policy
            .delay_for(&ExporterError::RateLimited { reset }, 1)
            .unwrap();

        assert!(delay <= Duration::from_secs(120));
        assert!(delay > Duration::from_secs(110));
    }

    #[test]
    fn test_past_reset_waits_zero() {
        let policy = BackoffPolicy::pages();
        assert_eq!(policy.delay_for(&rate_limited_now(), 1), Some(Duration::ZERO));
    }

    #[test]
    fn test_transient_attempts_are_bounded() {
        let policy = BackoffPolicy::single_call();
        assert_eq!(policy.delay_for(&transient(), 1), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_for(&transient(), 2), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_for(&transient(), 3), None);

        assert_eq!(BackoffPolicy::pages().delay_for(&transient(), 1), None);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_error() {
        let calls = RefCell::new(0);
        let policy = BackoffPolicy::new(2, Duration::ZERO);

        let value = policy
            .retry("test", || {
                *calls.borrow_mut() += 1;
                let fail = *calls.borrow() < 3;
                async move { if fail { Err(transient()) } else { Ok(7) } }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(*calls.borrow(), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_attempts() {
        let calls = RefCell::new(0);
        let policy = BackoffPolicy::new(1, Duration::ZERO);

        let result: Result<u32> = policy
            .retry("test", || {
                *calls.borrow_mut() += 1;
                async { Err(transient()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(*calls.borrow(), 2);
    }
}

//! Continuation-token paging.

use crate::traits::{ConnectorError, ConnectorResult};
use std::future::Future;
use tracing::debug;

/// One page returned by a listing endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<R> {
    pub items: Vec<R>,
    pub next_token: Option<String>,
}

impl<R> Page<R> {
    pub fn new(items: Vec<R>, next_token: Option<String>) -> Self {
        Self { items, next_token }
    }

    pub fn last(items: Vec<R>) -> Self {
        Self::new(items, None)
    }
}

/// Records gathered across pages and the token to resume from.
#[derive(Debug, Clone, PartialEq)]
pub struct Collected<R> {
    pub items: Vec<R>,
    pub next_token: Option<String>,
}

/// Calls `fetch(token, remaining)` until `limit` records are collected, a page
/// comes back empty, no continuation token is returned, or the vendor answers
/// with no content.
pub async fn collect_pages<R, F, Fut>(
    limit: usize,
    start_token: Option<String>,
    mut fetch: F,
) -> ConnectorResult<Collected<R>>
where
    F: FnMut(Option<String>, usize) -> Fut,
    Fut: Future<Output = ConnectorResult<Page<R>>>,
{
    let mut items = Vec::new();
    let mut token = start_token;

    while items.len() < limit {
        let remaining = limit - items.len();
        let page = match fetch(token.clone(), remaining).await {
            Ok(page) => page,
            Err(ConnectorError::NoContent) => {
                debug!("No content, stopping pagination");
                token = None;
                break;
            }
            Err(e) => return Err(e),
        };

        let empty = page.items.is_empty();
        items.extend(page.items);
        token = page.next_token.filter(|t| !t.is_empty());

        if empty || token.is_none() {
            break;
        }
    }

    items.truncate(limit);
    Ok(Collected {
        items,
        next_token: token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pages() -> Vec<Page<u32>> {
        vec![
            Page::new(vec![1, 2], Some("t1".into())),
            Page::new(vec![3, 4], Some("t2".into())),
            Page::last(vec![5]),
        ]
    }

    async fn run(limit: usize, source: Vec<Page<u32>>) -> (Collected<u32>, Vec<Option<String>>) {
        let mut calls = Vec::new();
        let mut iter = source.into_iter();
        let collected = collect_pages(limit, None, |token, _remaining| {
            calls.push(token);
            let next = iter.next();
            async move { next.ok_or(ConnectorError::NoContent) }
        })
        .await
        .unwrap();
        (collected, calls)
    }

    #[tokio::test]
    async fn test_collects_until_no_token() {
        let (collected, calls) = run(100, pages()).await;
        assert_eq!(collected.items, vec![1, 2, 3, 4, 5]);
        assert_eq!(collected.next_token, None);
        assert_eq!(calls, vec![None, Some("t1".into()), Some("t2".into())]);
    }

    #[tokio::test]
    async fn test_stops_at_limit() {
        let (collected, calls) = run(3, pages()).await;
        assert_eq!(collected.items, vec![1, 2, 3]);
        assert_eq!(collected.next_token.as_deref(), Some("t2"));
        assert_eq!(calls.len(), 2);
    }

    #[tokio::test]
    async fn test_stops_on_empty_page() {
        let source = vec![Page::new(vec![1], Some("t1".into())), Page::new(vec![], Some("t2".into()))];
        let (collected, calls) = run(10, source).await;
        assert_eq!(collected.items, vec![1]);
        assert_eq!(calls.len(), 2);
    }

    #[tokio::test]
    async fn test_no_content_ends_paging() {
        let source = vec![Page::new(vec![1], Some("t1".into()))];
        let (collected, _) = run(10, source).await;
        assert_eq!(collected.items, vec![1]);
        assert_eq!(collected.next_token, None);
    }

    #[tokio::test]
    async fn test_errors_propagate() {
        let result: ConnectorResult<Collected<u32>> = collect_pages(5, None, |_, _| async {
            Err(ConnectorError::Api {
                status: 500,
                body: "boom".into(),
            })
        })
        .await;
        assert!(matches!(result, Err(ConnectorError::Api { status: 500, .. })));
    }
}

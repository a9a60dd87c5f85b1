//! In-app notification inbox with offset/limit pagination.

use crate::models::NotificationEvent;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

const DEFAULT_CAPACITY: usize = 1000;

/// One page of inbox entries, newest first.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxPage {
    pub items: Vec<NotificationEvent>,
    pub offset: usize,
    pub limit: usize,
    pub total: usize,
    pub has_more: bool,
}

/// Bounded in-memory inbox. The oldest entries fall off past capacity.
#[derive(Debug, Clone)]
pub struct Inbox {
    inner: Arc<RwLock<VecDeque<NotificationEvent>>>,
    capacity: usize,
}

impl Default for Inbox {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, event: NotificationEvent) {
        let mut inbox = self.inner.write().expect("inbox lock poisoned");
        inbox.push_front(event);
        inbox.truncate(self.capacity);
        tracing::debug!("Inbox: stored notification ({} total)", inbox.len());
    }

    pub fn page(&self, offset: usize, limit: usize) -> InboxPage {
        let inbox = self.inner.read().expect("inbox lock poisoned");
        let total = inbox.len();
        let items: Vec<NotificationEvent> = inbox.iter().skip(offset).take(limit).cloned().collect();
        let end = offset.saturating_add(items.len());
        InboxPage {
            items,
            offset,
            limit,
            total,
            has_more: end < total,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("inbox lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;
    use chrono::Utc;

    fn event(title: &str) -> NotificationEvent {
        NotificationEvent {
            severity: Severity::Info,
            title: title.into(),
            job_id: None,
            counts: None,
            conflict_summary: None,
            errors: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_pagination_newest_first() {
        let inbox = Inbox::new();
        for i in 0..5 {
            inbox.push(event(&format!("n{}", i)));
        }

        let page = inbox.page(0, 2);
        assert_eq!(page.items[0].title, "n4");
        assert_eq!(page.total, 5);
        assert!(page.has_more);

        let last = inbox.page(4, 2);
        assert_eq!(last.items.len(), 1);
        assert!(!last.has_more);

        let past = inbox.page(10, 2);
        assert!(past.items.is_empty());
        assert!(!past.has_more);
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let inbox = Inbox::with_capacity(2);
        inbox.push(event("a"));
        inbox.push(event("b"));
        inbox.push(event("c"));
        assert_eq!(inbox.len(), 2);
        let titles: Vec<String> = inbox.page(0, 10).items.into_iter().map(|e| e.title).collect();
        assert_eq!(titles, vec!["c", "b"]);
    }
}

use chrono::{DateTime, Utc};
use shared::domain::Message;
use tracing::debug;

use crate::store::{ConversationStore, UpsertOutcome};

/// Gap-aware description of how much history is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversationWindow {
    pub oldest_loaded_at: Option<DateTime<Utc>>,
    pub has_more_older: bool,
}

impl Default for ConversationWindow {
    fn default() -> Self {
        Self {
            oldest_loaded_at: None,
            has_more_older: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Exclusive upper bound; `None` requests the newest page.
    pub before: Option<DateTime<Utc>>,
    pub limit: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageMerge {
    pub appended: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone)]
pub struct PaginationController {
    window: ConversationWindow,
    page_size: u32,
    loading_older: bool,
}

impl PaginationController {
    pub fn new(page_size: u32) -> Self {
        Self {
            window: ConversationWindow::default(),
            page_size: page_size.max(1),
            loading_older: false,
        }
    }

    pub fn window(&self) -> ConversationWindow {
        self.window
    }

    pub fn has_more(&self) -> bool {
        self.window.has_more_older
    }

    /// While set, merges must not move the view to the newest message.
    pub fn is_loading_older(&self) -> bool {
        self.loading_older
    }

    pub fn initial_request(&mut self) -> PageRequest {
        self.window = ConversationWindow::default();
        self.loading_older = false;
        PageRequest {
            before: None,
            limit: self.page_size,
        }
    }

    /// Next backward page, bounded by the oldest loaded timestamp rather than
    /// an offset so concurrent arrivals at the head do not shift it.
    pub fn next_request(&mut self, store: &ConversationStore) -> Option<PageRequest> {
        if !self.window.has_more_older || self.loading_older {
            return None;
        }
        let before = store.oldest_created_at().or(self.window.oldest_loaded_at);
        self.loading_older = before.is_some();
        Some(PageRequest {
            before,
            limit: self.page_size,
        })
    }

    pub fn merge_page(
        &mut self,
        store: &mut ConversationStore,
        request: PageRequest,
        page: Vec<Message>,
    ) -> PageMerge {
        let fetched = page.len();
        let mut merge = PageMerge::default();

        for message in page {
            let already_loaded = store.contains(&message.id);
            match store.upsert(message) {
                UpsertOutcome::Inserted => merge.appended += 1,
                UpsertOutcome::Updated if !already_loaded => merge.appended += 1,
                _ => merge.duplicates += 1,
            }
        }

        if fetched < request.limit as usize {
            self.window.has_more_older = false;
        }
        if let Some(oldest) = store.oldest_created_at() {
            let current = self.window.oldest_loaded_at.get_or_insert(oldest);
            if oldest < *current {
                *current = oldest;
            }
        }
        if request.before.is_some() {
            self.loading_older = false;
        }

        debug!(
            fetched,
            appended = merge.appended,
            duplicates = merge.duplicates,
            has_more = self.window.has_more_older,
            "pagination: page merged"
        );
        merge
    }

    pub fn abort_older(&mut self) {
        self.loading_older = false;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;
    use shared::domain::{ConversationId, MessageId, MessageKind, UserId};

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn message(n: i64) -> Message {
        Message {
            id: MessageId::new(format!("m{n}")),
            conversation_id: ConversationId::from("conv"),
            sender_id: UserId::from("u"),
            sender_display_name: "U".into(),
            avatar_ref: None,
            body: format!("body {n}"),
            kind: MessageKind::Text,
            created_at: at(n),
            edited_at: None,
            is_edited: false,
            reply_to_id: None,
            attachment: None,
            client_token: None,
        }
    }

    #[test]
    fn overlapping_page_grows_store_by_new_ids_only() {
        let mut store = ConversationStore::new(Duration::from_secs(60));
        let mut pagination = PaginationController::new(50);
        for n in 40..50 {
            store.upsert(message(n));
        }

        let request = pagination.initial_request();
        let page: Vec<Message> = (0..50).map(message).collect();
        let merge = pagination.merge_page(&mut store, request, page);

        assert_eq!(merge.appended, 40);
        assert_eq!(merge.duplicates, 10);
        assert_eq!(store.len(), 50);
        assert!(pagination.has_more());
    }

    #[test]
    fn uses_oldest_loaded_timestamp_as_cursor() {
        let mut store = ConversationStore::new(Duration::from_secs(60));
        let mut pagination = PaginationController::new(10);
        store.upsert(message(30));
        store.upsert(message(35));

        let request = pagination.next_request(&store).expect("request");
        assert_eq!(request.before, Some(at(30)));
        assert!(pagination.is_loading_older());
        assert_eq!(pagination.next_request(&store), None);

        pagination.merge_page(&mut store, request, (20..30).map(message).collect());
        assert!(!pagination.is_loading_older());
        assert_eq!(pagination.window().oldest_loaded_at, Some(at(20)));
    }

    #[test]
    fn short_page_marks_history_exhausted() {
        let mut store = ConversationStore::new(Duration::from_secs(60));
        let mut pagination = PaginationController::new(10);
        store.upsert(message(5));
        let request = pagination.next_request(&store).unwrap();
        pagination.merge_page(&mut store, request, (0..5).map(message).collect());

        assert!(!pagination.has_more());
        assert_eq!(pagination.next_request(&store), None);
    }

    #[test]
    fn tombstoned_ids_in_page_are_not_counted() {
        let mut store = ConversationStore::new(Duration::from_secs(60));
        let mut pagination = PaginationController::new(3);
        store.remove(&MessageId::from("m1"), at(100));
        let request = pagination.initial_request();
        let merge = pagination.merge_page(&mut store, request, (0..3).map(message).collect());
        assert_eq!(merge.appended, 2);
        assert!(!store.contains(&MessageId::from("m1")));
    }
}

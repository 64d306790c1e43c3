//! Feed pagination cursor.
//!
//! The cursor merges page-scan reads with concurrently arriving live
//! inserts without duplication: every post id that has entered the feed —
//! from a page, a live insert, or a bulk replace — lands in `seen`, and
//! later page fetches drop rows whose id is already there. A fetch is a
//! two-step conversation with the owner (`begin_page` hands out the window,
//! `complete_page` advances the cursor) so the provider read itself happens
//! outside the reconciler's serial queue.
//!
//! Resets keep `seen`: jumping back to page zero after the user posts must
//! not allow already-present posts to be fetched in again. Only a bulk
//! replace — where the authoritative list supersedes everything local —
//! rebuilds `seen` from scratch. A generation counter invalidates fetches
//! that were in flight across a reset or replace.

use std::collections::HashSet;

use veranda_core::{PageRange, PostId};

/// Cursor state for the ranked feed.
#[derive(Debug, Clone)]
pub struct PaginationCursor {
    page_size: usize,
    page_index: usize,
    has_more: bool,
    in_flight: bool,
    generation: u64,
    seen: HashSet<PostId>,
}

impl PaginationCursor {
    /// A cursor at page zero with nothing seen.
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            page_index: 0,
            has_more: true,
            in_flight: false,
            generation: 0,
            seen: HashSet::new(),
        }
    }

    /// The configured page size.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// The next page index to fetch.
    pub fn page_index(&self) -> usize {
        self.page_index
    }

    /// Whether the last completed page was full, i.e. more rows may exist.
    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Number of post ids the cursor has seen.
    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    /// Whether a post id has already entered the feed.
    pub fn is_seen(&self, id: PostId) -> bool {
        self.seen.contains(&id)
    }

    /// Record that a post id is now present. Returns `true` when the id is
    /// new — callers apply the row only in that case.
    pub fn note_seen(&mut self, id: PostId) -> bool {
        self.seen.insert(id)
    }

    /// Hand out the next fetch window, or `None` while a fetch is already
    /// in flight or the feed is exhausted.
    ///
    /// The returned generation must be passed back to
    /// [`complete_page`](Self::complete_page) /
    /// [`abort_page`](Self::abort_page); a reset or bulk replace in between
    /// invalidates it.
    pub fn begin_page(&mut self) -> Option<(PageRange, u64)> {
        if self.in_flight || !self.has_more {
            return None;
        }
        self.in_flight = true;
        let range = PageRange::new(self.page_index * self.page_size, self.page_size);
        Some((range, self.generation))
    }

    /// Finish a fetch: advance the page index and recompute `has_more` from
    /// the *unfiltered* row count the provider returned.
    ///
    /// Returns `false` when the fetch belongs to a stale generation, in
    /// which case its rows must be discarded.
    pub fn complete_page(&mut self, generation: u64, returned: usize) -> bool {
        if generation != self.generation {
            return false;
        }
        self.in_flight = false;
        self.page_index += 1;
        self.has_more = returned == self.page_size;
        true
    }

    /// Abandon a failed fetch without advancing.
    pub fn abort_page(&mut self, generation: u64) {
        if generation == self.generation {
            self.in_flight = false;
        }
    }

    /// Jump back to page zero, keeping `seen` so nothing re-enters.
    pub fn reset(&mut self) {
        self.page_index = 0;
        self.has_more = true;
        self.in_flight = false;
        self.generation += 1;
    }

    /// Rebuild after a bulk replace: the authoritative rows are the new
    /// first page, and only their ids count as seen.
    pub fn rebuild(&mut self, ids: impl IntoIterator<Item = PostId>) {
        self.seen = ids.into_iter().collect();
        self.page_index = 1;
        self.has_more = self.seen.len() >= self.page_size;
        self.in_flight = false;
        self.generation += 1;
    }

    /// Drop everything, as on sign-out.
    pub fn clear(&mut self) {
        self.seen.clear();
        self.page_index = 0;
        self.has_more = true;
        self.in_flight = false;
        self.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_advance_by_page_size() {
        let mut cursor = PaginationCursor::new(10);
        let (range, generation) = cursor.begin_page().unwrap();
        assert_eq!((range.offset, range.limit), (0, 10));
        assert!(cursor.complete_page(generation, 10));

        let (range, generation) = cursor.begin_page().unwrap();
        assert_eq!((range.offset, range.limit), (10, 10));
        assert!(cursor.complete_page(generation, 10));
        assert_eq!(cursor.page_index(), 2);
    }

    #[test]
    fn short_page_exhausts_the_feed() {
        let mut cursor = PaginationCursor::new(10);
        let (_, generation) = cursor.begin_page().unwrap();
        assert!(cursor.complete_page(generation, 7));
        assert!(!cursor.has_more());
        assert!(cursor.begin_page().is_none());
    }

    #[test]
    fn only_one_fetch_in_flight() {
        let mut cursor = PaginationCursor::new(10);
        let (_, generation) = cursor.begin_page().unwrap();
        assert!(cursor.begin_page().is_none());
        cursor.abort_page(generation);
        assert!(cursor.begin_page().is_some());
    }

    #[test]
    fn seen_dedups_across_sources() {
        let mut cursor = PaginationCursor::new(10);
        let live = PostId::new();
        assert!(cursor.note_seen(live));
        // The same id arriving later in a page fetch is not new.
        assert!(!cursor.note_seen(live));
        assert!(cursor.is_seen(live));
        assert_eq!(cursor.seen_len(), 1);
    }

    #[test]
    fn reset_keeps_seen_and_invalidates_in_flight_fetch() {
        let mut cursor = PaginationCursor::new(5);
        let id = PostId::new();
        cursor.note_seen(id);

        let (_, generation) = cursor.begin_page().unwrap();
        cursor.reset();

        // The pre-reset fetch is stale; its rows must be discarded.
        assert!(!cursor.complete_page(generation, 5));
        assert!(cursor.is_seen(id));
        assert_eq!(cursor.page_index(), 0);
        assert!(cursor.has_more());
    }

    #[test]
    fn rebuild_replaces_seen_with_authoritative_ids() {
        let mut cursor = PaginationCursor::new(2);
        cursor.note_seen(PostId::new());
        cursor.note_seen(PostId::new());
        cursor.note_seen(PostId::new());

        let fresh = [PostId::new(), PostId::new()];
        cursor.rebuild(fresh);
        assert_eq!(cursor.seen_len(), 2);
        assert!(cursor.is_seen(fresh[0]));
        assert_eq!(cursor.page_index(), 1);
        assert!(cursor.has_more());

        // A single authoritative row means the feed is already exhausted.
        cursor.rebuild([PostId::new()]);
        assert!(!cursor.has_more());
    }
}

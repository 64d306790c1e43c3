//! In-memory data provider with scripted failures and synthetic echoes.
//!
//! Behaves like the managed backend from the engine's point of view: rows
//! live in per-table maps keyed by their `id` column, every committed write
//! is echoed as a [`ChangeEvent`] to the subscriptions whose scope matches
//! the row, and interaction tables (`likes`, `reposts`) run the same
//! counter triggers the real backend runs, so a like lands back on the
//! client as an absolute `posts` update.
//!
//! Tests script the provider from the outside: inject failures for the next
//! N calls of an operation, hold writes open to observe queueing, sever
//! subscription streams to force reconnects, and seed or emit rows directly.

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;
use veranda_core::{
    ChangeEvent, ChangeOp, EventSubscription, PageRange, ProviderEffects, ProviderError, Row,
    Scope, SelectQuery, Table, Timestamp,
};

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

struct Subscription {
    scope: Scope,
    sender: mpsc::UnboundedSender<ChangeEvent>,
}

#[derive(Default)]
struct FailureScript {
    subscribes: u32,
    selects: u32,
    inserts: u32,
    updates: u32,
    deletes: u32,
}

#[derive(Default)]
struct Attempts {
    subscribes: usize,
    selects: usize,
    inserts: usize,
    updates: usize,
    deletes: usize,
}

#[derive(Default)]
struct ProviderState {
    tables: HashMap<Table, HashMap<Uuid, Row>>,
    subscriptions: Vec<Subscription>,
    failures: FailureScript,
    attempts: Attempts,
    event_seq: u64,
}

/// Scriptable in-memory stand-in for the managed backend.
pub struct InMemoryProvider {
    state: Mutex<ProviderState>,
    writes_held: watch::Sender<bool>,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryProvider")
            .field("tables", &state.tables.len())
            .field("subscriptions", &state.subscriptions.len())
            .finish()
    }
}

impl InMemoryProvider {
    /// Empty provider with no scripted behavior.
    pub fn new() -> Self {
        let (writes_held, _) = watch::channel(false);
        Self {
            state: Mutex::new(ProviderState::default()),
            writes_held,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Seeding and direct event injection
    // ─────────────────────────────────────────────────────────────────────

    /// Stores a row without echoing an event or running triggers.
    ///
    /// Use for data that existed before the engine connected.
    pub fn seed(&self, table: Table, row: Row) {
        let mut state = self.state.lock();
        let id = row_id(&row).expect("seeded row needs an id column");
        state.tables.entry(table).or_default().insert(id, row);
    }

    /// Row currently stored under `id`, if any.
    pub fn stored_row(&self, table: Table, id: Uuid) -> Option<Row> {
        let state = self.state.lock();
        state.tables.get(&table)?.get(&id).cloned()
    }

    /// Delivers an insert event to matching subscriptions without storing
    /// the row, as if another client had written it.
    pub fn emit_insert(&self, table: Table, row: Row) {
        let id = row_id(&row).expect("emitted row needs an id column");
        let mut state = self.state.lock();
        let ts = next_event_ts(&mut state);
        let event = ChangeEvent::new(table, ChangeOp::Insert, id, row, ts);
        deliver(&mut state, &event, None);
    }

    /// Delivers an arbitrary event to subscriptions matching its payload.
    pub fn emit(&self, event: ChangeEvent) {
        let mut state = self.state.lock();
        deliver(&mut state, &event, None);
    }

    /// Builds an absolute update event from the stored `posts` row.
    ///
    /// This is the shape the backend's counter triggers produce, so tests
    /// can replay a server echo for a post without hand-writing the row.
    pub fn post_update_event(&self, id: Uuid) -> ChangeEvent {
        let mut state = self.state.lock();
        let row = state
            .tables
            .get(&Table::Posts)
            .and_then(|rows| rows.get(&id))
            .cloned()
            .expect("post row must be stored before building its echo");
        let ts = next_event_ts(&mut state);
        ChangeEvent::new(Table::Posts, ChangeOp::Update, id, row, ts)
    }

    /// Severs every subscription stream for `scope`.
    ///
    /// The engine sees the stream end and runs its reconnect path.
    pub fn drop_subscriptions(&self, scope: &Scope) {
        let mut state = self.state.lock();
        state.subscriptions.retain(|sub| &sub.scope != scope);
    }

    /// Sorted window of `posts` rows, newest first.
    ///
    /// Matches the query the feed pagination path issues, so tests can fetch
    /// a page without rebuilding the query by hand.
    pub async fn page_of_posts(&self, range: PageRange) -> Vec<Row> {
        use veranda_core::OrderBy;
        let query = SelectQuery::table(Table::Posts)
            .order(OrderBy::desc("created_at"))
            .range(range.offset, range.limit);
        self.select(query).await.expect("posts page read")
    }

    // ─────────────────────────────────────────────────────────────────────
    // Failure scripting
    // ─────────────────────────────────────────────────────────────────────

    /// Fails the next `n` subscribe calls with a transport error.
    pub fn fail_next_subscribes(&self, n: u32) {
        self.state.lock().failures.subscribes += n;
    }

    /// Fails the next `n` select calls.
    pub fn fail_next_selects(&self, n: u32) {
        self.state.lock().failures.selects += n;
    }

    /// Fails the next `n` insert calls.
    pub fn fail_next_inserts(&self, n: u32) {
        self.state.lock().failures.inserts += n;
    }

    /// Fails the next `n` update calls.
    pub fn fail_next_updates(&self, n: u32) {
        self.state.lock().failures.updates += n;
    }

    /// Fails the next `n` delete calls.
    pub fn fail_next_deletes(&self, n: u32) {
        self.state.lock().failures.deletes += n;
    }

    /// Blocks insert/update/delete completion until [`release_writes`].
    ///
    /// Attempt counters still advance when the call arrives, so tests can
    /// observe which writes started while others queue behind them.
    ///
    /// [`release_writes`]: Self::release_writes
    pub fn hold_writes(&self) {
        self.writes_held.send_replace(true);
    }

    /// Lets held writes proceed.
    pub fn release_writes(&self) {
        self.writes_held.send_replace(false);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Attempt counters
    // ─────────────────────────────────────────────────────────────────────

    /// Subscribe calls made, including failed ones.
    pub fn subscribe_attempts(&self) -> usize {
        self.state.lock().attempts.subscribes
    }

    /// Select calls made, including failed ones.
    pub fn select_attempts(&self) -> usize {
        self.state.lock().attempts.selects
    }

    /// Insert calls made, including failed and held ones.
    pub fn insert_attempts(&self) -> usize {
        self.state.lock().attempts.inserts
    }

    /// Update calls made, including failed and held ones.
    pub fn update_attempts(&self) -> usize {
        self.state.lock().attempts.updates
    }

    /// Delete calls made, including failed and held ones.
    pub fn delete_attempts(&self) -> usize {
        self.state.lock().attempts.deletes
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────

    async fn wait_for_write_gate(&self) {
        let mut held = self.writes_held.subscribe();
        while *held.borrow() {
            if held.changed().await.is_err() {
                break;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ProviderEffects
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl ProviderEffects for InMemoryProvider {
    async fn select(&self, query: SelectQuery) -> Result<Vec<Row>, ProviderError> {
        let state = &mut *self.state.lock();
        state.attempts.selects += 1;
        if take_failure(&mut state.failures.selects) {
            debug!(table = %query.table, "injected select failure");
            return Err(ProviderError::request("injected select failure"));
        }

        let mut rows: Vec<Row> = state
            .tables
            .get(&query.table)
            .map(|rows| {
                rows.values()
                    .filter(|row| query.predicate.matches_row(row))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let ordering = compare_columns(a.get(&order.column), b.get(&order.column));
                if order.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }

        if let Some(range) = query.range {
            rows = rows.into_iter().skip(range.offset).take(range.limit).collect();
        }

        Ok(rows)
    }

    async fn insert(&self, table: Table, row: Row) -> Result<Row, ProviderError> {
        {
            let state = &mut *self.state.lock();
            state.attempts.inserts += 1;
            if take_failure(&mut state.failures.inserts) {
                debug!(table = %table, "injected insert failure");
                return Err(ProviderError::request("injected insert failure"));
            }
        }
        self.wait_for_write_gate().await;

        let mut state = self.state.lock();
        let id = row_id(&row)
            .ok_or_else(|| ProviderError::request("inserted row has no id column"))?;
        state.tables.entry(table).or_default().insert(id, row.clone());

        let ts = next_event_ts(&mut state);
        let event = ChangeEvent::new(table, ChangeOp::Insert, id, row.clone(), ts);
        deliver(&mut state, &event, None);
        run_interaction_trigger(&mut state, table, &row, true);

        Ok(row)
    }

    async fn update(&self, table: Table, id: Uuid, patch: Row) -> Result<Row, ProviderError> {
        {
            let state = &mut *self.state.lock();
            state.attempts.updates += 1;
            if take_failure(&mut state.failures.updates) {
                debug!(table = %table, %id, "injected update failure");
                return Err(ProviderError::request("injected update failure"));
            }
        }
        self.wait_for_write_gate().await;

        let mut state = self.state.lock();
        let updated = {
            let row = state
                .tables
                .entry(table)
                .or_default()
                .get_mut(&id)
                .ok_or_else(|| {
                    ProviderError::request(format!("update of missing row {id} in {table}"))
                })?;
            for (column, value) in patch {
                row.insert(column, value);
            }
            row.clone()
        };

        let ts = next_event_ts(&mut state);
        let event = ChangeEvent::new(table, ChangeOp::Update, id, updated.clone(), ts);
        deliver(&mut state, &event, None);

        Ok(updated)
    }

    async fn delete(&self, table: Table, id: Uuid) -> Result<(), ProviderError> {
        {
            let state = &mut *self.state.lock();
            state.attempts.deletes += 1;
            if take_failure(&mut state.failures.deletes) {
                debug!(table = %table, %id, "injected delete failure");
                return Err(ProviderError::request("injected delete failure"));
            }
        }
        self.wait_for_write_gate().await;

        let mut state = self.state.lock();
        let removed = state
            .tables
            .entry(table)
            .or_default()
            .remove(&id)
            .ok_or_else(|| {
                ProviderError::request(format!("delete of missing row {id} in {table}"))
            })?;

        // Delete events route on the row as it looked before removal.
        let ts = next_event_ts(&mut state);
        let event = ChangeEvent::new(table, ChangeOp::Delete, id, removed.clone(), ts);
        deliver(&mut state, &event, Some(&removed));
        run_interaction_trigger(&mut state, table, &removed, false);

        Ok(())
    }

    async fn subscribe(&self, scope: Scope) -> Result<EventSubscription, ProviderError> {
        let mut state = self.state.lock();
        state.attempts.subscribes += 1;
        if take_failure(&mut state.failures.subscribes) {
            debug!(scope = %scope, "injected subscribe failure");
            return Err(ProviderError::transport("injected subscribe failure"));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        state.subscriptions.push(Subscription {
            scope: scope.clone(),
            sender,
        });
        Ok(EventSubscription::new(scope, receiver))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn take_failure(remaining: &mut u32) -> bool {
    if *remaining == 0 {
        return false;
    }
    *remaining -= 1;
    true
}

fn row_id(row: &Row) -> Option<Uuid> {
    row.get("id")
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse().ok())
}

fn next_event_ts(state: &mut ProviderState) -> Timestamp {
    state.event_seq += 1;
    Timestamp::from_millis(state.event_seq)
}

/// Sends `event` to every live subscription whose scope covers the row.
///
/// `routed` overrides the payload for matching, which delete events need
/// because their payload describes a row that no longer exists.
fn deliver(state: &mut ProviderState, event: &ChangeEvent, routed: Option<&Row>) {
    let row = routed.unwrap_or(&event.payload);
    state.subscriptions.retain(|sub| {
        if sub.scope.table != event.table || !sub.scope.predicate.matches_row(row) {
            return !sub.sender.is_closed();
        }
        sub.sender.send(event.clone()).is_ok()
    });
}

/// Mirrors the backend triggers on the interaction tables: a like or repost
/// row coming or going adjusts the referenced post and echoes the absolute
/// post row as an update event.
fn run_interaction_trigger(state: &mut ProviderState, table: Table, row: &Row, inserted: bool) {
    if table != Table::Likes && table != Table::Reposts {
        return;
    }
    let Some(post_id) = row
        .get("post_id")
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse::<Uuid>().ok())
    else {
        return;
    };

    let updated = {
        let Some(post) = state
            .tables
            .entry(Table::Posts)
            .or_default()
            .get_mut(&post_id)
        else {
            debug!(%post_id, "interaction references an unstored post; trigger skipped");
            return;
        };
        match table {
            Table::Likes => {
                let count = post.get("like_count").and_then(Value::as_u64).unwrap_or(0);
                let count = if inserted { count + 1 } else { count.saturating_sub(1) };
                post.insert("like_count".to_owned(), Value::from(count));
                post.insert("viewer_has_liked".to_owned(), Value::Bool(inserted));
            }
            Table::Reposts => {
                post.insert("viewer_has_reposted".to_owned(), Value::Bool(inserted));
            }
            _ => {}
        }
        post.clone()
    };

    let ts = next_event_ts(state);
    let event = ChangeEvent::new(Table::Posts, ChangeOp::Update, post_id, updated, ts);
    deliver(state, &event, None);
}

fn compare_columns(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        // Rows missing the sort column go last.
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            _ => match (a.as_str(), b.as_str()) {
                (Some(x), Some(y)) => x.cmp(y),
                _ => a.to_string().cmp(&b.to_string()),
            },
        },
    }
}

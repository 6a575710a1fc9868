//! Reactive transcript store.
//!
//! Insertion-ordered log of everything the session produced: submitted
//! commands (mutated in place as their sub-statements progress) and
//! standalone notices. Observers are notified only when a value actually
//! changes, so renderers can re-read lazily.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::warn;

use crate::protocol::{EngineError, Notice};
use crate::session::diff::{self, DiffError, MaterializedRows};
use crate::session::machine::{CommandOutput, HistoryId, NoticeOutput, ResultShape};

#[derive(Debug, Clone, PartialEq)]
pub enum HistoryItem {
    Command(CommandOutput),
    Notice(NoticeOutput),
}

impl HistoryItem {
    pub fn history_id(&self) -> HistoryId {
        match self {
            HistoryItem::Command(output) => output.history_id,
            HistoryItem::Notice(output) => output.history_id,
        }
    }
}

/// A command as the console renders it: streaming results collapsed through
/// the diff accumulator, everything else passed through.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializedOutput {
    pub history_id: HistoryId,
    pub command: String,
    pub notices: Vec<Notice>,
    pub error: Option<EngineError>,
    pub results: Vec<MaterializedResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaterializedResult {
    pub shape: ResultShape,
    pub notices: Vec<Notice>,
    pub error: Option<EngineError>,
    pub rows: MaterializedRows,
    pub complete_tag: Option<String>,
    pub started_at_ms: i64,
    pub finished_at_ms: Option<i64>,
}

type ChangeCallback = Arc<dyn Fn(HistoryId) + Send + Sync>;

/// Token returned by [`HistoryStore::on_changed`]; pass back to
/// [`HistoryStore::unsubscribe`] to detach the observer.
#[derive(Debug)]
pub struct Subscription {
    token: u64,
}

#[derive(Default)]
struct Inner {
    order: Vec<HistoryId>,
    items: HashMap<HistoryId, HistoryItem>,
}

pub struct HistoryStore {
    inner: RwLock<Inner>,
    subscribers: Mutex<Vec<(u64, ChangeCallback)>>,
    next_token: AtomicU64,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            subscribers: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(0),
        }
    }

    /// Append a brand-new transcript entry.
    pub fn commit(&self, item: HistoryItem) {
        let id = item.history_id();
        {
            let mut inner = self.inner.write();
            inner.order.push(id);
            inner.items.insert(id, item);
        }
        self.notify(id);
    }

    /// Replace the value at an existing id. Observers fire only when the new
    /// value structurally differs from the stored one.
    pub fn update(&self, item: HistoryItem) {
        let id = item.history_id();
        let changed = {
            let mut inner = self.inner.write();
            match inner.items.get(&id) {
                Some(existing) if *existing == item => false,
                Some(_) => {
                    inner.items.insert(id, item);
                    true
                }
                None => {
                    // A driver/store race should never lose transcript data.
                    warn!(target: "tidepool::history", %id, "update for unknown id, committing as new");
                    inner.order.push(id);
                    inner.items.insert(id, item);
                    true
                }
            }
        };
        if changed {
            self.notify(id);
        }
    }

    pub fn get(&self, id: &HistoryId) -> Option<HistoryItem> {
        self.inner.read().items.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().order.is_empty()
    }

    /// Derived read model: every entry, in insertion order.
    pub fn transcript(&self) -> Vec<HistoryItem> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.items.get(id).cloned())
            .collect()
    }

    /// Derived read model: the post-accumulator view of one command. `None`
    /// for unknown ids and for standalone notice entries.
    pub fn materialized(
        &self,
        id: &HistoryId,
    ) -> Result<Option<MaterializedOutput>, DiffError> {
        let Some(HistoryItem::Command(output)) = self.get(id) else {
            return Ok(None);
        };
        let mut results = Vec::with_capacity(output.results.len());
        for result in &output.results {
            results.push(MaterializedResult {
                shape: result.shape,
                notices: result.notices.clone(),
                error: result.error.clone(),
                rows: diff::materialize(result)?,
                complete_tag: result.complete_tag.clone(),
                started_at_ms: result.started_at_ms,
                finished_at_ms: result.finished_at_ms,
            });
        }
        Ok(Some(MaterializedOutput {
            history_id: output.history_id,
            command: output.command,
            notices: output.notices,
            error: output.error,
            results,
        }))
    }

    pub fn on_changed(&self, callback: impl Fn(HistoryId) + Send + Sync + 'static) -> Subscription {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .push((token, Arc::new(callback)));
        Subscription { token }
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.subscribers
            .lock()
            .retain(|(token, _)| *token != subscription.token);
    }

    fn notify(&self, id: HistoryId) {
        // Callbacks run outside the lock so an observer may register or
        // detach observers of its own.
        let callbacks: Vec<ChangeCallback> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback(id);
        }
    }
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

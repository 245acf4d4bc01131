//! The evidence ledger: a bounded, deduplicating, ID-addressable store of
//! investigation findings.
//!
//! One spawned task owns the state; mutations arrive as messages so that id
//! assignment and duplicate detection always see a consistent snapshot.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerItem {
    pub id: String,
    /// How the finding was obtained.
    pub source: String,
    pub finding: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerItemInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub finding: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddOrUpdateOutcome {
    pub added_ids: Vec<String>,
    pub updated_ids: Vec<String>,
    pub ignored_duplicates: u32,
    pub invalid_items: u32,
    /// Items rejected because the ledger is full: reported, never silently
    /// dropped, and not an error.
    pub rejected_capacity: u32,
}

/// Normalize an id so `e010` and `E10` address the same record.
fn normalize_id(id: &str) -> Option<u64> {
    let digits = id.strip_prefix(['e', 'E'])?;
    digits.parse().ok()
}

fn dedup_key(source: &str, finding: &str) -> (String, String) {
    (
        source.trim().to_lowercase(),
        finding.trim().to_lowercase(),
    )
}

#[derive(Debug)]
pub struct LedgerState {
    items: Vec<LedgerItem>,
    /// Monotonic for the ledger lifetime; ids are never reused.
    next_id: u64,
    max_items: usize,
}

impl LedgerState {
    pub fn new(max_items: usize) -> Self {
        LedgerState {
            items: Vec::new(),
            next_id: 1,
            max_items,
        }
    }

    pub fn items(&self) -> &[LedgerItem] {
        &self.items
    }

    /// Apply a batch of items. Idempotent: replaying an already-applied
    /// update or an ignored duplicate yields the same state and the same
    /// classification.
    pub fn add_or_update(
        &mut self,
        inputs: impl IntoIterator<Item = LedgerItemInput>,
    ) -> AddOrUpdateOutcome {
        let mut outcome = AddOrUpdateOutcome::default();

        for input in inputs {
            if input.source.trim().is_empty() && input.finding.trim().is_empty() {
                outcome.invalid_items += 1;
                continue;
            }

            if let Some(wanted) = input.id.as_deref().and_then(normalize_id) {
                if let Some(existing) = self
                    .items
                    .iter_mut()
                    .find(|item| normalize_id(&item.id) == Some(wanted))
                {
                    existing.finding = input.finding;
                    outcome.updated_ids.push(existing.id.clone());
                    continue;
                }
            }

            let key = dedup_key(&input.source, &input.finding);
            if self
                .items
                .iter()
                .any(|item| dedup_key(&item.source, &item.finding) == key)
            {
                outcome.ignored_duplicates += 1;
                continue;
            }

            if self.items.len() >= self.max_items {
                outcome.rejected_capacity += 1;
                continue;
            }

            let id = format!("E{}", self.next_id);
            self.next_id += 1;
            self.items.push(LedgerItem {
                id: id.clone(),
                source: input.source,
                finding: input.finding,
            });
            outcome.added_ids.push(id);
        }

        outcome
    }
}

enum Request {
    AddOrUpdate {
        items: Vec<LedgerItemInput>,
        reply: oneshot::Sender<AddOrUpdateOutcome>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<LedgerItem>>,
    },
}

#[derive(Clone)]
pub struct LedgerHandle {
    tx: mpsc::Sender<Request>,
}

impl LedgerHandle {
    /// Spawn the owning task on the current runtime.
    pub fn spawn(max_items: usize) -> Self {
        let (tx, mut rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut state = LedgerState::new(max_items);
            while let Some(request) = rx.recv().await {
                match request {
                    Request::AddOrUpdate { items, reply } => {
                        let _ = reply.send(state.add_or_update(items));
                    }
                    Request::Snapshot { reply } => {
                        let _ = reply.send(state.items().to_vec());
                    }
                }
            }
        });
        LedgerHandle { tx }
    }

    pub async fn add_or_update(
        &self,
        items: Vec<LedgerItemInput>,
    ) -> anyhow::Result<AddOrUpdateOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::AddOrUpdate { items, reply })
            .await
            .map_err(|_| anyhow::anyhow!("ledger task is gone"))?;
        Ok(rx.await?)
    }

    pub async fn snapshot(&self) -> anyhow::Result<Vec<LedgerItem>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Snapshot { reply })
            .await
            .map_err(|_| anyhow::anyhow!("ledger task is gone"))?;
        Ok(rx.await?)
    }
}

//! Turns a "something changed" signal into the authoritative change list.
//!
//! A pass reads the checkpoint, drains every page the provider has after it,
//! classifies and enriches what came back, then commits the new cursor with a
//! compare-and-swap.
//! The swap is the only serialization between concurrent passes.

use std::sync::Arc;

use tracing::{debug, info, warn};
use trigger_plugin::message::{ChangeRecord, Cursor, RawChange, Subscription};
use trigger_plugin::plugin::{CallContext, Provider, ProviderError};

use crate::error::EngineError;
use crate::registry::ProviderRegistry;
use crate::retry::RetryPolicy;
use crate::store::Store;

/// Upper bound on pages drained for one notification.
const MAX_PAGES: usize = 1_000;

#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// Committed `previous -> cursor`; `records` are in feed order.
    Changes {
        previous: Cursor,
        cursor: Cursor,
        records: Vec<ChangeRecord>,
        /// Raw changes that could not be classified and were dropped.
        skipped: usize,
    },
    /// The feed had nothing past the checkpoint.
    Unchanged { cursor: Cursor },
    /// The stored cursor expired; the checkpoint was reset and the window between
    /// `previous` and `baseline` is lost.
    Gap { previous: Cursor, baseline: Cursor },
    /// No checkpoint existed yet; one was created at the feed head.
    Baseline { cursor: Cursor },
    /// A concurrent pass already committed past the notified cursor.
    Covered { cursor: Cursor },
}

enum Pulled {
    Feed { records: Vec<ChangeRecord>, cursor: Option<Cursor>, skipped: usize },
    Expired,
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    registry: Arc<ProviderRegistry>,
    policy: RetryPolicy,
    conflict_retries: u32,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, registry: Arc<ProviderRegistry>, policy: RetryPolicy, conflict_retries: u32) -> Self {
        Self { store, registry, policy, conflict_retries }
    }

    /// `hinted` is the cursor a delivery claims to announce, if any. It is only used
    /// to recognise that a winning concurrent pass already covered it.
    pub async fn reconcile(
        &self,
        provider: &dyn Provider,
        ctx: &CallContext,
        subscription: &Subscription,
        hinted: Option<&Cursor>,
    ) -> Result<Reconciliation, EngineError> {
        let id = subscription.subscription_id.as_str();
        let provider_err = |e: ProviderError| EngineError::from_provider(e, id, provider.id());

        for attempt in 0..=self.conflict_retries {
            let Some(checkpoint) = self.store.read_checkpoint(id).await? else {
                let head = self
                    .policy
                    .run(id, || provider.baseline(ctx, subscription))
                    .await
                    .map_err(provider_err)?;
                let created = self.store.create_checkpoint(id, &head).await?;
                info!(subscription_id = id, cursor = %created.cursor, "baseline checkpoint created");
                return Ok(Reconciliation::Baseline { cursor: created.cursor });
            };
            let previous = checkpoint.cursor;

            if attempt > 0
                && let Some(hint) = hinted
                && previous.covers(hint)
            {
                debug!(subscription_id = id, cursor = %previous, "notification already covered");
                return Ok(Reconciliation::Covered { cursor: previous });
            }

            match self.pull(provider, ctx, subscription, &previous).await? {
                Pulled::Expired => {
                    let baseline = self
                        .policy
                        .run(id, || provider.baseline(ctx, subscription))
                        .await
                        .map_err(provider_err)?;
                    match self.store.reset(id, &previous, &baseline).await {
                        Ok(_) => {
                            warn!(
                                subscription_id = id,
                                previous = %previous,
                                baseline = %baseline,
                                "cursor expired, checkpoint reset; changes in between are lost"
                            );
                            return Ok(Reconciliation::Gap { previous, baseline });
                        }
                        Err(EngineError::CheckpointConflict(_)) => continue,
                        Err(other) => return Err(other),
                    }
                }
                Pulled::Feed { records, cursor, skipped } => {
                    let next = match cursor {
                        Some(next) if next.is_behind(&previous) => {
                            warn!(subscription_id = id, previous = %previous, reported = %next, "provider cursor went backwards, keeping checkpoint");
                            previous.clone()
                        }
                        Some(next) => next,
                        None => previous.clone(),
                    };
                    if next == previous && records.is_empty() {
                        return Ok(Reconciliation::Unchanged { cursor: previous });
                    }
                    match self.store.commit(id, &previous, &next).await {
                        Ok(_) => {
                            info!(subscription_id = id, from = %previous, to = %next, changes = records.len(), "checkpoint advanced");
                            return Ok(Reconciliation::Changes { previous, cursor: next, records, skipped });
                        }
                        Err(EngineError::CheckpointConflict(_)) => {
                            warn!(subscription_id = id, attempt, "checkpoint moved underneath this pass, discarding batch");
                        }
                        Err(other) => return Err(other),
                    }
                }
            }
        }
        Err(EngineError::CheckpointConflict(id.to_string()))
    }

    /// Drains all pages after `cursor` before anything is committed.
    async fn pull(
        &self,
        provider: &dyn Provider,
        ctx: &CallContext,
        subscription: &Subscription,
        cursor: &Cursor,
    ) -> Result<Pulled, EngineError> {
        let id = subscription.subscription_id.as_str();
        let mut raw: Vec<RawChange> = Vec::new();
        let mut page_token: Option<String> = None;
        let mut final_cursor = None;
        let mut drained = false;

        for _ in 0..MAX_PAGES {
            let page = self
                .policy
                .run(id, || provider.list_changes(ctx, subscription, cursor, page_token.as_deref()))
                .await;
            let page = match page {
                Ok(page) => page,
                Err(ProviderError::CursorExpired(_)) => return Ok(Pulled::Expired),
                Err(e) => return Err(EngineError::from_provider(e, id, provider.id())),
            };
            raw.extend(page.changes);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => {
                    final_cursor = page.cursor;
                    drained = true;
                    break;
                }
            }
        }
        if !drained {
            return Err(EngineError::ProviderRejected(format!("change feed for {id} exceeded {MAX_PAGES} pages")));
        }

        let mut records = Vec::with_capacity(raw.len());
        let mut skipped = 0;
        for change in &raw {
            match self.registry.classify(provider.id(), change) {
                Ok(record) => records.push(record),
                Err(e) => {
                    skipped += 1;
                    warn!(subscription_id = id, kind = %change.kind, error = %e, "dropping unclassifiable change");
                }
            }
        }
        for record in records.iter_mut() {
            let enriched = {
                let listed: &ChangeRecord = record;
                self.policy.run(id, || provider.enrich(ctx, subscription, listed)).await
            };
            match enriched {
                Ok(Some(payload)) => record.payload = payload,
                Ok(None) => {}
                Err(e) => {
                    warn!(subscription_id = id, change_id = %record.change_id, error = %e, "enrichment failed, keeping the change as listed");
                }
            }
        }
        Ok(Pulled::Feed { records, cursor: final_cursor, skipped })
    }
}

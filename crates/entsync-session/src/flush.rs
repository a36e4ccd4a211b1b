//! Pre-commit traversal and implicit flush.
//!
//! The traversal classifies every registered instance as created, updated or
//! deleted, running the matching entity listener hook. Listeners may register
//! further instances or modify ones already looked at, so the traversal runs
//! to a fixed point:
//!
//! - instances not yet processed are classified in rounds until a round finds
//!   nothing new;
//! - instances skipped as unchanged get a second chance, and any
//!   classification there starts another round.
//!
//! Every round counts against `max_flush_iterations`.

use crate::coordinator::CommitCoordinator;
use crate::events::{ChangeType, EntityChangedEventInfo, EventBuffer};
use crate::transaction::TransactionContext;
use entsync_core::{EntityRef, Error, IdentitySet, InstanceId, Result};
use std::collections::HashSet;
use std::sync::Arc;

/// Bookkeeping shared by the traversals of one flush or commit pass.
#[derive(Debug, Default)]
pub(crate) struct TraversalState {
    processed: HashSet<InstanceId>,
    skipped: IdentitySet,
    rounds: usize,
}

/// What an implicit flush classified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Traversal rounds needed to reach the fixed point.
    pub rounds: usize,
}

impl FlushSummary {
    pub fn total(&self) -> usize {
        self.created + self.updated + self.deleted
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl CommitCoordinator {
    /// Write pending changes without ending the transaction.
    ///
    /// Classified events wait in the transaction's pending buffer until the
    /// commit publishes them. A flush requested while a traversal is running
    /// does nothing; the running traversal picks the new work up.
    #[tracing::instrument(level = "debug", skip_all, fields(transaction = tx.id()))]
    pub fn flush(&self, tx: &mut TransactionContext) -> Result<FlushSummary> {
        tx.ensure_active()?;
        if tx.is_flushing() {
            tracing::trace!("Flush requested during traversal, skipping");
            return Ok(FlushSummary::default());
        }
        let markers = tx.holder().map(crate::registry::ResourceHolder::markers);
        tx.flushing = true;
        let result = self.flush_inner(tx);
        tx.flushing = false;
        if result.is_err() {
            if let (Some(markers), Some(holder)) = (markers, tx.holder.as_mut()) {
                holder.restore_markers(markers);
            }
        }
        result
    }

    fn flush_inner(&self, tx: &mut TransactionContext) -> Result<FlushSummary> {
        let mut state = TraversalState::default();
        let classified = self.traverse(tx, &mut state)?;
        self.check_read_only(tx, &classified)?;

        for entity in tx.all_instances() {
            self.notify(tx, &entity, |l, s, e| l.on_flush(s, e))?;
        }
        let events = self.build_events(&classified)?;
        if !classified.is_empty() {
            tx.mark_uncommitted_writes();
        }
        for session in tx.sessions().to_vec() {
            session.flush().map_err(|e| self.map_session_error(e))?;
            self.attach_loaded(tx, &session)?;
        }

        let mut summary = FlushSummary {
            rounds: state.rounds,
            ..FlushSummary::default()
        };
        for (entity, change) in &classified {
            match change {
                ChangeType::Created => {
                    entity.mark_persisted();
                    summary.created += 1;
                }
                ChangeType::Updated => summary.updated += 1,
                ChangeType::Deleted => summary.deleted += 1,
            }
        }
        for entity in tx.all_instances() {
            entity.reset_ledger();
        }
        tx.pending_events.merge_all(events);
        tracing::debug!(
            created = summary.created,
            updated = summary.updated,
            deleted = summary.deleted,
            rounds = summary.rounds,
            pending = tx.pending_events.len(),
            "Flush complete"
        );
        Ok(summary)
    }

    /// Are there changes an implicit flush would write?
    pub fn has_pending_changes(&self, tx: &TransactionContext) -> Result<bool> {
        let Some(holder) = tx.holder() else {
            return Ok(false);
        };
        for entity in holder.all_instances() {
            let id = entity.id();
            if entity.is_new() {
                if !holder.is_saved(id) {
                    return Ok(true);
                }
                continue;
            }
            if self.tracker().is_deletion(&entity) {
                if !holder.is_removal_classified(id) {
                    return Ok(true);
                }
                continue;
            }
            if self.tracker().has_changes(&entity)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Classify registered instances until a fixed point is reached.
    pub(crate) fn traverse(
        &self,
        tx: &mut TransactionContext,
        state: &mut TraversalState,
    ) -> Result<Vec<(EntityRef, ChangeType)>> {
        let mut classified = Vec::new();
        loop {
            loop {
                let batch: Vec<EntityRef> = tx
                    .all_instances()
                    .into_iter()
                    .filter(|e| !state.processed.contains(&e.id()))
                    .collect();
                if batch.is_empty() {
                    break;
                }
                self.next_round(state)?;
                tracing::trace!(round = state.rounds, count = batch.len(), "Traversal round");
                for entity in batch {
                    state.processed.insert(entity.id());
                    match self.classify(tx, &entity)? {
                        Some(change) => classified.push((entity, change)),
                        None => {
                            state.skipped.insert(entity);
                        }
                    }
                }
            }

            let retry = std::mem::take(&mut state.skipped);
            let mut reclassified = false;
            for entity in &retry {
                if !tx.is_registered(entity) {
                    continue;
                }
                match self.classify(tx, entity)? {
                    Some(change) => {
                        tracing::trace!(
                            entity = entity.entity_name(),
                            instance = %entity.id(),
                            ?change,
                            "Classified on second chance"
                        );
                        classified.push((Arc::clone(entity), change));
                        reclassified = true;
                    }
                    None => {
                        state.skipped.insert(Arc::clone(entity));
                    }
                }
            }
            let unprocessed = tx
                .all_instances()
                .iter()
                .any(|e| !state.processed.contains(&e.id()));
            if !reclassified && !unprocessed {
                break;
            }
            self.next_round(state)?;
        }
        Ok(classified)
    }

    fn next_round(&self, state: &mut TraversalState) -> Result<()> {
        state.rounds += 1;
        let max = self.config().max_flush_iterations;
        if state.rounds > max {
            tracing::warn!(iterations = max, "Traversal did not reach a fixed point");
            return Err(Error::FlushLimitExceeded { iterations: max });
        }
        Ok(())
    }

    /// Classify one instance and run its listener hook.
    fn classify(
        &self,
        tx: &mut TransactionContext,
        entity: &EntityRef,
    ) -> Result<Option<ChangeType>> {
        let id = entity.id();
        if entity.is_new() {
            if tx.holder().is_some_and(|h| h.is_saved(id)) {
                return Ok(None);
            }
            tx.holder_mut()?.mark_saved(entity);
            self.notify(tx, entity, |l, s, e| l.before_insert(s, e))?;
            return Ok(Some(ChangeType::Created));
        }
        if self.tracker().is_deletion(entity) {
            if tx.holder().is_some_and(|h| h.is_removal_classified(id)) {
                return Ok(None);
            }
            tx.holder_mut()?.mark_removal_classified(entity);
            self.notify(tx, entity, |l, s, e| l.before_delete(s, e))?;
            if !entity.is_removed() {
                self.apply_delete_policies(tx, entity)?;
            }
            return Ok(Some(ChangeType::Deleted));
        }
        if self.tracker().has_changes(entity)? {
            self.notify(tx, entity, |l, s, e| l.before_update(s, e))?;
            return Ok(Some(ChangeType::Updated));
        }
        Ok(None)
    }

    pub(crate) fn check_read_only(
        &self,
        tx: &TransactionContext,
        classified: &[(EntityRef, ChangeType)],
    ) -> Result<()> {
        if !tx.is_read_only() {
            return Ok(());
        }
        match classified.first() {
            Some((entity, change)) => {
                tracing::warn!(
                    transaction = tx.id(),
                    entity = entity.entity_name(),
                    ?change,
                    "Change detected in read-only transaction"
                );
                Err(Error::ReadOnlyViolation {
                    entity: entity.entity_name().to_string(),
                })
            }
            None => Ok(()),
        }
    }

    /// Turn classifications into events, computing changes now so that
    /// modifications made by later listeners are included.
    pub(crate) fn build_events(&self, classified: &[(EntityRef, ChangeType)]) -> Result<EventBuffer> {
        let mut events = EventBuffer::new();
        for (entity, change) in classified {
            let event = match change {
                ChangeType::Created => EntityChangedEventInfo::created(Arc::clone(entity)),
                ChangeType::Updated => {
                    let changes = self.tracker().changes_since(entity)?;
                    if !changes.has_changes() {
                        continue;
                    }
                    EntityChangedEventInfo::updated(Arc::clone(entity), changes)
                }
                ChangeType::Deleted => EntityChangedEventInfo::deleted(
                    Arc::clone(entity),
                    self.tracker().deletion_changes(entity)?,
                ),
            };
            events.push(event);
        }
        Ok(events)
    }
}

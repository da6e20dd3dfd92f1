//! Apply path shared by the push handler and the client's pull.
//!
//! Each incoming record is decided and written in its own transaction, so a
//! bad record is rejected alone and a flagged conflict is stored atomically
//! with both sides of it.

use chrono::{DateTime, Utc};
use clubsync_core::conflict::{self, ConflictFlag, Decision, SkipReason};
use clubsync_core::{
    AuthorityPolicy, CheckIn, CheckoutConflictStatus, EntityBatch, EntityCounts, EntityKind,
    EquipmentCheckout, Member, PracticeSession, PushResponse, ScanEvent, SyncConflict,
    SyncEntity,
};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::db::{
    device_type_in, lookup, record_conflict, settle_by_peer, write_incoming, DbError,
};

/// Totals for one applied batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    pub accepted: EntityCounts,
    pub skipped: usize,
    pub rejected: usize,
    pub rejected_ids: Vec<Uuid>,
    pub conflicts: Vec<SyncConflict>,
}

impl ApplyReport {
    fn record(&mut self, kind: EntityKind, id: Uuid, result: Result<Outcome, DbError>) {
        match result {
            Ok(Outcome::Accepted) => self.accepted.add(kind, 1),
            Ok(Outcome::Skipped(reason)) => {
                tracing::debug!(%kind, %id, ?reason, "Skipped incoming record");
                self.skipped += 1;
            }
            Ok(Outcome::Conflicted(conflict)) => {
                tracing::warn!(
                    %kind,
                    local = %conflict.local_entity_id,
                    remote = %conflict.remote_entity_id,
                    "Conflict detected"
                );
                self.conflicts.push(conflict);
            }
            Err(e) => {
                tracing::warn!(%kind, %id, error = %e, "Rejected incoming record");
                self.rejected += 1;
                self.rejected_ids.push(id);
            }
        }
    }
}

impl From<ApplyReport> for PushResponse {
    fn from(report: ApplyReport) -> Self {
        PushResponse {
            accepted_counts: report.accepted,
            skipped: report.skipped,
            rejected: report.rejected,
            rejected_ids: report.rejected_ids,
            conflicts: report.conflicts,
        }
    }
}

#[derive(Debug)]
enum Outcome {
    Accepted,
    Skipped(SkipReason),
    Conflicted(SyncConflict),
}

pub struct Applier {
    pool: SqlitePool,
    policy: AuthorityPolicy,
}

impl Applier {
    pub fn new(pool: SqlitePool, policy: AuthorityPolicy) -> Self {
        Self { pool, policy }
    }

    /// Applies every record in `batch`, received from `remote_device_id`,
    /// in kind order. Re-applying the same batch changes nothing.
    pub async fn apply_batch(&self, batch: &EntityBatch, remote_device_id: Uuid) -> ApplyReport {
        let now = Utc::now();
        let mut report = ApplyReport::default();

        for m in &batch.members {
            report.record(EntityKind::Member, m.sync.id, self.apply_member(m, now).await);
        }
        for r in &batch.new_member_registrations {
            report.record(
                EntityKind::NewMemberRegistration,
                r.sync.id,
                self.apply_lww(r, now).await,
            );
        }
        for i in &batch.equipment_items {
            report.record(EntityKind::EquipmentItem, i.sync.id, self.apply_lww(i, now).await);
        }
        for c in &batch.check_ins {
            report.record(EntityKind::CheckIn, c.sync.id, self.apply_check_in(c, now).await);
        }
        for s in &batch.practice_sessions {
            report.record(
                EntityKind::PracticeSession,
                s.sync.id,
                self.apply_practice_session(s, now).await,
            );
        }
        for s in &batch.scan_events {
            report.record(EntityKind::ScanEvent, s.sync.id, self.apply_scan_event(s, now).await);
        }
        for c in &batch.equipment_checkouts {
            report.record(
                EntityKind::EquipmentCheckout,
                c.sync.id,
                self.apply_checkout(c, remote_device_id, now).await,
            );
        }

        report
    }

    /// Stores conflicts a peer reported for records this node pushed, and
    /// marks the pushed checkouts pending. Returns the conflicts as stored
    /// here, which keep an earlier local id when the pair was already known.
    pub async fn record_remote_conflicts(
        &self,
        conflicts: &[SyncConflict],
        peer_device_id: Uuid,
    ) -> Result<Vec<SyncConflict>, DbError> {
        let mut stored = Vec::with_capacity(conflicts.len());

        for reported in conflicts {
            let conflict = reported.mirrored(peer_device_id);
            let mut tx = self.pool.begin().await?;

            if conflict.entity_kind == EntityKind::EquipmentCheckout {
                mark_pending(&mut tx, conflict.local_entity_id).await?;
            }
            stored.push(record_conflict(&mut tx, &conflict).await?);
            tx.commit().await?;
        }

        Ok(stored)
    }

    async fn apply_member(
        &self,
        incoming: &Member,
        now: DateTime<Utc>,
    ) -> Result<Outcome, DbError> {
        incoming.sync.validate()?;
        let mut tx = self.pool.begin().await?;

        let local: Option<Member> = lookup::by_id(&mut tx, incoming.sync.id).await?;
        let decision = match &local {
            None => Decision::Accept,
            Some(local) => {
                let local_type = device_type_in(&mut tx, local.sync.device_id).await?;
                let incoming_type = device_type_in(&mut tx, incoming.sync.device_id).await?;
                conflict::decide_member(
                    Some((&local.sync, local_type)),
                    &incoming.sync,
                    incoming_type,
                    &self.policy,
                )
            }
        };

        let outcome = finish(&mut tx, incoming, local.as_ref(), decision, None, now).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn apply_lww<T: SyncEntity>(
        &self,
        incoming: &T,
        now: DateTime<Utc>,
    ) -> Result<Outcome, DbError> {
        incoming.envelope().validate()?;
        let mut tx = self.pool.begin().await?;

        let local: Option<T> = lookup::by_id(&mut tx, incoming.id()).await?;
        let decision = conflict::decide_last_write_wins(
            local.as_ref().map(|l| l.envelope()),
            incoming.envelope(),
        );

        let outcome = finish(&mut tx, incoming, local.as_ref(), decision, None, now).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn apply_check_in(
        &self,
        incoming: &CheckIn,
        now: DateTime<Utc>,
    ) -> Result<Outcome, DbError> {
        incoming.sync.validate()?;
        let mut tx = self.pool.begin().await?;

        let by_id: Option<CheckIn> = lookup::by_id(&mut tx, incoming.sync.id).await?;
        let same_day =
            lookup::check_in_for_day(&mut tx, incoming.member_id, incoming.local_date).await?;
        let decision = conflict::decide_check_in(incoming, by_id.as_ref(), same_day.as_ref());

        let outcome = finish(&mut tx, incoming, by_id.as_ref(), decision, None, now).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn apply_practice_session(
        &self,
        incoming: &PracticeSession,
        now: DateTime<Utc>,
    ) -> Result<Outcome, DbError> {
        incoming.sync.validate()?;
        let mut tx = self.pool.begin().await?;

        let by_id: Option<PracticeSession> = lookup::by_id(&mut tx, incoming.sync.id).await?;
        let same_day =
            lookup::practice_sessions_for_day(&mut tx, incoming.member_id, incoming.local_date)
                .await?;
        let decision = conflict::decide_practice_session(incoming, by_id.as_ref(), &same_day);

        let outcome = finish(&mut tx, incoming, by_id.as_ref(), decision, None, now).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn apply_scan_event(
        &self,
        incoming: &ScanEvent,
        now: DateTime<Utc>,
    ) -> Result<Outcome, DbError> {
        incoming.sync.validate()?;
        let mut tx = self.pool.begin().await?;

        let by_id: Option<ScanEvent> = lookup::by_id(&mut tx, incoming.sync.id).await?;
        let decision = conflict::decide_scan_event(incoming, by_id.as_ref());

        let outcome = finish(&mut tx, incoming, by_id.as_ref(), decision, None, now).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn apply_checkout(
        &self,
        incoming: &EquipmentCheckout,
        remote_device_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Outcome, DbError> {
        incoming.sync.validate()?;
        let mut tx = self.pool.begin().await?;

        let by_id: Option<EquipmentCheckout> = lookup::by_id(&mut tx, incoming.sync.id).await?;
        let open = lookup::open_checkouts_for_item(&mut tx, incoming.equipment_id).await?;
        let decision = conflict::decide_checkout(incoming, by_id.as_ref(), &open);

        let outcome = match decision {
            Decision::Flag(flag) => {
                // Both sides wait for an operator.
                mark_pending(&mut tx, flag.local_entity_id).await?;
                let mut pending = incoming.clone();
                pending.conflict_status = CheckoutConflictStatus::Pending;
                finish(
                    &mut tx,
                    &pending,
                    by_id.as_ref(),
                    Decision::Flag(flag),
                    Some(remote_device_id),
                    now,
                )
                .await?
            }
            decision => {
                let outcome = finish(&mut tx, incoming, by_id.as_ref(), decision, None, now).await?;
                if matches!(outcome, Outcome::Accepted)
                    && incoming.conflict_status == CheckoutConflictStatus::Resolved
                {
                    let settled = settle_by_peer(&mut tx, incoming.sync.id, now).await?;
                    if settled > 0 {
                        tracing::info!(
                            checkout_id = %incoming.sync.id,
                            "Conflict resolved by peer"
                        );
                    }
                }
                outcome
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }
}

/// Carries out a decision. Accepted records keep the higher of the two
/// versions so `syncVersion` never decreases locally.
async fn finish<T: SyncEntity>(
    conn: &mut SqliteConnection,
    incoming: &T,
    local: Option<&T>,
    decision: Decision,
    remote_device_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> Result<Outcome, DbError> {
    match decision {
        Decision::Accept => {
            let mut stored = incoming.clone();
            if let Some(local) = local {
                let env = stored.envelope_mut();
                env.sync_version = env.sync_version.max(local.envelope().sync_version);
            }
            write_incoming(conn, &stored, now).await?;
            Ok(Outcome::Accepted)
        }
        Decision::Skip(reason) => Ok(Outcome::Skipped(reason)),
        Decision::Flag(ConflictFlag {
            local_entity_id,
            remote_entity_id,
            description,
        }) => {
            write_incoming(&mut *conn, incoming, now).await?;
            let conflict = SyncConflict::new(
                T::KIND,
                local_entity_id,
                remote_entity_id,
                remote_device_id.unwrap_or(incoming.envelope().device_id),
                description,
            );
            let stored = record_conflict(&mut *conn, &conflict).await?;
            Ok(Outcome::Conflicted(stored))
        }
    }
}

/// Flags a stored checkout as waiting on a conflict. The envelope is left
/// alone: every side of a conflict marks its own copy.
async fn mark_pending(conn: &mut SqliteConnection, checkout_id: Uuid) -> Result<(), DbError> {
    if let Some(mut checkout) = lookup::by_id::<EquipmentCheckout>(&mut *conn, checkout_id).await? {
        checkout.conflict_status = CheckoutConflictStatus::Pending;
        let data = serde_json::to_string(&checkout)?;
        sqlx::query("UPDATE entities SET data = ? WHERE kind = ? AND id = ?")
            .bind(data)
            .bind(EntityKind::EquipmentCheckout.as_str())
            .bind(checkout_id.to_string())
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

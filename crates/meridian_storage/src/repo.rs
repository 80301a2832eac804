#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use meridian_kernel_contracts::audit::{AuditEvent, AuditEventId, AuditEventInput};
use meridian_kernel_contracts::effects::WriteEffects;
use meridian_kernel_contracts::fact::{FactId, FactRecord, FactWriteInput};
use meridian_kernel_contracts::mapping::{MappingId, MappingRecord, MappingWriteInput};
use meridian_kernel_contracts::rollup::RollupRecord;
use meridian_kernel_contracts::tenant::{EntityId, EntityRecord, EntityStatus, TenantId};
use meridian_kernel_contracts::{DayStamp, MonotonicTimeNs};

use crate::store::{
    CollapseOutcome, CoreStore, FactAppendOutcome, MappingWriteOutcome, OrderConfirmOutcome,
    RebuildLease, StorageError,
};

/// Typed repository interface for entity persistence and the activation gate.
pub trait EntityRepo {
    fn insert_entity_row(&mut self, record: EntityRecord) -> Result<(), StorageError>;
    fn entity_row(&self, tenant_id: &TenantId, entity_id: &EntityId) -> Option<&EntityRecord>;
    fn entity_rows_for_tenant(&self, tenant_id: &TenantId) -> Vec<&EntityRecord>;
    fn entity_set_status_commit_row(
        &mut self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        status: EntityStatus,
        now: MonotonicTimeNs,
    ) -> Result<EntityRecord, StorageError>;
    fn entity_activate_commit_row(
        &mut self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        now: MonotonicTimeNs,
    ) -> Result<EntityRecord, StorageError>;
    fn entity_flag_recompute_commit_row(
        &mut self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        now: MonotonicTimeNs,
    ) -> Result<bool, StorageError>;
}

/// Typed repository interface for the append-only fact ledger.
pub trait FactLedgerRepo {
    fn fact_append_commit_row(
        &mut self,
        input: FactWriteInput,
        effects: WriteEffects,
        now: MonotonicTimeNs,
    ) -> Result<FactAppendOutcome, StorageError>;
    fn order_confirm_commit_row(
        &mut self,
        fact_id: FactId,
        ai_confirmed: bool,
        effects: WriteEffects,
        now: MonotonicTimeNs,
    ) -> Result<OrderConfirmOutcome, StorageError>;
    fn fact_row(&self, fact_id: FactId) -> Option<&FactRecord>;
    fn fact_rows(&self) -> &[FactRecord];
    fn fact_rows_for_tenant(&self, tenant_id: &TenantId) -> Vec<&FactRecord>;
}

/// Typed repository interface for mapping persistence and its repairs.
pub trait MappingRepo {
    fn mapping_write_commit_row(
        &mut self,
        input: MappingWriteInput,
        effects: WriteEffects,
        now: MonotonicTimeNs,
    ) -> Result<MappingWriteOutcome, StorageError>;
    fn mapping_row(&self, mapping_id: &MappingId) -> Option<&MappingRecord>;
    fn mapping_rows_for_entity(
        &self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
    ) -> Vec<&MappingRecord>;
    fn enabled_mapping_count(&self, tenant_id: &TenantId, entity_id: &EntityId) -> usize;
    fn collapse_to_one_enabled_commit_row(
        &mut self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        now: MonotonicTimeNs,
    ) -> Result<CollapseOutcome, StorageError>;
    fn ensure_mapping_commit_row(
        &mut self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        mapping_id: MappingId,
        now: MonotonicTimeNs,
    ) -> Result<Option<MappingRecord>, StorageError>;
}

/// Typed repository interface for rollup rows and lease-guarded rebuilds.
pub trait RollupRepo {
    fn rollup_row(
        &self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        day: DayStamp,
    ) -> Option<&RollupRecord>;
    fn rollup_rows(&self) -> &BTreeMap<(TenantId, EntityId, DayStamp), RollupRecord>;
    fn rollup_rows_for_tenant(&self, tenant_id: &TenantId) -> Vec<&RollupRecord>;
    fn rebuild_lease_acquire(
        &mut self,
        tenant_id: &TenantId,
        from_day: DayStamp,
        to_day: DayStamp,
    ) -> Result<RebuildLease, StorageError>;
    fn rebuild_lease_release(&mut self, lease: &RebuildLease);
    fn rebuild_rollup_rows(&mut self, lease: &RebuildLease) -> Result<u64, StorageError>;
}

/// Typed repository interface for the append-only audit ledger.
pub trait AuditRepo {
    fn append_audit_row(&mut self, input: AuditEventInput) -> Result<AuditEventId, StorageError>;
    fn audit_rows(&self) -> &[AuditEvent];
    fn audit_rows_by_tenant(&self, tenant_id: &TenantId) -> Vec<&AuditEvent>;
}

impl EntityRepo for CoreStore {
    fn insert_entity_row(&mut self, record: EntityRecord) -> Result<(), StorageError> {
        self.insert_entity_row(record)
    }

    fn entity_row(&self, tenant_id: &TenantId, entity_id: &EntityId) -> Option<&EntityRecord> {
        self.entity_row(tenant_id, entity_id)
    }

    fn entity_rows_for_tenant(&self, tenant_id: &TenantId) -> Vec<&EntityRecord> {
        self.entity_rows_for_tenant(tenant_id)
    }

    fn entity_set_status_commit_row(
        &mut self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        status: EntityStatus,
        now: MonotonicTimeNs,
    ) -> Result<EntityRecord, StorageError> {
        self.entity_set_status_commit_row(tenant_id, entity_id, status, now)
    }

    fn entity_activate_commit_row(
        &mut self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        now: MonotonicTimeNs,
    ) -> Result<EntityRecord, StorageError> {
        self.entity_activate_commit_row(tenant_id, entity_id, now)
    }

    fn entity_flag_recompute_commit_row(
        &mut self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        now: MonotonicTimeNs,
    ) -> Result<bool, StorageError> {
        self.entity_flag_recompute_commit_row(tenant_id, entity_id, now)
    }
}

impl FactLedgerRepo for CoreStore {
    fn fact_append_commit_row(
        &mut self,
        input: FactWriteInput,
        effects: WriteEffects,
        now: MonotonicTimeNs,
    ) -> Result<FactAppendOutcome, StorageError> {
        self.fact_append_commit_row(input, effects, now)
    }

    fn order_confirm_commit_row(
        &mut self,
        fact_id: FactId,
        ai_confirmed: bool,
        effects: WriteEffects,
        now: MonotonicTimeNs,
    ) -> Result<OrderConfirmOutcome, StorageError> {
        self.order_confirm_commit_row(fact_id, ai_confirmed, effects, now)
    }

    fn fact_row(&self, fact_id: FactId) -> Option<&FactRecord> {
        self.fact_row(fact_id)
    }

    fn fact_rows(&self) -> &[FactRecord] {
        self.fact_rows()
    }

    fn fact_rows_for_tenant(&self, tenant_id: &TenantId) -> Vec<&FactRecord> {
        self.fact_rows_for_tenant(tenant_id)
    }
}

impl MappingRepo for CoreStore {
    fn mapping_write_commit_row(
        &mut self,
        input: MappingWriteInput,
        effects: WriteEffects,
        now: MonotonicTimeNs,
    ) -> Result<MappingWriteOutcome, StorageError> {
        self.mapping_write_commit_row(input, effects, now)
    }

    fn mapping_row(&self, mapping_id: &MappingId) -> Option<&MappingRecord> {
        self.mapping_row(mapping_id)
    }

    fn mapping_rows_for_entity(
        &self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
    ) -> Vec<&MappingRecord> {
        self.mapping_rows_for_entity(tenant_id, entity_id)
    }

    fn enabled_mapping_count(&self, tenant_id: &TenantId, entity_id: &EntityId) -> usize {
        self.enabled_mapping_count(tenant_id, entity_id)
    }

    fn collapse_to_one_enabled_commit_row(
        &mut self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        now: MonotonicTimeNs,
    ) -> Result<CollapseOutcome, StorageError> {
        self.collapse_to_one_enabled_commit_row(tenant_id, entity_id, now)
    }

    fn ensure_mapping_commit_row(
        &mut self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        mapping_id: MappingId,
        now: MonotonicTimeNs,
    ) -> Result<Option<MappingRecord>, StorageError> {
        self.ensure_mapping_commit_row(tenant_id, entity_id, mapping_id, now)
    }
}

impl RollupRepo for CoreStore {
    fn rollup_row(
        &self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        day: DayStamp,
    ) -> Option<&RollupRecord> {
        self.rollup_row(tenant_id, entity_id, day)
    }

    fn rollup_rows(&self) -> &BTreeMap<(TenantId, EntityId, DayStamp), RollupRecord> {
        self.rollup_rows()
    }

    fn rollup_rows_for_tenant(&self, tenant_id: &TenantId) -> Vec<&RollupRecord> {
        self.rollup_rows_for_tenant(tenant_id)
    }

    fn rebuild_lease_acquire(
        &mut self,
        tenant_id: &TenantId,
        from_day: DayStamp,
        to_day: DayStamp,
    ) -> Result<RebuildLease, StorageError> {
        self.rebuild_lease_acquire(tenant_id, from_day, to_day)
    }

    fn rebuild_lease_release(&mut self, lease: &RebuildLease) {
        self.rebuild_lease_release(lease)
    }

    fn rebuild_rollup_rows(&mut self, lease: &RebuildLease) -> Result<u64, StorageError> {
        self.rebuild_rollup_rows(lease)
    }
}

impl AuditRepo for CoreStore {
    fn append_audit_row(&mut self, input: AuditEventInput) -> Result<AuditEventId, StorageError> {
        self.append_audit_event(input)
    }

    fn audit_rows(&self) -> &[AuditEvent] {
        self.audit_events()
    }

    fn audit_rows_by_tenant(&self, tenant_id: &TenantId) -> Vec<&AuditEvent> {
        self.audit_events_by_tenant(tenant_id)
    }
}

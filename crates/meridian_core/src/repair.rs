#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use meridian_kernel_contracts::audit::{
    AuditEventInput, AuditEventType, AuditPayloadMin, AuditSeverity, CorrelationId, PayloadKey,
    PayloadValue,
};
use meridian_kernel_contracts::mapping::{MappingId, MappingRecord};
use meridian_kernel_contracts::tenant::{EntityId, TenantId};
use meridian_kernel_contracts::{MonotonicTimeNs, ReasonCodeId};
use meridian_storage::store::{CollapseOutcome, CoreStore, StorageError};

pub mod reason_codes {
    use meridian_kernel_contracts::ReasonCodeId;

    // Repair reason-code namespace. Values are placeholders until global registry lock.
    pub const REPAIR_MAPPING_COLLAPSED: ReasonCodeId = ReasonCodeId(0x5250_0001);
    pub const REPAIR_MAPPING_BACKFILLED: ReasonCodeId = ReasonCodeId(0x5250_0002);
}

/// Operator repairs for mapping-table states the checked write path can never
/// produce: multiple enabled rows left behind by snapshot imports, and
/// entities that predate the mapping table entirely. Every repair recomputes
/// the denormalized flag and leaves audit evidence.
#[derive(Debug, Default, Clone)]
pub struct RepairRuntime;

impl RepairRuntime {
    pub fn new() -> Self {
        Self
    }

    /// Disable all but the deterministic survivor among an entity's enabled
    /// mappings. No-op (and no audit) when the invariant already holds.
    pub fn collapse_to_one_enabled(
        &self,
        store: &mut CoreStore,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        correlation_id: CorrelationId,
        now: MonotonicTimeNs,
    ) -> Result<CollapseOutcome, StorageError> {
        let outcome = store.collapse_to_one_enabled_commit_row(tenant_id, entity_id, now)?;
        if outcome.disabled.is_empty() {
            return Ok(outcome);
        }

        store.entity_flag_recompute_commit_row(tenant_id, entity_id, now)?;
        let survivor = outcome
            .survivor
            .as_ref()
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "none".to_string());
        self.audit(
            store,
            tenant_id,
            entity_id,
            AuditEventType::MappingCollapsed,
            reason_codes::REPAIR_MAPPING_COLLAPSED,
            AuditSeverity::Warn,
            correlation_id,
            now,
            &[
                ("survivor", survivor),
                ("disabled_count", outcome.disabled.len().to_string()),
            ],
        )?;
        Ok(outcome)
    }

    /// Backfill a single enabled mapping from the entity's legacy activation
    /// url when the entity has no mapping rows at all. Returns the created
    /// row, or `None` when there was nothing to backfill.
    pub fn ensure_mapping_exists(
        &self,
        store: &mut CoreStore,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        mapping_id: MappingId,
        correlation_id: CorrelationId,
        now: MonotonicTimeNs,
    ) -> Result<Option<MappingRecord>, StorageError> {
        let created = store.ensure_mapping_commit_row(tenant_id, entity_id, mapping_id, now)?;
        let Some(record) = created else {
            return Ok(None);
        };

        store.entity_flag_recompute_commit_row(tenant_id, entity_id, now)?;
        self.audit(
            store,
            tenant_id,
            entity_id,
            AuditEventType::MappingBackfilled,
            reason_codes::REPAIR_MAPPING_BACKFILLED,
            AuditSeverity::Info,
            correlation_id,
            now,
            &[("mapping_id", record.mapping_id.as_str().to_string())],
        )?;
        Ok(Some(record))
    }

    #[allow(clippy::too_many_arguments)]
    fn audit(
        &self,
        store: &mut CoreStore,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        event_type: AuditEventType,
        reason_code: ReasonCodeId,
        severity: AuditSeverity,
        correlation_id: CorrelationId,
        now: MonotonicTimeNs,
        detail_entries: &[(&'static str, String)],
    ) -> Result<(), StorageError> {
        let mut entries: BTreeMap<PayloadKey, PayloadValue> = BTreeMap::new();
        for (k, v) in detail_entries {
            entries.insert(
                PayloadKey::new(*k).map_err(StorageError::ContractViolation)?,
                PayloadValue::new(v.as_str()).map_err(StorageError::ContractViolation)?,
            );
        }
        let payload_min = AuditPayloadMin::v1(entries).map_err(StorageError::ContractViolation)?;
        store.append_audit_event(
            AuditEventInput::v1(
                now,
                Some(tenant_id.clone()),
                Some(entity_id.clone()),
                event_type,
                reason_code,
                severity,
                Some(correlation_id),
                payload_min,
                None,
            )
            .map_err(StorageError::ContractViolation)?,
        )?;
        Ok(())
    }
}

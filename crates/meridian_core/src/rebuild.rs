#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use meridian_engines::rollup::reason_codes::ROLLUP_REBUILT_FROM_LEDGER;
use meridian_kernel_contracts::audit::{
    AuditEventInput, AuditEventType, AuditPayloadMin, AuditSeverity, CorrelationId, PayloadKey,
    PayloadValue,
};
use meridian_kernel_contracts::tenant::TenantId;
use meridian_kernel_contracts::{DayStamp, MonotonicTimeNs};
use meridian_storage::store::{CoreStore, StorageError};

/// Offline recomputation of a tenant's daily rollups from the fact ledger.
///
/// Each run acquires the tenant/day-range rebuild lease first; the store
/// refuses overlapping leases and refuses incremental writes into the leased
/// range, so a rebuild and the incremental path can never interleave on the
/// same rows. A `RebuildConflict` from acquisition is retryable by the caller.
#[derive(Debug, Default, Clone)]
pub struct RebuildEngine;

impl RebuildEngine {
    pub fn new() -> Self {
        Self
    }

    /// Rebuild `[from_day, to_day]` for one tenant. Returns the number of
    /// rollup rows written. The lease is released on every path out.
    pub fn rebuild_range(
        &self,
        store: &mut CoreStore,
        tenant_id: &TenantId,
        from_day: DayStamp,
        to_day: DayStamp,
        correlation_id: CorrelationId,
        now: MonotonicTimeNs,
    ) -> Result<u64, StorageError> {
        let lease = store.rebuild_lease_acquire(tenant_id, from_day, to_day)?;
        let result = store.rebuild_rollup_rows(&lease);
        store.rebuild_lease_release(&lease);
        let written = result?;

        let mut entries: BTreeMap<PayloadKey, PayloadValue> = BTreeMap::new();
        entries.insert(
            PayloadKey::new("rows_written").map_err(StorageError::ContractViolation)?,
            PayloadValue::new(written.to_string()).map_err(StorageError::ContractViolation)?,
        );
        entries.insert(
            PayloadKey::new("from_day").map_err(StorageError::ContractViolation)?,
            PayloadValue::new(from_day.0.to_string()).map_err(StorageError::ContractViolation)?,
        );
        entries.insert(
            PayloadKey::new("to_day").map_err(StorageError::ContractViolation)?,
            PayloadValue::new(to_day.0.to_string()).map_err(StorageError::ContractViolation)?,
        );
        let payload_min = AuditPayloadMin::v1(entries).map_err(StorageError::ContractViolation)?;
        store.append_audit_event(
            AuditEventInput::v1(
                now,
                Some(tenant_id.clone()),
                None,
                AuditEventType::RollupRebuilt,
                ROLLUP_REBUILT_FROM_LEDGER,
                AuditSeverity::Info,
                Some(correlation_id),
                payload_min,
                None,
            )
            .map_err(StorageError::ContractViolation)?,
        )?;
        Ok(written)
    }
}

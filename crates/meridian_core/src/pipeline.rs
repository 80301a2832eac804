#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use meridian_engines::activation::{ActivationDecision, ActivationGateRuntime, ActivationObservation};
use meridian_engines::mapping_sync::{
    MappingSyncConfig, MappingSyncObservation, MappingSyncRuntime, PropagationDecision,
};
use meridian_engines::rollup::{RollupConfig, RollupDecision, RollupRuntime};
use meridian_kernel_contracts::audit::{
    AuditEventInput, AuditEventType, AuditPayloadMin, AuditSeverity, CorrelationId, PayloadKey,
    PayloadValue,
};
use meridian_kernel_contracts::effects::WriteEffects;
use meridian_kernel_contracts::fact::{FactId, FactRecord, FactWriteInput};
use meridian_kernel_contracts::mapping::MappingWriteInput;
use meridian_kernel_contracts::rollup::RollupRecord;
use meridian_kernel_contracts::tenant::{EntityId, EntityRecord, TenantId};
use meridian_kernel_contracts::{DayStamp, MonotonicTimeNs, ReasonCodeId};
use meridian_storage::store::{
    CoreStore, FactAppendOutcome, MappingWriteOutcome, OrderConfirmOutcome, StorageError,
};

use crate::context::TenantContext;

pub mod reason_codes {
    use meridian_kernel_contracts::ReasonCodeId;

    // Write-pipeline reason-code namespace. Values are placeholders until global registry lock.
    pub const CORE_OK_FACT_APPENDED: ReasonCodeId = ReasonCodeId(0x4D43_0001);
    pub const CORE_OK_ORDER_CONFIRMED: ReasonCodeId = ReasonCodeId(0x4D43_0002);
    pub const CORE_OK_MAPPING_WRITTEN: ReasonCodeId = ReasonCodeId(0x4D43_0003);
    pub const CORE_OK_ENTITY_ACTIVATED: ReasonCodeId = ReasonCodeId(0x4D43_0004);

    pub const CORE_TENANT_STAMP_CORRECTED: ReasonCodeId = ReasonCodeId(0x4D43_0010);
    pub const CORE_NEGATIVE_DELTA_CLAMPED: ReasonCodeId = ReasonCodeId(0x4D43_0011);
}

/// Orchestrates every tenant-facing write: stages the engines' decisions as
/// effects, hands the store one atomic commit, and emits the follow-up audit
/// evidence. Reads go through a `TenantContext`; writes are stamped with the
/// owning entity's tenant by the store regardless of what the caller declared.
#[derive(Debug)]
pub struct WritePipeline {
    store: CoreStore,
    rollup: RollupRuntime,
    mapping_sync: MappingSyncRuntime,
    activation: ActivationGateRuntime,
}

impl WritePipeline {
    pub fn new(store: CoreStore) -> Self {
        Self {
            store,
            rollup: RollupRuntime::new(RollupConfig::mvp_v1()),
            mapping_sync: MappingSyncRuntime::new(MappingSyncConfig::mvp_v1()),
            activation: ActivationGateRuntime::new(),
        }
    }

    pub fn store(&self) -> &CoreStore {
        &self.store
    }

    /// Direct store access for operator tooling (snapshot imports, advisory
    /// locks, lease management). Request-path code goes through the typed
    /// operations instead.
    pub fn store_mut(&mut self) -> &mut CoreStore {
        &mut self.store
    }

    // ------------------------
    // Fact writes.
    // ------------------------

    /// Append one business fact. The incremental rollup delta for the fact is
    /// staged against the pre-write state and committed together with the
    /// ledger row; a mismatched declared tenant is corrected and recorded,
    /// never rejected.
    pub fn append_fact(
        &mut self,
        input: FactWriteInput,
        correlation_id: CorrelationId,
        now: MonotonicTimeNs,
    ) -> Result<FactAppendOutcome, StorageError> {
        let owner = self
            .store
            .entity_owner_tenant(&input.entity_id)
            .cloned()
            .ok_or_else(|| StorageError::ForeignKeyViolation {
                table: "entities",
                key: input.entity_id.as_str().to_string(),
            })?;

        let preview =
            FactRecord::from_input_v1(self.store.peek_next_fact_id(), input.clone(), owner.clone(), now)?;
        let decision = self.rollup.delta_for_fact_insert(&preview);

        let mut effects = WriteEffects::empty();
        if let RollupDecision::Apply { delta_at, .. } = &decision {
            effects.rollup_deltas.push(delta_at.clone());
        }
        effects.audit_events.push(audit_input(
            now,
            Some(owner.clone()),
            Some(preview.entity_id.clone()),
            AuditEventType::FactAppended,
            reason_codes::CORE_OK_FACT_APPENDED,
            AuditSeverity::Info,
            correlation_id,
            &[("day", preview.day().0.to_string())],
        )?);
        if input.tenant_id != owner {
            effects.audit_events.push(audit_input(
                now,
                Some(owner.clone()),
                Some(preview.entity_id.clone()),
                AuditEventType::TenantStampCorrected,
                reason_codes::CORE_TENANT_STAMP_CORRECTED,
                AuditSeverity::Warn,
                correlation_id,
                &[
                    ("declared_tenant", input.tenant_id.as_str().to_string()),
                    ("stamped_tenant", owner.as_str().to_string()),
                ],
            )?);
        }

        self.rollup
            .ensure_delta_budget(&effects.rollup_deltas)
            .map_err(StorageError::ContractViolation)?;
        let outcome = self.store.fact_append_commit_row(input, effects, now)?;
        if outcome.delta_clamped {
            self.audit_clamp(&outcome.record.tenant_id, &outcome.record.entity_id, correlation_id, now)?;
        }
        Ok(outcome)
    }

    /// Flip an order's confirmation flag. Only the first `false -> true`
    /// transition stages a confirmation delta; every later flip is a flag
    /// change with no counter impact.
    pub fn confirm_order(
        &mut self,
        fact_id: FactId,
        ai_confirmed: bool,
        correlation_id: CorrelationId,
        now: MonotonicTimeNs,
    ) -> Result<OrderConfirmOutcome, StorageError> {
        let before = self
            .store
            .fact_row(fact_id)
            .cloned()
            .ok_or(StorageError::ForeignKeyViolation {
                table: "fact_ledger",
                key: format!("{}", fact_id.0),
            })?;
        let decision = self.rollup.delta_for_order_confirmation(&before, ai_confirmed);

        let mut effects = WriteEffects::empty();
        let counted = decision.delta_at().is_some();
        if let RollupDecision::Apply { delta_at, .. } = &decision {
            effects.rollup_deltas.push(delta_at.clone());
        }
        effects.audit_events.push(audit_input(
            now,
            Some(before.tenant_id.clone()),
            Some(before.entity_id.clone()),
            AuditEventType::OrderConfirmed,
            reason_codes::CORE_OK_ORDER_CONFIRMED,
            AuditSeverity::Info,
            correlation_id,
            &[
                ("ai_confirmed", ai_confirmed.to_string()),
                ("counted", counted.to_string()),
            ],
        )?);

        self.rollup
            .ensure_delta_budget(&effects.rollup_deltas)
            .map_err(StorageError::ContractViolation)?;
        self.store
            .order_confirm_commit_row(fact_id, ai_confirmed, effects, now)
    }

    // ------------------------
    // Mapping writes + flag propagation.
    // ------------------------

    /// Upsert a mapping, then propagate the denormalized
    /// `has_active_mapping` flag. Propagation is best-effort: when the
    /// advisory flag lock is held elsewhere the flag stays stale and the miss
    /// is recorded at Warn, but the mapping write itself has already
    /// committed.
    pub fn write_mapping(
        &mut self,
        input: MappingWriteInput,
        correlation_id: CorrelationId,
        now: MonotonicTimeNs,
    ) -> Result<MappingWriteOutcome, StorageError> {
        let owner = self
            .store
            .entity_owner_tenant(&input.entity_id)
            .cloned()
            .ok_or_else(|| StorageError::ForeignKeyViolation {
                table: "entities",
                key: input.entity_id.as_str().to_string(),
            })?;

        let mut effects = WriteEffects::empty();
        effects.audit_events.push(audit_input(
            now,
            Some(owner.clone()),
            Some(input.entity_id.clone()),
            AuditEventType::MappingWritten,
            reason_codes::CORE_OK_MAPPING_WRITTEN,
            AuditSeverity::Info,
            correlation_id,
            &[
                ("mapping_id", input.mapping_id.as_str().to_string()),
                ("enabled", input.enabled.to_string()),
            ],
        )?);
        if input.tenant_id != owner {
            effects.audit_events.push(audit_input(
                now,
                Some(owner.clone()),
                Some(input.entity_id.clone()),
                AuditEventType::TenantStampCorrected,
                reason_codes::CORE_TENANT_STAMP_CORRECTED,
                AuditSeverity::Warn,
                correlation_id,
                &[
                    ("declared_tenant", input.tenant_id.as_str().to_string()),
                    ("stamped_tenant", owner.as_str().to_string()),
                ],
            )?);
        }

        let outcome = self.store.mapping_write_commit_row(input, effects, now)?;
        if outcome.replayed {
            return Ok(outcome);
        }

        let tenant_id = outcome.record.tenant_id.clone();
        let entity_id = outcome.record.entity_id.clone();
        self.propagate_flag(&tenant_id, &entity_id, correlation_id, now)?;
        Ok(outcome)
    }

    /// One propagation attempt for an entity's flag, respecting the advisory
    /// flag lock.
    pub fn propagate_flag(
        &mut self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        correlation_id: CorrelationId,
        now: MonotonicTimeNs,
    ) -> Result<(), StorageError> {
        let lock_acquired = self.store.entity_flag_lock_acquire(tenant_id, entity_id);
        let obs = MappingSyncObservation {
            enabled_mapping_count: self.store.enabled_mapping_count(tenant_id, entity_id),
            lock_acquired,
        };
        let decision = self.mapping_sync.evaluate(&obs);
        let result = match decision {
            PropagationDecision::SetFlag { has_active_mapping, reason_code } => {
                let flag = self
                    .store
                    .entity_flag_recompute_commit_row(tenant_id, entity_id, now)?;
                debug_assert_eq!(flag, has_active_mapping);
                self.audit(
                    tenant_id,
                    entity_id,
                    AuditEventType::MappingFlagPropagated,
                    reason_code,
                    AuditSeverity::Info,
                    correlation_id,
                    now,
                    &[("has_active_mapping", flag.to_string())],
                )
            }
            PropagationDecision::StaleFlagWarn { reason_code } => self.audit(
                tenant_id,
                entity_id,
                AuditEventType::PropagationLockTimeout,
                reason_code,
                AuditSeverity::Warn,
                correlation_id,
                now,
                &[("lock_wait_ms", self.mapping_sync.config().lock_wait_ms.to_string())],
            ),
        };
        if lock_acquired {
            self.store.entity_flag_lock_release(tenant_id, entity_id);
        }
        result
    }

    // ------------------------
    // Activation.
    // ------------------------

    /// Gate-checked transition to Active. A refusal names the broken
    /// invariant, leaves the entity untouched, and lands on the audit ledger.
    pub fn try_activate(
        &mut self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        correlation_id: CorrelationId,
        now: MonotonicTimeNs,
    ) -> Result<EntityRecord, StorageError> {
        let entity = self
            .store
            .entity_row(tenant_id, entity_id)
            .ok_or_else(|| StorageError::ForeignKeyViolation {
                table: "entities",
                key: entity_id.as_str().to_string(),
            })?;
        let obs = ActivationObservation {
            enabled_mapping_count: self.store.enabled_mapping_count(tenant_id, entity_id),
            activation_url_present: entity.activation_url_present(),
        };

        match self.activation.evaluate(&obs) {
            ActivationDecision::Refuse { kind, reason_code } => {
                self.audit(
                    tenant_id,
                    entity_id,
                    AuditEventType::ActivationRefused,
                    reason_code,
                    AuditSeverity::Warn,
                    correlation_id,
                    now,
                    &[("invariant", format!("{kind:?}"))],
                )?;
                Err(StorageError::InvariantViolation {
                    entity_id: entity_id.clone(),
                    kind,
                })
            }
            ActivationDecision::Pass { reason_code } => {
                let record = self
                    .store
                    .entity_activate_commit_row(tenant_id, entity_id, now)?;
                self.audit(
                    tenant_id,
                    entity_id,
                    AuditEventType::EntityActivated,
                    reason_code,
                    AuditSeverity::Info,
                    correlation_id,
                    now,
                    &[],
                )?;
                Ok(record)
            }
        }
    }

    // ------------------------
    // Context-scoped reads.
    // ------------------------

    pub fn entity(
        &self,
        ctx: &TenantContext,
        tenant_id: &TenantId,
        entity_id: &EntityId,
    ) -> Option<&EntityRecord> {
        if !ctx.permits(tenant_id) {
            return None;
        }
        self.store.entity_row(tenant_id, entity_id)
    }

    pub fn facts(&self, ctx: &TenantContext) -> Vec<&FactRecord> {
        self.store
            .fact_rows()
            .iter()
            .filter(|f| ctx.permits(&f.tenant_id))
            .collect()
    }

    pub fn rollups(&self, ctx: &TenantContext) -> Vec<&RollupRecord> {
        self.store
            .rollup_rows()
            .values()
            .filter(|r| ctx.permits(&r.tenant_id))
            .collect()
    }

    pub fn rollup(
        &self,
        ctx: &TenantContext,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        day: DayStamp,
    ) -> Option<&RollupRecord> {
        if !ctx.permits(tenant_id) {
            return None;
        }
        self.store.rollup_row(tenant_id, entity_id, day)
    }

    // ------------------------
    // Audit plumbing.
    // ------------------------

    #[allow(clippy::too_many_arguments)]
    fn audit(
        &mut self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        event_type: AuditEventType,
        reason_code: ReasonCodeId,
        severity: AuditSeverity,
        correlation_id: CorrelationId,
        now: MonotonicTimeNs,
        detail_entries: &[(&'static str, String)],
    ) -> Result<(), StorageError> {
        let input = audit_input(
            now,
            Some(tenant_id.clone()),
            Some(entity_id.clone()),
            event_type,
            reason_code,
            severity,
            correlation_id,
            detail_entries,
        )?;
        self.store.append_audit_event(input)?;
        Ok(())
    }

    fn audit_clamp(
        &mut self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        correlation_id: CorrelationId,
        now: MonotonicTimeNs,
    ) -> Result<(), StorageError> {
        self.audit(
            tenant_id,
            entity_id,
            AuditEventType::NegativeDeltaClamped,
            reason_codes::CORE_NEGATIVE_DELTA_CLAMPED,
            AuditSeverity::Warn,
            correlation_id,
            now,
            &[],
        )
    }
}

#[allow(clippy::too_many_arguments)]
fn audit_input(
    now: MonotonicTimeNs,
    tenant_id: Option<TenantId>,
    entity_id: Option<EntityId>,
    event_type: AuditEventType,
    reason_code: ReasonCodeId,
    severity: AuditSeverity,
    correlation_id: CorrelationId,
    detail_entries: &[(&'static str, String)],
) -> Result<AuditEventInput, StorageError> {
    let mut entries: BTreeMap<PayloadKey, PayloadValue> = BTreeMap::new();
    for (k, v) in detail_entries {
        entries.insert(
            PayloadKey::new(*k).map_err(StorageError::ContractViolation)?,
            PayloadValue::new(v.as_str()).map_err(StorageError::ContractViolation)?,
        );
    }
    let payload_min = AuditPayloadMin::v1(entries).map_err(StorageError::ContractViolation)?;
    AuditEventInput::v1(
        now,
        tenant_id,
        entity_id,
        event_type,
        reason_code,
        severity,
        Some(correlation_id),
        payload_min,
        None,
    )
    .map_err(StorageError::ContractViolation)
}

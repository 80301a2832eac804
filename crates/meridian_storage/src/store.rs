#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use meridian_kernel_contracts::audit::{AuditEvent, AuditEventId, AuditEventInput};
use meridian_kernel_contracts::effects::WriteEffects;
use meridian_kernel_contracts::fact::{FactBody, FactId, FactRecord, FactWriteInput};
use meridian_kernel_contracts::mapping::{
    collapse_survivor, MappingId, MappingRecord, MappingWriteInput,
};
use meridian_kernel_contracts::rollup::{RollupDelta, RollupRecord};
use meridian_kernel_contracts::tenant::{
    EntityId, EntityRecord, EntityStatus, InvariantKind, TenantId,
};
use meridian_kernel_contracts::{ContractViolation, DayStamp, MonotonicTimeNs, Validate};

#[derive(Debug, Clone, PartialEq)]
pub enum StorageError {
    ForeignKeyViolation {
        table: &'static str,
        key: String,
    },
    DuplicateKey {
        table: &'static str,
        key: String,
    },
    AppendOnlyViolation {
        table: &'static str,
    },
    /// The activation gate, or the one-enabled-mapping constraint, refused a
    /// commit. Surfaced to callers; the entity is left unchanged.
    InvariantViolation {
        entity_id: EntityId,
        kind: InvariantKind,
    },
    /// An overlapping rebuild lease is held for the tenant. Retryable; never
    /// silently merged.
    RebuildConflict {
        tenant_id: TenantId,
    },
    ContractViolation(ContractViolation),
}

impl From<ContractViolation> for StorageError {
    fn from(v: ContractViolation) -> Self {
        StorageError::ContractViolation(v)
    }
}

/// Proof that the holder may rebuild rollups for one tenant/day-range.
/// Only `rebuild_lease_acquire` constructs one, so `rebuild_rollup_rows`
/// cannot run unserialized.
#[derive(Debug)]
pub struct RebuildLease {
    lease_id: u64,
    tenant_id: TenantId,
    from_day: DayStamp,
    to_day: DayStamp,
}

impl RebuildLease {
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn from_day(&self) -> DayStamp {
        self.from_day
    }

    pub fn to_day(&self) -> DayStamp {
        self.to_day
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FactAppendOutcome {
    pub record: FactRecord,
    /// The caller's declared tenant did not match the owning entity's tenant
    /// and was corrected, never trusted.
    pub tenant_corrected: bool,
    pub delta_clamped: bool,
    /// Deterministic no-op replay of a previously committed idempotency key.
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderConfirmOutcome {
    pub record: FactRecord,
    pub previously_confirmed: bool,
    /// True only on the first `false -> true` transition for this order.
    pub counted: bool,
    pub delta_clamped: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappingWriteOutcome {
    pub record: MappingRecord,
    pub tenant_corrected: bool,
    pub created: bool,
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollapseOutcome {
    pub survivor: Option<MappingId>,
    pub disabled: Vec<MappingId>,
}

/// In-memory data layer: entity table, append-only fact ledger, mapping table
/// with the partial-unique enabled index, daily rollup projection, append-only
/// audit ledger, and the advisory lock/lease tables.
///
/// Commit-row methods validate everything first and mutate last, so each call
/// is atomic: it either fully applies (primary write plus staged effects) or
/// leaves the store untouched.
#[derive(Debug, Default)]
pub struct CoreStore {
    entities: BTreeMap<(TenantId, EntityId), EntityRecord>,
    entity_owner: BTreeMap<EntityId, TenantId>,

    fact_ledger: Vec<FactRecord>,
    fact_index: BTreeMap<FactId, usize>,
    // Idempotency: (stamped tenant, idempotency_key) -> deterministic no-op on retry.
    fact_idempotency_index: BTreeMap<(TenantId, String), FactId>,
    next_fact_id: u64,

    mappings: BTreeMap<MappingId, MappingRecord>,
    mappings_by_entity: BTreeMap<(TenantId, EntityId), BTreeSet<MappingId>>,
    // Partial-unique arbiter: at most one enabled mapping per entity. Checked
    // writes go through this slot; only the snapshot-import path may bypass it.
    enabled_mapping_index: BTreeMap<(TenantId, EntityId), MappingId>,
    mapping_idempotency_index: BTreeMap<(TenantId, String), MappingId>,

    rollups: BTreeMap<(TenantId, EntityId, DayStamp), RollupRecord>,

    audit_events: Vec<AuditEvent>,
    audit_idempotency_index: BTreeMap<String, AuditEventId>,
    next_audit_event_id: u64,

    rebuild_leases: BTreeMap<u64, (TenantId, DayStamp, DayStamp)>,
    next_rebuild_lease_id: u64,

    // Advisory operator locks the flag propagator must respect.
    entity_flag_locks: BTreeSet<(TenantId, EntityId)>,
}

impl CoreStore {
    pub fn new_in_memory() -> Self {
        Self {
            next_fact_id: 1,
            next_audit_event_id: 1,
            next_rebuild_lease_id: 1,
            ..Self::default()
        }
    }

    // ------------------------
    // Entities.
    // ------------------------

    pub fn insert_entity_row(&mut self, record: EntityRecord) -> Result<(), StorageError> {
        record.validate()?;
        if self.entity_owner.contains_key(&record.entity_id) {
            return Err(StorageError::DuplicateKey {
                table: "entities",
                key: record.entity_id.as_str().to_string(),
            });
        }
        self.entity_owner
            .insert(record.entity_id.clone(), record.tenant_id.clone());
        self.entities.insert(
            (record.tenant_id.clone(), record.entity_id.clone()),
            record,
        );
        Ok(())
    }

    pub fn entity_row(&self, tenant_id: &TenantId, entity_id: &EntityId) -> Option<&EntityRecord> {
        self.entities.get(&(tenant_id.clone(), entity_id.clone()))
    }

    pub fn entity_rows_for_tenant(&self, tenant_id: &TenantId) -> Vec<&EntityRecord> {
        self.entities
            .values()
            .filter(|e| e.tenant_id == *tenant_id)
            .collect()
    }

    pub fn entity_owner_tenant(&self, entity_id: &EntityId) -> Option<&TenantId> {
        self.entity_owner.get(entity_id)
    }

    pub fn update_entity_activation_url_row(
        &mut self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        activation_url: Option<String>,
        now: MonotonicTimeNs,
    ) -> Result<EntityRecord, StorageError> {
        let key = (tenant_id.clone(), entity_id.clone());
        let current = self
            .entities
            .get(&key)
            .ok_or_else(|| StorageError::ForeignKeyViolation {
                table: "entities",
                key: entity_id.as_str().to_string(),
            })?;

        let next = EntityRecord::v1(
            current.tenant_id.clone(),
            current.entity_id.clone(),
            current.status,
            activation_url,
            current.has_active_mapping,
            current.created_at,
            now.max(current.created_at),
        )?;
        self.entities.insert(key, next.clone());
        Ok(next)
    }

    /// Status transitions to `Active` go through the activation gate; other
    /// transitions commit unconditionally.
    pub fn entity_set_status_commit_row(
        &mut self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        status: EntityStatus,
        now: MonotonicTimeNs,
    ) -> Result<EntityRecord, StorageError> {
        if status == EntityStatus::Active {
            return self.entity_activate_commit_row(tenant_id, entity_id, now);
        }
        let key = (tenant_id.clone(), entity_id.clone());
        let current = self
            .entities
            .get(&key)
            .ok_or_else(|| StorageError::ForeignKeyViolation {
                table: "entities",
                key: entity_id.as_str().to_string(),
            })?;
        let mut next = current.clone();
        next.status = status;
        next.updated_at = now.max(current.created_at);
        self.entities.insert(key, next.clone());
        Ok(next)
    }

    /// Activation gate commit: exactly one enabled mapping and a non-empty
    /// `activation_url`, or the entity stays untouched.
    pub fn entity_activate_commit_row(
        &mut self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        now: MonotonicTimeNs,
    ) -> Result<EntityRecord, StorageError> {
        let key = (tenant_id.clone(), entity_id.clone());
        let current = self
            .entities
            .get(&key)
            .ok_or_else(|| StorageError::ForeignKeyViolation {
                table: "entities",
                key: entity_id.as_str().to_string(),
            })?;

        let enabled = self.enabled_mapping_count(tenant_id, entity_id);
        if enabled == 0 {
            return Err(StorageError::InvariantViolation {
                entity_id: entity_id.clone(),
                kind: InvariantKind::NoEnabledMapping,
            });
        }
        if enabled > 1 {
            return Err(StorageError::InvariantViolation {
                entity_id: entity_id.clone(),
                kind: InvariantKind::MultipleEnabledMappings,
            });
        }
        if !current.activation_url_present() {
            return Err(StorageError::InvariantViolation {
                entity_id: entity_id.clone(),
                kind: InvariantKind::ActivationUrlMissing,
            });
        }

        let mut next = current.clone();
        next.status = EntityStatus::Active;
        next.has_active_mapping = true;
        next.updated_at = now.max(current.created_at);
        self.entities.insert(key, next.clone());
        Ok(next)
    }

    /// Recompute the denormalized flag from the mapping table. Callers are
    /// expected to have respected the advisory flag lock first.
    pub fn entity_flag_recompute_commit_row(
        &mut self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        now: MonotonicTimeNs,
    ) -> Result<bool, StorageError> {
        let key = (tenant_id.clone(), entity_id.clone());
        if !self.entities.contains_key(&key) {
            return Err(StorageError::ForeignKeyViolation {
                table: "entities",
                key: entity_id.as_str().to_string(),
            });
        }
        let flag = self.enabled_mapping_count(tenant_id, entity_id) > 0;
        let current = self.entities.get_mut(&key).expect("checked above");
        current.has_active_mapping = flag;
        current.updated_at = now.max(current.created_at);
        Ok(flag)
    }

    // ------------------------
    // Fact ledger (append-only) + rollup projection.
    // ------------------------

    pub fn peek_next_fact_id(&self) -> FactId {
        FactId(self.next_fact_id)
    }

    pub fn fact_append_commit_row(
        &mut self,
        input: FactWriteInput,
        effects: WriteEffects,
        now: MonotonicTimeNs,
    ) -> Result<FactAppendOutcome, StorageError> {
        input.validate()?;
        effects.validate()?;

        let owner = self
            .entity_owner
            .get(&input.entity_id)
            .cloned()
            .ok_or_else(|| StorageError::ForeignKeyViolation {
                table: "entities",
                key: input.entity_id.as_str().to_string(),
            })?;
        let tenant_corrected = input.tenant_id != owner;

        if let Some(k) = &input.idempotency_key {
            let idx = (owner.clone(), k.clone());
            if let Some(existing_id) = self.fact_idempotency_index.get(&idx) {
                let record = self
                    .fact_row(*existing_id)
                    .expect("idempotency index points at a committed fact")
                    .clone();
                return Ok(FactAppendOutcome {
                    record,
                    tenant_corrected,
                    delta_clamped: false,
                    replayed: true,
                });
            }
        }

        let day = DayStamp::from_time(input.occurred_at);
        if self.rebuild_lease_covers(&owner, day) {
            return Err(StorageError::RebuildConflict { tenant_id: owner });
        }
        self.prevalidate_effects(&effects)?;

        let fact_id = FactId(self.next_fact_id);
        self.next_fact_id = self.next_fact_id.saturating_add(1);

        let idempotency_key = input.idempotency_key.clone();
        let record = FactRecord::from_input_v1(fact_id, input, owner.clone(), now)?;
        if let Some(k) = idempotency_key {
            self.fact_idempotency_index.insert((owner, k), fact_id);
        }
        self.fact_index.insert(fact_id, self.fact_ledger.len());
        self.fact_ledger.push(record.clone());

        let delta_clamped = self.apply_effects(effects, now);
        Ok(FactAppendOutcome {
            record,
            tenant_corrected,
            delta_clamped,
            replayed: false,
        })
    }

    /// The only permitted fact mutation: the order confirmation flag.
    pub fn order_confirm_commit_row(
        &mut self,
        fact_id: FactId,
        ai_confirmed: bool,
        effects: WriteEffects,
        now: MonotonicTimeNs,
    ) -> Result<OrderConfirmOutcome, StorageError> {
        effects.validate()?;

        let idx = *self
            .fact_index
            .get(&fact_id)
            .ok_or(StorageError::ForeignKeyViolation {
                table: "fact_ledger",
                key: format!("{}", fact_id.0),
            })?;
        let (previously_confirmed, tenant_id, day) = {
            let record = &self.fact_ledger[idx];
            match &record.body {
                FactBody::Order(o) => (o.ai_confirmed, record.tenant_id.clone(), record.day()),
                FactBody::Conversation => {
                    return Err(StorageError::ContractViolation(
                        ContractViolation::InvalidValue {
                            field: "fact_id",
                            reason: "must reference an order fact",
                        },
                    ));
                }
            }
        };

        if self.rebuild_lease_covers(&tenant_id, day) {
            return Err(StorageError::RebuildConflict { tenant_id });
        }
        self.prevalidate_effects(&effects)?;

        let record = &mut self.fact_ledger[idx];
        let first_confirmation =
            ai_confirmed && !previously_confirmed && record.ai_confirmed_at.is_none();
        if let FactBody::Order(o) = &mut record.body {
            o.ai_confirmed = ai_confirmed;
        }
        if first_confirmation {
            record.ai_confirmed_at = Some(now);
        }
        let record = record.clone();

        let delta_clamped = self.apply_effects(effects, now);
        Ok(OrderConfirmOutcome {
            record,
            previously_confirmed,
            counted: first_confirmation,
            delta_clamped,
        })
    }

    pub fn fact_row(&self, fact_id: FactId) -> Option<&FactRecord> {
        self.fact_index.get(&fact_id).map(|i| &self.fact_ledger[*i])
    }

    pub fn fact_rows(&self) -> &[FactRecord] {
        &self.fact_ledger
    }

    pub fn fact_rows_for_tenant(&self, tenant_id: &TenantId) -> Vec<&FactRecord> {
        self.fact_ledger
            .iter()
            .filter(|f| f.tenant_id == *tenant_id)
            .collect()
    }

    pub fn attempt_overwrite_fact_row(&mut self, _fact_id: FactId) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation {
            table: "fact_ledger",
        })
    }

    /// Add-and-clamp against one rollup row, creating it with a zero baseline
    /// when absent. Returns whether a negative component had to be dropped.
    pub fn rollup_apply_delta(
        &mut self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        day: DayStamp,
        delta: RollupDelta,
    ) -> bool {
        let clamped = delta.has_negative_component();
        let sanitized = delta.clamped_non_negative();
        let row = self
            .rollups
            .entry((tenant_id.clone(), entity_id.clone(), day))
            .or_insert_with(|| {
                RollupRecord::zero_baseline(tenant_id.clone(), entity_id.clone(), day)
            });
        row.impressions = row.impressions.saturating_add(sanitized.impressions as u64);
        row.conversations = row
            .conversations
            .saturating_add(sanitized.conversations as u64);
        row.ai_confirmations = row
            .ai_confirmations
            .saturating_add(sanitized.ai_confirmations as u64);
        row.orders_count = row
            .orders_count
            .saturating_add(sanitized.orders_count as u64);
        row.revenue += sanitized.revenue;
        clamped
    }

    pub fn rollup_row(
        &self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        day: DayStamp,
    ) -> Option<&RollupRecord> {
        self.rollups
            .get(&(tenant_id.clone(), entity_id.clone(), day))
    }

    pub fn rollup_rows(&self) -> &BTreeMap<(TenantId, EntityId, DayStamp), RollupRecord> {
        &self.rollups
    }

    pub fn rollup_rows_for_tenant(&self, tenant_id: &TenantId) -> Vec<&RollupRecord> {
        self.rollups
            .values()
            .filter(|r| r.tenant_id == *tenant_id)
            .collect()
    }

    // ------------------------
    // Mappings + the one-enabled-per-entity constraint.
    // ------------------------

    pub fn mapping_write_commit_row(
        &mut self,
        input: MappingWriteInput,
        effects: WriteEffects,
        now: MonotonicTimeNs,
    ) -> Result<MappingWriteOutcome, StorageError> {
        input.validate()?;
        effects.validate()?;

        let owner = self
            .entity_owner
            .get(&input.entity_id)
            .cloned()
            .ok_or_else(|| StorageError::ForeignKeyViolation {
                table: "entities",
                key: input.entity_id.as_str().to_string(),
            })?;
        let tenant_corrected = input.tenant_id != owner;

        if let Some(k) = &input.idempotency_key {
            let idx = (owner.clone(), k.clone());
            if let Some(existing_id) = self.mapping_idempotency_index.get(&idx) {
                let record = self
                    .mappings
                    .get(existing_id)
                    .expect("idempotency index points at a committed mapping")
                    .clone();
                return Ok(MappingWriteOutcome {
                    record,
                    tenant_corrected,
                    created: false,
                    replayed: true,
                });
            }
        }

        let existing = self.mappings.get(&input.mapping_id).cloned();
        if let Some(e) = &existing {
            if e.entity_id != input.entity_id {
                return Err(StorageError::DuplicateKey {
                    table: "mappings",
                    key: input.mapping_id.as_str().to_string(),
                });
            }
        }

        if input.enabled {
            let slot = (owner.clone(), input.entity_id.clone());
            if let Some(holder) = self.enabled_mapping_index.get(&slot) {
                if *holder != input.mapping_id {
                    return Err(StorageError::InvariantViolation {
                        entity_id: input.entity_id.clone(),
                        kind: InvariantKind::MultipleEnabledMappings,
                    });
                }
            }
        }
        self.prevalidate_effects(&effects)?;

        let created_at = existing.as_ref().map(|e| e.created_at).unwrap_or(now);
        let record = MappingRecord::v1(
            input.mapping_id.clone(),
            input.entity_id.clone(),
            owner.clone(),
            input.enabled,
            input.source_url.clone(),
            input.last_processed_cursor,
            created_at,
            now.max(created_at),
        )?;

        let slot = (owner.clone(), record.entity_id.clone());
        if record.enabled {
            self.enabled_mapping_index
                .insert(slot.clone(), record.mapping_id.clone());
        } else if self.enabled_mapping_index.get(&slot) == Some(&record.mapping_id) {
            self.enabled_mapping_index.remove(&slot);
        }
        self.mappings_by_entity
            .entry(slot)
            .or_default()
            .insert(record.mapping_id.clone());
        if let Some(k) = &input.idempotency_key {
            self.mapping_idempotency_index
                .insert((owner, k.clone()), record.mapping_id.clone());
        }
        self.mappings
            .insert(record.mapping_id.clone(), record.clone());

        self.apply_effects(effects, now);
        Ok(MappingWriteOutcome {
            record,
            tenant_corrected,
            created: existing.is_none(),
            replayed: false,
        })
    }

    /// Snapshot-import path: loads a mapping row without consulting the
    /// enabled-unique slot (legacy dumps predate the constraint). This is the
    /// only way a multiple-enabled state can reach the store, and the repair
    /// operation exists for exactly that state.
    pub fn mapping_load_row_unchecked(
        &mut self,
        mut record: MappingRecord,
    ) -> Result<(), StorageError> {
        record.validate()?;
        let owner = self
            .entity_owner
            .get(&record.entity_id)
            .cloned()
            .ok_or_else(|| StorageError::ForeignKeyViolation {
                table: "entities",
                key: record.entity_id.as_str().to_string(),
            })?;
        record.tenant_id = owner.clone();
        if self.mappings.contains_key(&record.mapping_id) {
            return Err(StorageError::DuplicateKey {
                table: "mappings",
                key: record.mapping_id.as_str().to_string(),
            });
        }
        let slot = (owner, record.entity_id.clone());
        if record.enabled {
            self.enabled_mapping_index
                .entry(slot.clone())
                .or_insert_with(|| record.mapping_id.clone());
        }
        self.mappings_by_entity
            .entry(slot)
            .or_default()
            .insert(record.mapping_id.clone());
        self.mappings.insert(record.mapping_id.clone(), record);
        Ok(())
    }

    pub fn mapping_row(&self, mapping_id: &MappingId) -> Option<&MappingRecord> {
        self.mappings.get(mapping_id)
    }

    pub fn mapping_rows_for_entity(
        &self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
    ) -> Vec<&MappingRecord> {
        self.mappings_by_entity
            .get(&(tenant_id.clone(), entity_id.clone()))
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.mappings.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Authoritative enabled count: scans the table rather than trusting the
    /// unique slot, so unchecked-loaded rows are counted too.
    pub fn enabled_mapping_count(&self, tenant_id: &TenantId, entity_id: &EntityId) -> usize {
        self.mapping_rows_for_entity(tenant_id, entity_id)
            .iter()
            .filter(|m| m.enabled)
            .count()
    }

    pub fn enabled_mapping_slot(
        &self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
    ) -> Option<&MappingId> {
        self.enabled_mapping_index
            .get(&(tenant_id.clone(), entity_id.clone()))
    }

    /// Repair: disable all but the deterministic survivor (`updated_at` desc,
    /// `created_at` desc, `mapping_id` desc). No-op when zero or one row is
    /// enabled.
    pub fn collapse_to_one_enabled_commit_row(
        &mut self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        now: MonotonicTimeNs,
    ) -> Result<CollapseOutcome, StorageError> {
        if !self
            .entities
            .contains_key(&(tenant_id.clone(), entity_id.clone()))
        {
            return Err(StorageError::ForeignKeyViolation {
                table: "entities",
                key: entity_id.as_str().to_string(),
            });
        }

        let enabled: Vec<&MappingRecord> = self
            .mapping_rows_for_entity(tenant_id, entity_id)
            .into_iter()
            .filter(|m| m.enabled)
            .collect();
        if enabled.len() <= 1 {
            return Ok(CollapseOutcome {
                survivor: enabled.first().map(|m| m.mapping_id.clone()),
                disabled: Vec::new(),
            });
        }

        let survivor = collapse_survivor(&enabled)
            .expect("at least two enabled rows present")
            .mapping_id
            .clone();
        let losers: Vec<MappingId> = enabled
            .iter()
            .filter(|m| m.mapping_id != survivor)
            .map(|m| m.mapping_id.clone())
            .collect();

        for id in &losers {
            let row = self.mappings.get_mut(id).expect("enumerated above");
            row.enabled = false;
            row.updated_at = now.max(row.created_at);
        }
        self.enabled_mapping_index
            .insert((tenant_id.clone(), entity_id.clone()), survivor.clone());

        Ok(CollapseOutcome {
            survivor: Some(survivor),
            disabled: losers,
        })
    }

    /// Startup self-healing: when the entity carries a legacy `activation_url`
    /// but no mapping rows at all, create a single enabled mapping from it.
    pub fn ensure_mapping_commit_row(
        &mut self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        mapping_id: MappingId,
        now: MonotonicTimeNs,
    ) -> Result<Option<MappingRecord>, StorageError> {
        let entity = self
            .entities
            .get(&(tenant_id.clone(), entity_id.clone()))
            .ok_or_else(|| StorageError::ForeignKeyViolation {
                table: "entities",
                key: entity_id.as_str().to_string(),
            })?;

        if !self.mapping_rows_for_entity(tenant_id, entity_id).is_empty() {
            return Ok(None);
        }
        let source_url = match &entity.activation_url {
            Some(u) if !u.trim().is_empty() => u.clone(),
            _ => return Ok(None),
        };
        if self.mappings.contains_key(&mapping_id) {
            return Err(StorageError::DuplicateKey {
                table: "mappings",
                key: mapping_id.as_str().to_string(),
            });
        }

        let record = MappingRecord::v1(
            mapping_id,
            entity_id.clone(),
            tenant_id.clone(),
            true,
            source_url,
            0,
            now,
            now,
        )?;
        let slot = (tenant_id.clone(), entity_id.clone());
        self.enabled_mapping_index
            .insert(slot.clone(), record.mapping_id.clone());
        self.mappings_by_entity
            .entry(slot)
            .or_default()
            .insert(record.mapping_id.clone());
        self.mappings
            .insert(record.mapping_id.clone(), record.clone());
        Ok(Some(record))
    }

    // ------------------------
    // Rebuild leases + canonical recomputation.
    // ------------------------

    pub fn rebuild_lease_acquire(
        &mut self,
        tenant_id: &TenantId,
        from_day: DayStamp,
        to_day: DayStamp,
    ) -> Result<RebuildLease, StorageError> {
        if from_day > to_day {
            return Err(StorageError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "rebuild_lease.from_day",
                    reason: "must be <= to_day",
                },
            ));
        }
        let overlaps = self.rebuild_leases.values().any(|(t, from, to)| {
            t == tenant_id && from_day <= *to && *from <= to_day
        });
        if overlaps {
            return Err(StorageError::RebuildConflict {
                tenant_id: tenant_id.clone(),
            });
        }
        let lease_id = self.next_rebuild_lease_id;
        self.next_rebuild_lease_id = self.next_rebuild_lease_id.saturating_add(1);
        self.rebuild_leases
            .insert(lease_id, (tenant_id.clone(), from_day, to_day));
        Ok(RebuildLease {
            lease_id,
            tenant_id: tenant_id.clone(),
            from_day,
            to_day,
        })
    }

    pub fn rebuild_lease_release(&mut self, lease: &RebuildLease) {
        self.rebuild_leases.remove(&lease.lease_id);
    }

    pub fn rebuild_lease_covers(&self, tenant_id: &TenantId, day: DayStamp) -> bool {
        self.rebuild_leases
            .values()
            .any(|(t, from, to)| t == tenant_id && *from <= day && day <= *to)
    }

    /// Recompute the canonical per-entity-per-day rollup rows for the leased
    /// range directly from the fact ledger, ignoring incremental history.
    /// Self-correcting for any drift and idempotent for a fixed ledger.
    pub fn rebuild_rollup_rows(&mut self, lease: &RebuildLease) -> Result<u64, StorageError> {
        let registered = self
            .rebuild_leases
            .get(&lease.lease_id)
            .map(|(t, from, to)| {
                *t == lease.tenant_id && *from == lease.from_day && *to == lease.to_day
            })
            .unwrap_or(false);
        if !registered {
            return Err(StorageError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "rebuild_lease",
                    reason: "must be an active lease for this store",
                },
            ));
        }

        let stale: Vec<(TenantId, EntityId, DayStamp)> = self
            .rollups
            .keys()
            .filter(|(t, _, d)| *t == lease.tenant_id && lease.from_day <= *d && *d <= lease.to_day)
            .cloned()
            .collect();
        for key in stale {
            self.rollups.remove(&key);
        }

        let mut recomputed: BTreeMap<(EntityId, DayStamp), RollupRecord> = BTreeMap::new();
        for fact in &self.fact_ledger {
            if fact.tenant_id != lease.tenant_id {
                continue;
            }
            let day = fact.day();
            if day < lease.from_day || lease.to_day < day {
                continue;
            }
            let row = recomputed
                .entry((fact.entity_id.clone(), day))
                .or_insert_with(|| {
                    RollupRecord::zero_baseline(
                        fact.tenant_id.clone(),
                        fact.entity_id.clone(),
                        day,
                    )
                });
            match &fact.body {
                FactBody::Order(o) => {
                    row.orders_count += 1;
                    row.revenue += o.amount;
                    if fact.ever_confirmed() {
                        row.ai_confirmations += 1;
                    }
                }
                FactBody::Conversation => {
                    row.conversations += 1;
                }
            }
        }

        let written = recomputed.len() as u64;
        for ((entity_id, day), row) in recomputed {
            self.rollups
                .insert((lease.tenant_id.clone(), entity_id, day), row);
        }
        Ok(written)
    }

    // ------------------------
    // Advisory entity-flag locks (operator tooling).
    // ------------------------

    pub fn entity_flag_lock_acquire(&mut self, tenant_id: &TenantId, entity_id: &EntityId) -> bool {
        self.entity_flag_locks
            .insert((tenant_id.clone(), entity_id.clone()))
    }

    pub fn entity_flag_lock_release(&mut self, tenant_id: &TenantId, entity_id: &EntityId) -> bool {
        self.entity_flag_locks
            .remove(&(tenant_id.clone(), entity_id.clone()))
    }

    pub fn entity_flag_lock_held(&self, tenant_id: &TenantId, entity_id: &EntityId) -> bool {
        self.entity_flag_locks
            .contains(&(tenant_id.clone(), entity_id.clone()))
    }

    // ------------------------
    // Audit ledger (append-only).
    // ------------------------

    pub fn append_audit_event(
        &mut self,
        input: AuditEventInput,
    ) -> Result<AuditEventId, StorageError> {
        input.validate()?;
        if let Some(k) = &input.idempotency_key {
            if let Some(existing) = self.audit_idempotency_index.get(k) {
                return Ok(*existing);
            }
        }
        let audit_event_id = AuditEventId(self.next_audit_event_id);
        self.next_audit_event_id = self.next_audit_event_id.saturating_add(1);
        let idempotency_key = input.idempotency_key.clone();
        let row = AuditEvent::from_input_v1(audit_event_id, input)?;
        if let Some(k) = idempotency_key {
            self.audit_idempotency_index.insert(k, audit_event_id);
        }
        self.audit_events.push(row);
        Ok(audit_event_id)
    }

    pub fn audit_events(&self) -> &[AuditEvent] {
        &self.audit_events
    }

    pub fn audit_events_by_tenant(&self, tenant_id: &TenantId) -> Vec<&AuditEvent> {
        self.audit_events
            .iter()
            .filter(|e| e.tenant_id.as_ref() == Some(tenant_id))
            .collect()
    }

    pub fn audit_events_by_type(
        &self,
        event_type: meridian_kernel_contracts::audit::AuditEventType,
    ) -> Vec<&AuditEvent> {
        self.audit_events
            .iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    // ------------------------
    // Staged-effect application.
    // ------------------------

    fn prevalidate_effects(&self, effects: &WriteEffects) -> Result<(), StorageError> {
        for f in &effects.flag_updates {
            if !self
                .entities
                .contains_key(&(f.tenant_id.clone(), f.entity_id.clone()))
            {
                return Err(StorageError::ForeignKeyViolation {
                    table: "entities",
                    key: f.entity_id.as_str().to_string(),
                });
            }
        }
        for d in &effects.rollup_deltas {
            if self.rebuild_lease_covers(&d.tenant_id, d.day) {
                return Err(StorageError::RebuildConflict {
                    tenant_id: d.tenant_id.clone(),
                });
            }
        }
        Ok(())
    }

    /// Infallible by construction: callers prevalidate. Returns whether any
    /// delta had a negative component dropped.
    fn apply_effects(&mut self, effects: WriteEffects, now: MonotonicTimeNs) -> bool {
        let mut clamped = false;
        for d in effects.rollup_deltas {
            clamped |= self.rollup_apply_delta(&d.tenant_id, &d.entity_id, d.day, d.delta);
        }
        for f in effects.flag_updates {
            let key = (f.tenant_id, f.entity_id);
            if let Some(entity) = self.entities.get_mut(&key) {
                entity.has_active_mapping = f.has_active_mapping;
                entity.updated_at = now.max(entity.created_at);
            }
        }
        for a in effects.audit_events {
            let _ = self.append_audit_event(a);
        }
        clamped
    }
}

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::{validate_id, validate_opt_text, validate_text};
use crate::tenant::{EntityId, TenantId};
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const MAPPING_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MappingId(String);

impl MappingId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = id.into();
        let v = Self(id);
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for MappingId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_id("mapping_id", &self.0, 64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingWriteInput {
    pub schema_version: SchemaVersion,
    pub mapping_id: MappingId,
    pub entity_id: EntityId,
    /// Declared by the caller; the store always stamps the owning entity's
    /// tenant instead of trusting this.
    pub tenant_id: TenantId,
    pub enabled: bool,
    pub source_url: String,
    pub last_processed_cursor: u64,
    pub idempotency_key: Option<String>,
}

impl MappingWriteInput {
    pub fn v1(
        mapping_id: MappingId,
        entity_id: EntityId,
        tenant_id: TenantId,
        enabled: bool,
        source_url: String,
        last_processed_cursor: u64,
        idempotency_key: Option<String>,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: MAPPING_CONTRACT_VERSION,
            mapping_id,
            entity_id,
            tenant_id,
            enabled,
            source_url,
            last_processed_cursor,
            idempotency_key,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for MappingWriteInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != MAPPING_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "mapping_write_input.schema_version",
                reason: "must match MAPPING_CONTRACT_VERSION",
            });
        }
        self.mapping_id.validate()?;
        self.entity_id.validate()?;
        self.tenant_id.validate()?;
        validate_text("mapping_write_input.source_url", &self.source_url, 512)?;
        validate_opt_text(
            "mapping_write_input.idempotency_key",
            &self.idempotency_key,
            128,
        )?;
        Ok(())
    }
}

/// Links an entity to an external data source. At most one record per entity
/// may be enabled at any committed state; the store's partial-unique index is
/// the arbiter of that, not application code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRecord {
    pub schema_version: SchemaVersion,
    pub mapping_id: MappingId,
    pub entity_id: EntityId,
    pub tenant_id: TenantId,
    pub enabled: bool,
    pub source_url: String,
    pub last_processed_cursor: u64,
    pub created_at: MonotonicTimeNs,
    pub updated_at: MonotonicTimeNs,
}

impl MappingRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        mapping_id: MappingId,
        entity_id: EntityId,
        tenant_id: TenantId,
        enabled: bool,
        source_url: String,
        last_processed_cursor: u64,
        created_at: MonotonicTimeNs,
        updated_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: MAPPING_CONTRACT_VERSION,
            mapping_id,
            entity_id,
            tenant_id,
            enabled,
            source_url,
            last_processed_cursor,
            created_at,
            updated_at,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for MappingRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != MAPPING_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "mapping_record.schema_version",
                reason: "must match MAPPING_CONTRACT_VERSION",
            });
        }
        self.mapping_id.validate()?;
        self.entity_id.validate()?;
        self.tenant_id.validate()?;
        validate_text("mapping_record.source_url", &self.source_url, 512)?;
        if self.updated_at.0 < self.created_at.0 {
            return Err(ContractViolation::InvalidValue {
                field: "mapping_record.updated_at",
                reason: "must be >= created_at",
            });
        }
        Ok(())
    }
}

/// Deterministic survivor choice for collapsing a multiple-enabled state:
/// most recently updated wins, tie-broken by `created_at` descending, then
/// `mapping_id` descending.
pub fn collapse_survivor<'a>(rows: &[&'a MappingRecord]) -> Option<&'a MappingRecord> {
    rows.iter().copied().max_by(|a, b| {
        a.updated_at
            .cmp(&b.updated_at)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.mapping_id.cmp(&b.mapping_id))
    })
}

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::{validate_id, validate_opt_text};
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const ENTITY_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TenantId(String);

impl TenantId {
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

impl Validate for TenantId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_id("tenant_id", &self.0, 64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(String);

impl EntityId {
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

impl Validate for EntityId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_id("entity_id", &self.0, 64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityStatus {
    Active,
    Inactive,
    Suspended,
}

/// Reasons the activation gate, or the one-enabled-mapping storage constraint,
/// can refuse a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvariantKind {
    NoEnabledMapping,
    MultipleEnabledMappings,
    ActivationUrlMissing,
}

/// A tenant-owned entity (e.g. a seller's store).
///
/// `has_active_mapping` is a denormalized cache maintained by the mapping-sync
/// propagator; the mapping table is always the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub schema_version: SchemaVersion,
    pub tenant_id: TenantId,
    pub entity_id: EntityId,
    pub status: EntityStatus,
    pub activation_url: Option<String>,
    pub has_active_mapping: bool,
    pub created_at: MonotonicTimeNs,
    pub updated_at: MonotonicTimeNs,
}

impl EntityRecord {
    pub fn v1(
        tenant_id: TenantId,
        entity_id: EntityId,
        status: EntityStatus,
        activation_url: Option<String>,
        has_active_mapping: bool,
        created_at: MonotonicTimeNs,
        updated_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: ENTITY_CONTRACT_VERSION,
            tenant_id,
            entity_id,
            status,
            activation_url,
            has_active_mapping,
            created_at,
            updated_at,
        };
        r.validate()?;
        Ok(r)
    }

    pub fn activation_url_present(&self) -> bool {
        self.activation_url
            .as_deref()
            .map(|u| !u.trim().is_empty())
            .unwrap_or(false)
    }
}

impl Validate for EntityRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != ENTITY_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "entity_record.schema_version",
                reason: "must match ENTITY_CONTRACT_VERSION",
            });
        }
        self.tenant_id.validate()?;
        self.entity_id.validate()?;
        validate_opt_text("entity_record.activation_url", &self.activation_url, 512)?;
        if self.updated_at.0 < self.created_at.0 {
            return Err(ContractViolation::InvalidValue {
                field: "entity_record.updated_at",
                reason: "must be >= created_at",
            });
        }
        Ok(())
    }
}

#![forbid(unsafe_code)]

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::common::validate_opt_text;
use crate::tenant::{EntityId, TenantId};
use crate::{ContractViolation, DayStamp, MonotonicTimeNs, SchemaVersion, Validate};

pub const FACT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FactId(pub u64);

impl Validate for FactId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "fact_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

/// Order payload. `ai_confirmed` is classified by the producing write API
/// before the fact reaches this engine; it is consumed here as a plain flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFact {
    pub amount: Decimal,
    pub ai_confirmed: bool,
}

impl Validate for OrderFact {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.amount < Decimal::ZERO {
            return Err(ContractViolation::InvalidValue {
                field: "order_fact.amount",
                reason: "must be >= 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FactBody {
    Order(OrderFact),
    Conversation,
}

impl Validate for FactBody {
    fn validate(&self) -> Result<(), ContractViolation> {
        match self {
            FactBody::Order(o) => o.validate(),
            FactBody::Conversation => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactWriteInput {
    pub schema_version: SchemaVersion,
    /// Declared by the caller; the store never trusts it and always stamps the
    /// owning entity's tenant instead.
    pub tenant_id: TenantId,
    pub entity_id: EntityId,
    pub occurred_at: MonotonicTimeNs,
    pub body: FactBody,
    pub idempotency_key: Option<String>,
}

impl FactWriteInput {
    pub fn v1(
        tenant_id: TenantId,
        entity_id: EntityId,
        occurred_at: MonotonicTimeNs,
        body: FactBody,
        idempotency_key: Option<String>,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: FACT_CONTRACT_VERSION,
            tenant_id,
            entity_id,
            occurred_at,
            body,
            idempotency_key,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for FactWriteInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != FACT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "fact_write_input.schema_version",
                reason: "must match FACT_CONTRACT_VERSION",
            });
        }
        self.tenant_id.validate()?;
        self.entity_id.validate()?;
        self.body.validate()?;
        validate_opt_text(
            "fact_write_input.idempotency_key",
            &self.idempotency_key,
            128,
        )?;
        Ok(())
    }
}

/// A committed raw business event. Append-only: the only permitted mutation is
/// the order `ai_confirmed` flag. `ai_confirmed_at` records the first
/// `false -> true` transition and never clears, so the confirmation counter
/// increments at most once per order regardless of later flips.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactRecord {
    pub schema_version: SchemaVersion,
    pub fact_id: FactId,
    pub tenant_id: TenantId,
    pub entity_id: EntityId,
    pub occurred_at: MonotonicTimeNs,
    pub body: FactBody,
    pub ai_confirmed_at: Option<MonotonicTimeNs>,
    pub created_at: MonotonicTimeNs,
}

impl FactRecord {
    pub fn from_input_v1(
        fact_id: FactId,
        input: FactWriteInput,
        stamped_tenant_id: TenantId,
        created_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let ai_confirmed_at = match input.body {
            FactBody::Order(o) if o.ai_confirmed => Some(created_at),
            _ => None,
        };
        let r = Self {
            schema_version: FACT_CONTRACT_VERSION,
            fact_id,
            tenant_id: stamped_tenant_id,
            entity_id: input.entity_id,
            occurred_at: input.occurred_at,
            body: input.body,
            ai_confirmed_at,
            created_at,
        };
        r.validate()?;
        Ok(r)
    }

    pub fn day(&self) -> DayStamp {
        DayStamp::from_time(self.occurred_at)
    }

    pub fn order(&self) -> Option<&OrderFact> {
        match &self.body {
            FactBody::Order(o) => Some(o),
            FactBody::Conversation => None,
        }
    }

    /// True when the order was ever confirmed, independent of the current flag.
    pub fn ever_confirmed(&self) -> bool {
        self.ai_confirmed_at.is_some()
    }
}

impl Validate for FactRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != FACT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "fact_record.schema_version",
                reason: "must match FACT_CONTRACT_VERSION",
            });
        }
        self.fact_id.validate()?;
        self.tenant_id.validate()?;
        self.entity_id.validate()?;
        self.body.validate()?;
        if self.ai_confirmed_at.is_some() && matches!(self.body, FactBody::Conversation) {
            return Err(ContractViolation::InvalidValue {
                field: "fact_record.ai_confirmed_at",
                reason: "only order facts carry a confirmation timestamp",
            });
        }
        Ok(())
    }
}

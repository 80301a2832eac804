#![forbid(unsafe_code)]

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::tenant::{EntityId, TenantId};
use crate::{ContractViolation, DayStamp, SchemaVersion, Validate};

pub const ROLLUP_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// Daily rollup row, unique per `(tenant_id, entity_id, day)`. Every counter
/// is non-negative at every committed state; writes only ever add clamped
/// non-negative deltas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupRecord {
    pub schema_version: SchemaVersion,
    pub tenant_id: TenantId,
    pub entity_id: EntityId,
    pub day: DayStamp,
    pub impressions: u64,
    pub conversations: u64,
    pub ai_confirmations: u64,
    pub orders_count: u64,
    pub revenue: Decimal,
}

impl RollupRecord {
    pub fn zero_baseline(tenant_id: TenantId, entity_id: EntityId, day: DayStamp) -> Self {
        Self {
            schema_version: ROLLUP_CONTRACT_VERSION,
            tenant_id,
            entity_id,
            day,
            impressions: 0,
            conversations: 0,
            ai_confirmations: 0,
            orders_count: 0,
            revenue: Decimal::ZERO,
        }
    }
}

impl Validate for RollupRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != ROLLUP_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "rollup_record.schema_version",
                reason: "must match ROLLUP_CONTRACT_VERSION",
            });
        }
        self.tenant_id.validate()?;
        self.entity_id.validate()?;
        if self.revenue < Decimal::ZERO {
            return Err(ContractViolation::InvalidValue {
                field: "rollup_record.revenue",
                reason: "must be >= 0",
            });
        }
        Ok(())
    }
}

/// Signed rollup increment. Counter deltas are signed so a mis-computed
/// negative delta can be detected and clamped to zero at the store boundary
/// instead of driving a counter negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RollupDelta {
    pub impressions: i64,
    pub conversations: i64,
    pub ai_confirmations: i64,
    pub orders_count: i64,
    pub revenue: Decimal,
}

impl RollupDelta {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        self.impressions == 0
            && self.conversations == 0
            && self.ai_confirmations == 0
            && self.orders_count == 0
            && self.revenue == Decimal::ZERO
    }

    pub fn has_negative_component(&self) -> bool {
        self.impressions < 0
            || self.conversations < 0
            || self.ai_confirmations < 0
            || self.orders_count < 0
            || self.revenue < Decimal::ZERO
    }

    /// Negative components are dropped, never applied.
    pub fn clamped_non_negative(&self) -> Self {
        Self {
            impressions: self.impressions.max(0),
            conversations: self.conversations.max(0),
            ai_confirmations: self.ai_confirmations.max(0),
            orders_count: self.orders_count.max(0),
            revenue: self.revenue.max(Decimal::ZERO),
        }
    }
}

#![forbid(unsafe_code)]

use crate::audit::AuditEventInput;
use crate::rollup::RollupDelta;
use crate::tenant::{EntityId, TenantId};
use crate::{ContractViolation, DayStamp, Validate};

/// One rollup increment addressed at its `(tenant, entity, day)` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupDeltaAt {
    pub tenant_id: TenantId,
    pub entity_id: EntityId,
    pub day: DayStamp,
    pub delta: RollupDelta,
}

/// Recomputed value for an entity's denormalized `has_active_mapping` flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagUpdate {
    pub tenant_id: TenantId,
    pub entity_id: EntityId,
    pub has_active_mapping: bool,
}

/// Staged side effects of one triggering write. Hooks accumulate effects
/// against the pre-write store state; the store then applies the primary write
/// and every staged effect in a single commit, so a failing mandatory hook
/// leaves nothing applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteEffects {
    pub rollup_deltas: Vec<RollupDeltaAt>,
    pub flag_updates: Vec<FlagUpdate>,
    pub audit_events: Vec<AuditEventInput>,
}

impl WriteEffects {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rollup_deltas.is_empty()
            && self.flag_updates.is_empty()
            && self.audit_events.is_empty()
    }
}

impl Validate for WriteEffects {
    fn validate(&self) -> Result<(), ContractViolation> {
        for d in &self.rollup_deltas {
            d.tenant_id.validate()?;
            d.entity_id.validate()?;
        }
        for f in &self.flag_updates {
            f.tenant_id.validate()?;
            f.entity_id.validate()?;
        }
        for a in &self.audit_events {
            a.validate()?;
        }
        Ok(())
    }
}

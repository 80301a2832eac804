#![forbid(unsafe_code)]

use meridian_kernel_contracts::effects::RollupDeltaAt;
use meridian_kernel_contracts::fact::{FactBody, FactRecord};
use meridian_kernel_contracts::rollup::RollupDelta;
use meridian_kernel_contracts::{ContractViolation, ReasonCodeId};

pub mod reason_codes {
    use meridian_kernel_contracts::ReasonCodeId;

    // Rollup reason-code namespace. Values are placeholders until global registry lock.
    pub const ROLLUP_OK_FACT_DELTA: ReasonCodeId = ReasonCodeId(0x524C_0001);
    pub const ROLLUP_OK_CONFIRMATION_DELTA: ReasonCodeId = ReasonCodeId(0x524C_0002);
    pub const ROLLUP_NOOP_NO_COUNTER_IMPACT: ReasonCodeId = ReasonCodeId(0x524C_0003);
    pub const ROLLUP_NOOP_ALREADY_COUNTED: ReasonCodeId = ReasonCodeId(0x524C_0004);

    pub const ROLLUP_NEGATIVE_DELTA_CLAMPED: ReasonCodeId = ReasonCodeId(0x524C_0010);
    pub const ROLLUP_REBUILT_FROM_LEDGER: ReasonCodeId = ReasonCodeId(0x524C_0020);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollupConfig {
    /// Upper bound on staged deltas a single triggering write may carry.
    pub max_deltas_per_commit: u8,
}

impl RollupConfig {
    pub fn mvp_v1() -> Self {
        Self {
            max_deltas_per_commit: 8,
        }
    }
}

/// Outcome of mapping one ledger event onto the daily rollup projection.
#[derive(Debug, Clone, PartialEq)]
pub enum RollupDecision {
    Apply {
        delta_at: RollupDeltaAt,
        reason_code: ReasonCodeId,
    },
    Noop {
        reason_code: ReasonCodeId,
    },
}

impl RollupDecision {
    pub fn delta_at(&self) -> Option<&RollupDeltaAt> {
        match self {
            RollupDecision::Apply { delta_at, .. } => Some(delta_at),
            RollupDecision::Noop { .. } => None,
        }
    }

    pub fn reason_code(&self) -> ReasonCodeId {
        match self {
            RollupDecision::Apply { reason_code, .. } => *reason_code,
            RollupDecision::Noop { reason_code } => *reason_code,
        }
    }
}

/// Pure incremental aggregator: given the committed-shape of a ledger event it
/// emits the single rollup delta that event is worth, keyed by the fact's
/// occurrence day. It never reads or mutates storage; the store applies the
/// staged delta in the same commit as the triggering write.
#[derive(Debug, Clone)]
pub struct RollupRuntime {
    config: RollupConfig,
}

impl RollupRuntime {
    pub fn new(config: RollupConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RollupConfig {
        &self.config
    }

    /// Refuse a staged delta set that blows the per-commit budget. Checked
    /// before the store sees the effects, so an over-staged commit never
    /// partially applies.
    pub fn ensure_delta_budget(&self, deltas: &[RollupDeltaAt]) -> Result<(), ContractViolation> {
        if deltas.len() > self.config.max_deltas_per_commit as usize {
            return Err(ContractViolation::InvalidValue {
                field: "rollup_deltas",
                reason: "staged delta count exceeds per-commit budget",
            });
        }
        Ok(())
    }

    /// Delta for a fact entering the ledger. Orders contribute the order
    /// counter, revenue, and (when pre-classified confirmed) the confirmation
    /// counter; conversations contribute the conversation counter.
    pub fn delta_for_fact_insert(&self, record: &FactRecord) -> RollupDecision {
        let delta = match &record.body {
            FactBody::Order(o) => RollupDelta {
                orders_count: 1,
                ai_confirmations: if record.ever_confirmed() { 1 } else { 0 },
                revenue: o.amount,
                ..RollupDelta::none()
            },
            FactBody::Conversation => RollupDelta {
                conversations: 1,
                ..RollupDelta::none()
            },
        };
        if delta.is_zero() {
            return RollupDecision::Noop {
                reason_code: reason_codes::ROLLUP_NOOP_NO_COUNTER_IMPACT,
            };
        }
        RollupDecision::Apply {
            delta_at: RollupDeltaAt {
                tenant_id: record.tenant_id.clone(),
                entity_id: record.entity_id.clone(),
                day: record.day(),
                delta,
            },
            reason_code: reason_codes::ROLLUP_OK_FACT_DELTA,
        }
    }

    /// Delta for an order confirmation flip, evaluated against the pre-write
    /// record. Only the first `false -> true` transition is worth a counter
    /// increment; later flips in either direction are no-ops.
    pub fn delta_for_order_confirmation(
        &self,
        record_before: &FactRecord,
        ai_confirmed: bool,
    ) -> RollupDecision {
        if record_before.order().is_none() {
            return RollupDecision::Noop {
                reason_code: reason_codes::ROLLUP_NOOP_NO_COUNTER_IMPACT,
            };
        }
        if !ai_confirmed || record_before.ever_confirmed() {
            return RollupDecision::Noop {
                reason_code: reason_codes::ROLLUP_NOOP_ALREADY_COUNTED,
            };
        }
        RollupDecision::Apply {
            delta_at: RollupDeltaAt {
                tenant_id: record_before.tenant_id.clone(),
                entity_id: record_before.entity_id.clone(),
                day: record_before.day(),
                delta: RollupDelta {
                    ai_confirmations: 1,
                    ..RollupDelta::none()
                },
            },
            reason_code: reason_codes::ROLLUP_OK_CONFIRMATION_DELTA,
        }
    }
}

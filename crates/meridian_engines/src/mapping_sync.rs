#![forbid(unsafe_code)]

use meridian_kernel_contracts::ReasonCodeId;

pub mod reason_codes {
    use meridian_kernel_contracts::ReasonCodeId;

    // Mapping-sync reason-code namespace. Values are placeholders until global registry lock.
    pub const MAPPING_SYNC_FLAG_SET: ReasonCodeId = ReasonCodeId(0x4D53_0001);
    pub const MAPPING_SYNC_FLAG_CLEARED: ReasonCodeId = ReasonCodeId(0x4D53_0002);

    pub const MAPPING_SYNC_LOCK_TIMEOUT_STALE_FLAG: ReasonCodeId = ReasonCodeId(0x4D53_0010);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingSyncConfig {
    /// How long the propagator waits for the entity flag lock before it gives
    /// up and leaves the flag stale.
    pub lock_wait_ms: u32,
}

impl MappingSyncConfig {
    pub fn mvp_v1() -> Self {
        Self { lock_wait_ms: 2000 }
    }
}

/// What the propagator sees after a mapping write has committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingSyncObservation {
    pub enabled_mapping_count: usize,
    pub lock_acquired: bool,
}

/// Decision of one propagation attempt. `StaleFlagWarn` degrades instead of
/// failing: the triggering mapping write has already committed, so the flag is
/// left as-is and the miss is recorded at Warn severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationDecision {
    SetFlag {
        has_active_mapping: bool,
        reason_code: ReasonCodeId,
    },
    StaleFlagWarn {
        reason_code: ReasonCodeId,
    },
}

impl PropagationDecision {
    pub fn reason_code(&self) -> ReasonCodeId {
        match self {
            PropagationDecision::SetFlag { reason_code, .. } => *reason_code,
            PropagationDecision::StaleFlagWarn { reason_code } => *reason_code,
        }
    }
}

/// Pure mapping-sync propagator: derives the denormalized
/// `has_active_mapping` flag from the enabled-mapping count. The mapping
/// table stays the source of truth; this only refreshes the cache.
#[derive(Debug, Clone)]
pub struct MappingSyncRuntime {
    config: MappingSyncConfig,
}

impl MappingSyncRuntime {
    pub fn new(config: MappingSyncConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MappingSyncConfig {
        &self.config
    }

    pub fn evaluate(&self, obs: &MappingSyncObservation) -> PropagationDecision {
        if !obs.lock_acquired {
            return PropagationDecision::StaleFlagWarn {
                reason_code: reason_codes::MAPPING_SYNC_LOCK_TIMEOUT_STALE_FLAG,
            };
        }
        let has_active_mapping = obs.enabled_mapping_count > 0;
        PropagationDecision::SetFlag {
            has_active_mapping,
            reason_code: if has_active_mapping {
                reason_codes::MAPPING_SYNC_FLAG_SET
            } else {
                reason_codes::MAPPING_SYNC_FLAG_CLEARED
            },
        }
    }
}

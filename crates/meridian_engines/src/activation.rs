#![forbid(unsafe_code)]

use meridian_kernel_contracts::tenant::InvariantKind;
use meridian_kernel_contracts::ReasonCodeId;

pub mod reason_codes {
    use meridian_kernel_contracts::ReasonCodeId;

    // Activation-gate reason-code namespace. Values are placeholders until global registry lock.
    pub const ACTIVATION_OK: ReasonCodeId = ReasonCodeId(0x4147_0001);

    pub const ACTIVATION_NO_ENABLED_MAPPING: ReasonCodeId = ReasonCodeId(0x4147_0010);
    pub const ACTIVATION_MULTIPLE_ENABLED_MAPPINGS: ReasonCodeId = ReasonCodeId(0x4147_0011);
    pub const ACTIVATION_URL_MISSING: ReasonCodeId = ReasonCodeId(0x4147_0012);
}

/// What the gate sees of an entity at evaluation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationObservation {
    pub enabled_mapping_count: usize,
    pub activation_url_present: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationDecision {
    Pass {
        reason_code: ReasonCodeId,
    },
    Refuse {
        kind: InvariantKind,
        reason_code: ReasonCodeId,
    },
}

impl ActivationDecision {
    pub fn passed(&self) -> bool {
        matches!(self, ActivationDecision::Pass { .. })
    }

    pub fn reason_code(&self) -> ReasonCodeId {
        match self {
            ActivationDecision::Pass { reason_code } => *reason_code,
            ActivationDecision::Refuse { reason_code, .. } => *reason_code,
        }
    }
}

/// Pure activation gate: an entity may go Active only with exactly one enabled
/// mapping and a usable activation url. The mapping count is checked before
/// the url so a broken mapping state is surfaced first.
#[derive(Debug, Clone, Default)]
pub struct ActivationGateRuntime;

impl ActivationGateRuntime {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(&self, obs: &ActivationObservation) -> ActivationDecision {
        if obs.enabled_mapping_count == 0 {
            return ActivationDecision::Refuse {
                kind: InvariantKind::NoEnabledMapping,
                reason_code: reason_codes::ACTIVATION_NO_ENABLED_MAPPING,
            };
        }
        if obs.enabled_mapping_count > 1 {
            return ActivationDecision::Refuse {
                kind: InvariantKind::MultipleEnabledMappings,
                reason_code: reason_codes::ACTIVATION_MULTIPLE_ENABLED_MAPPINGS,
            };
        }
        if !obs.activation_url_present {
            return ActivationDecision::Refuse {
                kind: InvariantKind::ActivationUrlMissing,
                reason_code: reason_codes::ACTIVATION_URL_MISSING,
            };
        }
        ActivationDecision::Pass {
            reason_code: reason_codes::ACTIVATION_OK,
        }
    }
}

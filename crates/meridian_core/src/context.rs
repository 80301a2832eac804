#![forbid(unsafe_code)]

use meridian_kernel_contracts::tenant::TenantId;

/// What a context is currently scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantScope {
    /// No tenant selected. Permits nothing; reads come back empty.
    Unset,
    /// Scoped to one tenant.
    Tenant(TenantId),
    /// Maintenance scope: sees every tenant. Reserved for rebuilds and
    /// repairs, never for request-path reads.
    Bypass,
}

/// Explicit tenant scoping, passed by value to every read. There is no
/// ambient thread-local fallback: an operation that needs a tenant takes a
/// `&TenantContext` argument, so the scope a read ran under is always visible
/// at the call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    scope: TenantScope,
}

impl TenantContext {
    pub fn unset() -> Self {
        Self {
            scope: TenantScope::Unset,
        }
    }

    pub fn for_tenant(tenant_id: TenantId) -> Self {
        Self {
            scope: TenantScope::Tenant(tenant_id),
        }
    }

    pub fn bypass() -> Self {
        Self {
            scope: TenantScope::Bypass,
        }
    }

    pub fn set(&mut self, tenant_id: TenantId) {
        self.scope = TenantScope::Tenant(tenant_id);
    }

    pub fn set_bypass(&mut self) {
        self.scope = TenantScope::Bypass;
    }

    pub fn clear(&mut self) {
        self.scope = TenantScope::Unset;
    }

    pub fn scope(&self) -> &TenantScope {
        &self.scope
    }

    pub fn tenant_id(&self) -> Option<&TenantId> {
        match &self.scope {
            TenantScope::Tenant(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_set(&self) -> bool {
        self.scope != TenantScope::Unset
    }

    pub fn is_bypass(&self) -> bool {
        self.scope == TenantScope::Bypass
    }

    /// Whether rows of the given tenant are visible under this context.
    pub fn permits(&self, tenant_id: &TenantId) -> bool {
        match &self.scope {
            TenantScope::Unset => false,
            TenantScope::Tenant(t) => t == tenant_id,
            TenantScope::Bypass => true,
        }
    }

    /// Run `f` with this context temporarily scoped to `tenant_id`. The prior
    /// scope is restored on exit even when `f` replaces the scope itself, so a
    /// scoped block can never leak its tenant into the caller.
    pub fn scoped<T>(&mut self, tenant_id: TenantId, f: impl FnOnce(&TenantContext) -> T) -> T {
        let previous = std::mem::replace(&mut self.scope, TenantScope::Tenant(tenant_id));
        let out = f(self);
        self.scope = previous;
        out
    }
}

impl Default for TenantContext {
    fn default() -> Self {
        Self::unset()
    }
}

//! Security context
//!
//! The triple (user_id, app_id, domain) supplied by the transport per
//! request. Stamped on creation, checked on read/write for non-system
//! classes.

use crate::core::record::{Record, APP_ID, DOMAIN, OWNER_ID};

/// Per-request security context
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityContext {
    /// Authenticated caller, stamped as owner_id on create
    pub user_id: Option<String>,
    /// Application the caller operates under
    pub app_id: Option<String>,
    /// Tenant domain
    pub domain: Option<String>,
    /// Administrative mode: suppress owner-based filtering
    pub disable_ownership: bool,
    /// Seeding mode: permit caller-supplied ids on create
    pub allow_custom_ids: bool,
}

impl SecurityContext {
    /// Context for an authenticated caller
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    /// Administrative context: sees everything, may supply ids
    pub fn system() -> Self {
        Self {
            disable_ownership: true,
            allow_custom_ids: true,
            ..Self::default()
        }
    }

    /// Unauthenticated context
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_app(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Whether ownership stamps apply to writes made under this context
    pub fn is_active(&self) -> bool {
        !self.disable_ownership
            && (self.user_id.is_some() || self.app_id.is_some() || self.domain.is_some())
    }

    /// Stamp owner_id/app_id/domain onto a freshly created record
    pub fn stamp(&self, record: &mut Record) {
        if !self.is_active() {
            return;
        }
        if let Some(user_id) = &self.user_id {
            record.set(OWNER_ID, user_id.clone().into());
        }
        if let Some(app_id) = &self.app_id {
            record.set(APP_ID, app_id.clone().into());
        }
        if let Some(domain) = &self.domain {
            record.set(DOMAIN, domain.clone().into());
        }
    }

    /// Whether a stored record is visible to this context.
    ///
    /// A record is invisible when it carries a stamp that differs from
    /// the caller's. Unstamped records are visible to everyone.
    pub fn can_access(&self, record: &Record) -> bool {
        if self.disable_ownership {
            return true;
        }
        for (field, own) in [
            (OWNER_ID, &self.user_id),
            (APP_ID, &self.app_id),
            (DOMAIN, &self.domain),
        ] {
            if let Some(stamp) = record.get(field).and_then(|v| v.as_str()) {
                if own.as_deref() != Some(stamp) {
                    return false;
                }
            }
        }
        true
    }
}

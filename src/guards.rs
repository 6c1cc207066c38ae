//! Route guards.
//!
//! Each screen declares a `RouteAccess`; `navigate` runs the guard pipeline
//! (authentication, authorization, default landing, store scope) against the
//! current session and returns where the UI should go. The first redirect
//! wins. A denial is a `Navigation::Redirect`, never an error.

use serde::Serialize;
use std::fmt;

use crate::auth::Session;
use crate::permissions::{Action, Feature, PermissionEvaluator, Resource, Role};

pub const LOGIN_PATH: &str = "/login";
pub const DASHBOARD_PATH: &str = "/dashboard";
pub const KITCHEN_PATH: &str = "/kitchen";
pub const POS_PATH: &str = "/pos";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectReason {
    Unauthorized,
    StoreAccessDenied,
}

impl RedirectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RedirectReason::Unauthorized => "unauthorized",
            RedirectReason::StoreAccessDenied => "store_access_denied",
        }
    }
}

impl fmt::Display for RedirectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Navigation {
    Allow,
    Redirect {
        to: String,
        error: Option<RedirectReason>,
    },
}

impl Navigation {
    fn redirect(to: impl Into<String>, error: Option<RedirectReason>) -> Self {
        Navigation::Redirect {
            to: to.into(),
            error,
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Navigation::Allow)
    }

    /// Target with the error flag appended as `error=<reason>`.
    pub fn location(&self) -> Option<String> {
        match self {
            Navigation::Allow => None,
            Navigation::Redirect { to, error: None } => Some(to.clone()),
            Navigation::Redirect {
                to,
                error: Some(reason),
            } => {
                let sep = if to.contains('?') { '&' } else { '?' };
                Some(format!("{to}{sep}error={reason}"))
            }
        }
    }
}

/// Declarative access rules for one route.
///
/// Authorization uses the first rule present, in this order: `permission`,
/// `resource_action`, `roles`, `min_role`, `feature`, `any_permissions`,
/// `all_permissions`. A route with none of them only needs a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteAccess {
    pub public: bool,
    pub requires_auth: bool,
    pub permission: Option<String>,
    pub resource_action: Option<(Resource, Action)>,
    pub roles: Vec<Role>,
    pub min_role: Option<Role>,
    pub feature: Option<Feature>,
    pub any_permissions: Vec<String>,
    pub all_permissions: Vec<String>,
    pub store_scoped: bool,
}

impl Default for RouteAccess {
    fn default() -> Self {
        Self {
            public: false,
            requires_auth: true,
            permission: None,
            resource_action: None,
            roles: Vec::new(),
            min_role: None,
            feature: None,
            any_permissions: Vec::new(),
            all_permissions: Vec::new(),
            store_scoped: false,
        }
    }
}

impl RouteAccess {
    pub fn public() -> Self {
        Self {
            public: true,
            requires_auth: false,
            ..Self::default()
        }
    }

    pub fn authenticated() -> Self {
        Self::default()
    }

    pub fn with_permission(mut self, key: impl Into<String>) -> Self {
        self.permission = Some(key.into());
        self
    }

    pub fn with_resource_action(mut self, resource: Resource, action: Action) -> Self {
        self.resource_action = Some((resource, action));
        self
    }

    pub fn with_roles(mut self, roles: &[Role]) -> Self {
        self.roles = roles.to_vec();
        self
    }

    pub fn with_min_role(mut self, role: Role) -> Self {
        self.min_role = Some(role);
        self
    }

    pub fn with_feature(mut self, feature: Feature) -> Self {
        self.feature = Some(feature);
        self
    }

    pub fn with_any_permissions(mut self, keys: &[&str]) -> Self {
        self.any_permissions = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_all_permissions(mut self, keys: &[&str]) -> Self {
        self.all_permissions = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn store_scoped(mut self) -> Self {
        self.store_scoped = true;
        self
    }

    fn has_rule(&self) -> bool {
        self.permission.is_some()
            || self.resource_action.is_some()
            || !self.roles.is_empty()
            || self.min_role.is_some()
            || self.feature.is_some()
            || !self.any_permissions.is_empty()
            || !self.all_permissions.is_empty()
    }

    fn needs_session(&self) -> bool {
        !self.public && (self.requires_auth || self.has_rule() || self.store_scoped)
    }

    /// Verdict of the highest-precedence rule present; `true` when there is
    /// none.
    pub fn authorize(&self, evaluator: &PermissionEvaluator) -> bool {
        if let Some(key) = &self.permission {
            evaluator.has_permission(key)
        } else if let Some((resource, action)) = self.resource_action {
            evaluator.has_resource_permission(resource, action)
        } else if !self.roles.is_empty() {
            evaluator.has_any_role(&self.roles)
        } else if let Some(role) = self.min_role {
            evaluator.has_min_role(role)
        } else if let Some(feature) = self.feature {
            evaluator.can_access_feature(feature)
        } else if !self.any_permissions.is_empty() {
            evaluator.has_any_permission(&self.any_permissions)
        } else if !self.all_permissions.is_empty() {
            evaluator.has_all_permissions(&self.all_permissions)
        } else {
            true
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub path: String,
    pub access: RouteAccess,
}

impl Route {
    pub fn new(path: impl Into<String>, access: RouteAccess) -> Self {
        Self {
            path: path.into(),
            access,
        }
    }
}

/// Where a role lands after login or when opening `/`.
pub fn landing_page(role: Role) -> &'static str {
    match role {
        Role::KitchenStaff => KITCHEN_PATH,
        Role::Cashier => POS_PATH,
        Role::SuperAdmin | Role::Admin | Role::Manager => DASHBOARD_PATH,
    }
}

fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Run the guard pipeline for `route`. `store_id` is the store the route is
/// being opened for, when it has one.
pub fn navigate(session: Option<&Session>, route: &Route, store_id: Option<&str>) -> Navigation {
    let access = &route.access;
    if access.public {
        return Navigation::Allow;
    }

    let Some(session) = session else {
        if access.needs_session() {
            return Navigation::redirect(
                format!("{LOGIN_PATH}?redirect={}", encode_query_value(&route.path)),
                None,
            );
        }
        return Navigation::Allow;
    };

    if !access.authorize(&session.evaluator()) {
        return Navigation::redirect(DASHBOARD_PATH, Some(RedirectReason::Unauthorized));
    }

    let landing = landing_page(session.role);
    if route.path == "/" {
        return Navigation::redirect(landing, None);
    }

    if access.store_scoped && session.role != Role::SuperAdmin {
        if let Some(requested) = store_id {
            if requested != session.store_id {
                return Navigation::redirect(landing, Some(RedirectReason::StoreAccessDenied));
            }
        }
    }

    Navigation::Allow
}

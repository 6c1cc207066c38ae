//! Role-based access control for staff sessions.
//!
//! Roles, permissions and feature lists are closed enums mapped through
//! static tables. `PermissionEvaluator` answers allow/deny questions for a
//! single (optional) role and has no state beyond that role, so identical
//! inputs always produce identical answers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SuperAdmin,
    Admin,
    Manager,
    Cashier,
    KitchenStaff,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::SuperAdmin,
        Role::Admin,
        Role::Manager,
        Role::Cashier,
        Role::KitchenStaff,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::SuperAdmin => "super_admin",
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Cashier => "cashier",
            Role::KitchenStaff => "kitchen_staff",
        }
    }

    /// Hierarchy rank; higher is more privileged.
    pub fn rank(self) -> u8 {
        match self {
            Role::SuperAdmin => 100,
            Role::Admin => 80,
            Role::Manager => 60,
            Role::Cashier => 40,
            Role::KitchenStaff => 20,
        }
    }

    /// Whether the role holds `permission`.
    pub fn grants(self, permission: Permission) -> bool {
        match self {
            Role::SuperAdmin => true,
            _ => self.permission_table().contains(&permission),
        }
    }

    /// Every permission the role holds.
    pub fn permissions(self) -> Vec<Permission> {
        match self {
            Role::SuperAdmin => Permission::all().collect(),
            _ => self.permission_table().to_vec(),
        }
    }

    pub fn features(self) -> &'static [Feature] {
        match self {
            Role::SuperAdmin => SUPER_ADMIN_FEATURES,
            Role::Admin => ADMIN_FEATURES,
            Role::Manager => MANAGER_FEATURES,
            Role::Cashier => CASHIER_FEATURES,
            Role::KitchenStaff => KITCHEN_FEATURES,
        }
    }

    pub fn restrictions(self) -> UiRestrictions {
        match self {
            Role::SuperAdmin | Role::Admin => UiRestrictions {
                can_void_orders: true,
                can_apply_discounts: true,
                can_issue_refunds: true,
                can_view_reports: true,
                can_manage_staff: true,
                can_edit_menu: true,
                can_access_settings: true,
                max_discount_percent: 100,
            },
            Role::Manager => UiRestrictions {
                can_void_orders: true,
                can_apply_discounts: true,
                can_issue_refunds: true,
                can_view_reports: true,
                can_manage_staff: false,
                can_edit_menu: true,
                can_access_settings: false,
                max_discount_percent: 50,
            },
            Role::Cashier => UiRestrictions {
                can_apply_discounts: true,
                max_discount_percent: 10,
                ..UiRestrictions::NONE
            },
            Role::KitchenStaff => UiRestrictions::NONE,
        }
    }

    fn permission_table(self) -> &'static [Permission] {
        match self {
            Role::SuperAdmin => &[],
            Role::Admin => ADMIN_PERMISSIONS,
            Role::Manager => MANAGER_PERMISSIONS,
            Role::Cashier => CASHIER_PERMISSIONS,
            Role::KitchenStaff => KITCHEN_PERMISSIONS,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Role::ALL
            .into_iter()
            .find(|r| r.as_str() == normalized)
            .ok_or_else(|| format!("unknown role: {s}"))
    }
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Orders,
    Kitchen,
    Menu,
    Payments,
    Discounts,
    Customers,
    Reports,
    Staff,
    Stores,
    Settings,
    Sync,
}

impl Resource {
    pub const ALL: [Resource; 11] = [
        Resource::Orders,
        Resource::Kitchen,
        Resource::Menu,
        Resource::Payments,
        Resource::Discounts,
        Resource::Customers,
        Resource::Reports,
        Resource::Staff,
        Resource::Stores,
        Resource::Settings,
        Resource::Sync,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Resource::Orders => "orders",
            Resource::Kitchen => "kitchen",
            Resource::Menu => "menu",
            Resource::Payments => "payments",
            Resource::Discounts => "discounts",
            Resource::Customers => "customers",
            Resource::Reports => "reports",
            Resource::Staff => "staff",
            Resource::Stores => "stores",
            Resource::Settings => "settings",
            Resource::Sync => "sync",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Read,
    Create,
    Update,
    Delete,
    Manage,
}

impl Action {
    pub const ALL: [Action; 5] = [
        Action::Read,
        Action::Create,
        Action::Update,
        Action::Delete,
        Action::Manage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Manage => "manage",
        }
    }
}

/// A `resource:action` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub resource: Resource,
    pub action: Action,
}

impl Permission {
    pub const fn new(resource: Resource, action: Action) -> Self {
        Self { resource, action }
    }

    pub fn all() -> impl Iterator<Item = Permission> {
        Resource::ALL
            .into_iter()
            .flat_map(|r| Action::ALL.into_iter().map(move |a| Permission::new(r, a)))
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource.as_str(), self.action.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (resource, action) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("permission must be resource:action, got {s}"))?;
        let resource = Resource::ALL
            .into_iter()
            .find(|r| r.as_str() == resource)
            .ok_or_else(|| format!("unknown resource: {resource}"))?;
        let action = Action::ALL
            .into_iter()
            .find(|a| a.as_str() == action)
            .ok_or_else(|| format!("unknown action: {action}"))?;
        Ok(Permission::new(resource, action))
    }
}

use Action as A;
use Resource as R;

const KITCHEN_PERMISSIONS: &[Permission] = &[
    Permission::new(R::Orders, A::Read),
    Permission::new(R::Orders, A::Update),
    Permission::new(R::Kitchen, A::Read),
    Permission::new(R::Kitchen, A::Update),
    Permission::new(R::Menu, A::Read),
];

const CASHIER_PERMISSIONS: &[Permission] = &[
    Permission::new(R::Orders, A::Read),
    Permission::new(R::Orders, A::Create),
    Permission::new(R::Orders, A::Update),
    Permission::new(R::Kitchen, A::Read),
    Permission::new(R::Menu, A::Read),
    Permission::new(R::Payments, A::Read),
    Permission::new(R::Payments, A::Create),
    Permission::new(R::Discounts, A::Create),
    Permission::new(R::Customers, A::Read),
    Permission::new(R::Customers, A::Create),
];

const MANAGER_PERMISSIONS: &[Permission] = &[
    Permission::new(R::Orders, A::Read),
    Permission::new(R::Orders, A::Create),
    Permission::new(R::Orders, A::Update),
    Permission::new(R::Orders, A::Delete),
    Permission::new(R::Kitchen, A::Read),
    Permission::new(R::Kitchen, A::Update),
    Permission::new(R::Menu, A::Read),
    Permission::new(R::Menu, A::Update),
    Permission::new(R::Payments, A::Read),
    Permission::new(R::Payments, A::Create),
    Permission::new(R::Payments, A::Update),
    Permission::new(R::Discounts, A::Create),
    Permission::new(R::Discounts, A::Manage),
    Permission::new(R::Customers, A::Read),
    Permission::new(R::Customers, A::Create),
    Permission::new(R::Customers, A::Update),
    Permission::new(R::Reports, A::Read),
    Permission::new(R::Staff, A::Read),
    Permission::new(R::Sync, A::Read),
    Permission::new(R::Sync, A::Manage),
];

const ADMIN_PERMISSIONS: &[Permission] = &[
    Permission::new(R::Orders, A::Read),
    Permission::new(R::Orders, A::Create),
    Permission::new(R::Orders, A::Update),
    Permission::new(R::Orders, A::Delete),
    Permission::new(R::Orders, A::Manage),
    Permission::new(R::Kitchen, A::Read),
    Permission::new(R::Kitchen, A::Update),
    Permission::new(R::Menu, A::Read),
    Permission::new(R::Menu, A::Create),
    Permission::new(R::Menu, A::Update),
    Permission::new(R::Menu, A::Delete),
    Permission::new(R::Payments, A::Read),
    Permission::new(R::Payments, A::Create),
    Permission::new(R::Payments, A::Update),
    Permission::new(R::Discounts, A::Create),
    Permission::new(R::Discounts, A::Manage),
    Permission::new(R::Customers, A::Read),
    Permission::new(R::Customers, A::Create),
    Permission::new(R::Customers, A::Update),
    Permission::new(R::Customers, A::Delete),
    Permission::new(R::Reports, A::Read),
    Permission::new(R::Reports, A::Manage),
    Permission::new(R::Staff, A::Read),
    Permission::new(R::Staff, A::Create),
    Permission::new(R::Staff, A::Update),
    Permission::new(R::Staff, A::Delete),
    Permission::new(R::Stores, A::Read),
    Permission::new(R::Settings, A::Read),
    Permission::new(R::Settings, A::Update),
    Permission::new(R::Sync, A::Read),
    Permission::new(R::Sync, A::Manage),
];

// ---------------------------------------------------------------------------
// Features
// ---------------------------------------------------------------------------

/// Named UI sections, independent of fine-grained permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Dashboard,
    Pos,
    Orders,
    KitchenDisplay,
    Menu,
    Customers,
    Reports,
    Staff,
    SyncMonitor,
    Settings,
    Stores,
}

impl Feature {
    pub const ALL: [Feature; 11] = [
        Feature::Dashboard,
        Feature::Pos,
        Feature::Orders,
        Feature::KitchenDisplay,
        Feature::Menu,
        Feature::Customers,
        Feature::Reports,
        Feature::Staff,
        Feature::SyncMonitor,
        Feature::Settings,
        Feature::Stores,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Feature::Dashboard => "dashboard",
            Feature::Pos => "pos",
            Feature::Orders => "orders",
            Feature::KitchenDisplay => "kitchen_display",
            Feature::Menu => "menu",
            Feature::Customers => "customers",
            Feature::Reports => "reports",
            Feature::Staff => "staff",
            Feature::SyncMonitor => "sync_monitor",
            Feature::Settings => "settings",
            Feature::Stores => "stores",
        }
    }

    pub fn from_name(name: &str) -> Option<Feature> {
        let normalized = name.trim().to_ascii_lowercase().replace('-', "_");
        Feature::ALL.into_iter().find(|f| f.as_str() == normalized)
    }
}

const KITCHEN_FEATURES: &[Feature] = &[
    Feature::Dashboard,
    Feature::Orders,
    Feature::KitchenDisplay,
];

const CASHIER_FEATURES: &[Feature] = &[
    Feature::Dashboard,
    Feature::Pos,
    Feature::Orders,
    Feature::KitchenDisplay,
    Feature::Customers,
];

const MANAGER_FEATURES: &[Feature] = &[
    Feature::Dashboard,
    Feature::Pos,
    Feature::Orders,
    Feature::KitchenDisplay,
    Feature::Customers,
    Feature::Menu,
    Feature::Reports,
    Feature::Staff,
    Feature::SyncMonitor,
];

const ADMIN_FEATURES: &[Feature] = &[
    Feature::Dashboard,
    Feature::Pos,
    Feature::Orders,
    Feature::KitchenDisplay,
    Feature::Customers,
    Feature::Menu,
    Feature::Reports,
    Feature::Staff,
    Feature::SyncMonitor,
    Feature::Settings,
    Feature::Stores,
];

const SUPER_ADMIN_FEATURES: &[Feature] = &Feature::ALL;

/// Per-role UI switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiRestrictions {
    pub can_void_orders: bool,
    pub can_apply_discounts: bool,
    pub can_issue_refunds: bool,
    pub can_view_reports: bool,
    pub can_manage_staff: bool,
    pub can_edit_menu: bool,
    pub can_access_settings: bool,
    pub max_discount_percent: u8,
}

impl UiRestrictions {
    pub const NONE: UiRestrictions = UiRestrictions {
        can_void_orders: false,
        can_apply_discounts: false,
        can_issue_refunds: false,
        can_view_reports: false,
        can_manage_staff: false,
        can_edit_menu: false,
        can_access_settings: false,
        max_discount_percent: 0,
    };
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Allow/deny answers for one role. `None` denies everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionEvaluator {
    role: Option<Role>,
}

impl PermissionEvaluator {
    pub fn new(role: Option<Role>) -> Self {
        Self { role }
    }

    pub fn for_role(role: Role) -> Self {
        Self { role: Some(role) }
    }

    pub fn anonymous() -> Self {
        Self { role: None }
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    /// `permission_key` is `resource:action`; unparseable keys deny.
    pub fn has_permission(&self, permission_key: &str) -> bool {
        match permission_key.parse::<Permission>() {
            Ok(p) => self.grants(p),
            Err(_) => false,
        }
    }

    pub fn has_resource_permission(&self, resource: Resource, action: Action) -> bool {
        self.has_permission(&Permission::new(resource, action).to_string())
    }

    pub fn grants(&self, permission: Permission) -> bool {
        self.role.is_some_and(|r| r.grants(permission))
    }

    pub fn has_any_role(&self, roles: &[Role]) -> bool {
        self.role.is_some_and(|r| roles.contains(&r))
    }

    pub fn has_min_role(&self, required: Role) -> bool {
        self.role.is_some_and(|r| r.rank() >= required.rank())
    }

    pub fn can_access_feature(&self, feature: Feature) -> bool {
        self.role.is_some_and(|r| r.features().contains(&feature))
    }

    pub fn can_access_feature_by_name(&self, feature: &str) -> bool {
        Feature::from_name(feature).is_some_and(|f| self.can_access_feature(f))
    }

    pub fn has_any_permission<S: AsRef<str>>(&self, keys: &[S]) -> bool {
        keys.iter().any(|k| self.has_permission(k.as_ref()))
    }

    /// True for an empty list.
    pub fn has_all_permissions<S: AsRef<str>>(&self, keys: &[S]) -> bool {
        keys.iter().all(|k| self.has_permission(k.as_ref()))
    }

    pub fn restrictions(&self) -> UiRestrictions {
        self.role
            .map(Role::restrictions)
            .unwrap_or(UiRestrictions::NONE)
    }

    pub fn can_apply_discount(&self, percent: u8) -> bool {
        let r = self.restrictions();
        r.can_apply_discounts && percent <= r.max_discount_percent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_keys_parse_and_print() {
        let p: Permission = "orders:create".parse().unwrap();
        assert_eq!(p, Permission::new(Resource::Orders, Action::Create));
        assert_eq!(p.to_string(), "orders:create");
        assert!("orders".parse::<Permission>().is_err());
        assert!("orders:fly".parse::<Permission>().is_err());
        assert!("tables:read".parse::<Permission>().is_err());
    }

    #[test]
    fn role_parsing_accepts_kebab_case() {
        assert_eq!("kitchen-staff".parse::<Role>().unwrap(), Role::KitchenStaff);
        assert_eq!("SUPER_ADMIN".parse::<Role>().unwrap(), Role::SuperAdmin);
        assert!("owner".parse::<Role>().is_err());
    }

    #[test]
    fn cashier_permissions() {
        let eval = PermissionEvaluator::for_role(Role::Cashier);
        assert!(eval.has_permission("orders:create"));
        assert!(!eval.has_permission("orders:delete"));
        assert!(!eval.has_permission("settings:update"));
        assert!(!eval.has_permission("not-a-permission"));
        assert!(eval.has_resource_permission(Resource::Payments, Action::Create));
        assert!(!eval.has_resource_permission(Resource::Reports, Action::Read));
    }

    #[test]
    fn resource_permission_matches_string_form() {
        for role in Role::ALL {
            let eval = PermissionEvaluator::for_role(role);
            for p in Permission::all() {
                assert_eq!(
                    eval.has_resource_permission(p.resource, p.action),
                    eval.has_permission(&p.to_string()),
                    "{role} {p}"
                );
            }
        }
    }

    #[test]
    fn super_admin_holds_everything() {
        let eval = PermissionEvaluator::for_role(Role::SuperAdmin);
        assert!(Permission::all().all(|p| eval.grants(p)));
        assert!(Feature::ALL.iter().all(|f| eval.can_access_feature(*f)));
        assert_eq!(Role::SuperAdmin.permissions().len(), 55);
    }

    #[test]
    fn anonymous_denies_everything() {
        let eval = PermissionEvaluator::anonymous();
        assert!(!eval.has_permission("orders:read"));
        assert!(!eval.has_any_role(&Role::ALL));
        assert!(!eval.has_min_role(Role::KitchenStaff));
        assert!(!eval.can_access_feature_by_name("dashboard"));
        assert_eq!(eval.restrictions(), UiRestrictions::NONE);
    }

    #[test]
    fn min_role_follows_rank_order() {
        for holder in Role::ALL {
            for required in Role::ALL {
                let eval = PermissionEvaluator::for_role(holder);
                assert_eq!(
                    eval.has_min_role(required),
                    holder.rank() >= required.rank()
                );
            }
        }

        // A higher-ranked role passes every check a lower-ranked role passes.
        for higher in Role::ALL {
            for lower in Role::ALL.into_iter().filter(|l| l.rank() <= higher.rank()) {
                for required in Role::ALL {
                    if PermissionEvaluator::for_role(lower).has_min_role(required) {
                        assert!(PermissionEvaluator::for_role(higher).has_min_role(required));
                    }
                }
            }
        }
    }

    #[test]
    fn higher_roles_keep_lower_role_permissions() {
        let chain = [Role::Cashier, Role::Manager, Role::Admin, Role::SuperAdmin];
        for pair in chain.windows(2) {
            for p in pair[0].permissions() {
                assert!(pair[1].grants(p), "{} lost {p}", pair[1]);
            }
        }
    }

    #[test]
    fn any_and_all_permissions() {
        let eval = PermissionEvaluator::for_role(Role::KitchenStaff);
        assert!(eval.has_any_permission(&["orders:delete", "kitchen:update"]));
        assert!(!eval.has_any_permission(&["orders:delete", "reports:read"]));
        assert!(eval.has_all_permissions(&["orders:read", "kitchen:update"]));
        assert!(!eval.has_all_permissions(&["orders:read", "orders:create"]));

        let empty: [&str; 0] = [];
        assert!(!eval.has_any_permission(&empty));
        assert!(eval.has_all_permissions(&empty));
    }

    #[test]
    fn feature_access_by_name() {
        let eval = PermissionEvaluator::for_role(Role::KitchenStaff);
        assert!(eval.can_access_feature_by_name("kitchen_display"));
        assert!(eval.can_access_feature_by_name("kitchen-display"));
        assert!(!eval.can_access_feature_by_name("reports"));
        assert!(!eval.can_access_feature_by_name("floor_plan"));
    }

    #[test]
    fn has_any_role_is_membership() {
        let eval = PermissionEvaluator::for_role(Role::Manager);
        assert!(eval.has_any_role(&[Role::Cashier, Role::Manager]));
        assert!(!eval.has_any_role(&[Role::Admin, Role::SuperAdmin]));
    }

    #[test]
    fn evaluation_is_deterministic() {
        for role in Role::ALL {
            let a = PermissionEvaluator::for_role(role);
            let b = PermissionEvaluator::for_role(role);
            for p in Permission::all() {
                let key = p.to_string();
                assert_eq!(a.has_permission(&key), a.has_permission(&key));
                assert_eq!(a.has_permission(&key), b.has_permission(&key));
            }
        }
    }

    #[test]
    fn discount_caps() {
        let cashier = PermissionEvaluator::for_role(Role::Cashier);
        assert!(cashier.can_apply_discount(10));
        assert!(!cashier.can_apply_discount(15));
        assert!(!PermissionEvaluator::for_role(Role::KitchenStaff).can_apply_discount(1));
        assert!(PermissionEvaluator::for_role(Role::Admin).can_apply_discount(100));
    }
}

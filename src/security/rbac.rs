use serde::{Deserialize, Serialize};
use std::fmt;

/// Client roles, ordered by privilege
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer = 1,
    Operator = 2,
    Admin = 3,
}

impl Role {
    pub fn level(&self) -> u8 {
        *self as u8
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "viewer" => Some(Role::Viewer),
            "operator" => Some(Role::Operator),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Operator => "operator",
            Role::Admin => "admin",
        }
    }

    /// Permission names granted to this role, inherited upward
    pub fn permissions(&self) -> Vec<&'static str> {
        let mut permissions = vec!["view"];
        if *self >= Role::Operator {
            permissions.push("control");
        }
        if *self >= Role::Admin {
            permissions.push("admin");
        }
        permissions
    }

    /// `user_level >= required_level`
    pub fn satisfies(&self, required: Role) -> bool {
        self.level() >= required.level()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who may call a method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodAccess {
    /// Callable before authenticating
    Public,
    Requires(Role),
}

const METHOD_ACCESS: &[(&str, MethodAccess)] = &[
    ("ping", MethodAccess::Public),
    ("authenticate", MethodAccess::Public),
    ("get_camera_list", MethodAccess::Requires(Role::Viewer)),
    ("get_camera_status", MethodAccess::Requires(Role::Viewer)),
    ("get_camera_capabilities", MethodAccess::Requires(Role::Viewer)),
    ("get_streams", MethodAccess::Requires(Role::Viewer)),
    ("list_recordings", MethodAccess::Requires(Role::Viewer)),
    ("list_snapshots", MethodAccess::Requires(Role::Viewer)),
    ("get_recording_info", MethodAccess::Requires(Role::Viewer)),
    ("get_snapshot_info", MethodAccess::Requires(Role::Viewer)),
    ("get_recording_status", MethodAccess::Requires(Role::Viewer)),
    ("get_metrics", MethodAccess::Requires(Role::Viewer)),
    ("get_status", MethodAccess::Requires(Role::Viewer)),
    ("get_server_info", MethodAccess::Requires(Role::Viewer)),
    ("take_snapshot", MethodAccess::Requires(Role::Operator)),
    ("start_recording", MethodAccess::Requires(Role::Operator)),
    ("stop_recording", MethodAccess::Requires(Role::Operator)),
    ("subscribe_events", MethodAccess::Requires(Role::Operator)),
    ("unsubscribe_events", MethodAccess::Requires(Role::Operator)),
    ("get_storage_info", MethodAccess::Requires(Role::Admin)),
    ("get_subscription_stats", MethodAccess::Requires(Role::Admin)),
    ("delete_recording", MethodAccess::Requires(Role::Admin)),
    ("delete_snapshot", MethodAccess::Requires(Role::Admin)),
    ("cleanup_old_files", MethodAccess::Requires(Role::Admin)),
    ("set_retention_policy", MethodAccess::Requires(Role::Admin)),
];

/// Access rule for a method; `None` for methods the server does not know
pub fn method_access(method: &str) -> Option<MethodAccess> {
    METHOD_ACCESS
        .iter()
        .find(|(name, _)| *name == method)
        .map(|(_, access)| *access)
}

/// Every method the server dispatches
pub fn known_methods() -> impl Iterator<Item = &'static str> {
    METHOD_ACCESS.iter().map(|(name, _)| *name)
}

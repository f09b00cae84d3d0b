//! Participants, roles and the role → permission table.
//!
//! Identity and role are session-scoped persistent state. Presence lives in
//! [`crate::presence`] and is never stored here.

use serde::{Deserialize, Serialize};
use tandem_core::SiteId;
use uuid::Uuid;

use crate::presence::CursorColor;

bitflags::bitflags! {
    /// What a participant may do in a session.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Permissions: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const DELETE = 1 << 2;
        const SHARE = 1 << 3;
        const ADMIN = 1 << 4;
        const CHAT = 1 << 5;
        const VOICE = 1 << 6;
        const VIDEO = 1 << 7;
    }
}

/// Session role. Each role's permissions are a superset of the next one's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    Editor,
    Viewer,
    Guest,
}

impl Role {
    pub fn permissions(self) -> Permissions {
        match self {
            Role::Owner => Permissions::all(),
            Role::Admin => Permissions::all().difference(Permissions::ADMIN),
            Role::Editor => Permissions::READ | Permissions::WRITE | Permissions::CHAT,
            Role::Viewer => Permissions::READ | Permissions::CHAT,
            Role::Guest => Permissions::READ,
        }
    }

    /// Roles allowed to kick participants and change roles.
    pub fn can_moderate(self) -> bool {
        matches!(self, Role::Owner | Role::Admin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Editor => "editor",
            Role::Viewer => "viewer",
            Role::Guest => "guest",
        };
        f.write_str(name)
    }
}

/// A member of a session's roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub name: String,
    pub role: Role,
    /// Always `role.permissions()`; recomputed on role change.
    pub permissions: Permissions,
    /// Replica site of the participant's active connection.
    pub site: SiteId,
    pub color: CursorColor,
    /// Unix millis.
    pub joined_at: u64,
}

impl Participant {
    pub fn new(id: Uuid, name: impl Into<String>, role: Role, site: SiteId) -> Self {
        Self {
            id,
            name: name.into(),
            role,
            permissions: role.permissions(),
            site,
            color: CursorColor::from_uuid(id),
            joined_at: tandem_core::now_millis(),
        }
    }

    pub fn can(&self, required: Permissions) -> bool {
        self.permissions.contains(required)
    }

    pub fn set_role(&mut self, role: Role) {
        self.role = role;
        self.permissions = role.permissions();
    }
}

//! Half-connection classification

use std::fmt;

/// Which side of an end-to-end stream a half-connection serves.
///
/// At the relay each peer self-declares its role in the handshake; on the
/// satellites the role is fixed by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Up,
    Down,
    Unknown,
}

impl Role {
    pub fn opposite(self) -> Role {
        match self {
            Role::Up => Role::Down,
            Role::Down => Role::Up,
            Role::Unknown => Role::Unknown,
        }
    }

    /// Map a wire role tag onto a role. Unknown tags are a handshake error.
    pub fn from_tag(tag: u8) -> Option<Role> {
        match tag {
            backhaul_proto::ROLE_TAG_UP => Some(Role::Up),
            backhaul_proto::ROLE_TAG_DOWN => Some(Role::Down),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            Role::Up => backhaul_proto::ROLE_TAG_UP,
            Role::Down => backhaul_proto::ROLE_TAG_DOWN,
            Role::Unknown => 0,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Up => write!(f, "up"),
            Role::Down => write!(f, "down"),
            Role::Unknown => write!(f, "unknown"),
        }
    }
}

/// Lifecycle status of a half-connection. Strictly monotonic:
/// pending → connected → closed, and a half may skip connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Connected,
    Closed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Pending => write!(f, "pending"),
            Status::Connected => write!(f, "connected"),
            Status::Closed => write!(f, "closed"),
        }
    }
}

/// Snapshot of a half-connection handed to observer hooks.
#[derive(Debug, Clone)]
pub struct HalfInfo {
    pub id: u64,
    pub role: Role,
    pub group_id: u8,
    /// Status at the time of the event (for close events, the status the
    /// half had immediately before it closed).
    pub status: Status,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_tags() {
        assert_eq!(Role::from_tag(1), Some(Role::Up));
        assert_eq!(Role::from_tag(2), Some(Role::Down));
        assert_eq!(Role::from_tag(0), None);
        assert_eq!(Role::from_tag(3), None);

        assert_eq!(Role::Up.tag(), 1);
        assert_eq!(Role::Down.tag(), 2);
    }

    #[test]
    fn test_role_opposite() {
        assert_eq!(Role::Up.opposite(), Role::Down);
        assert_eq!(Role::Down.opposite(), Role::Up);
        assert_eq!(Role::Unknown.opposite(), Role::Unknown);
    }
}

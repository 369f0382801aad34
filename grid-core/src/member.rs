use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// Identifies one cluster participant. Id 0 is reserved and never assigned
/// to a live member.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct MemberId(pub u16);

impl MemberId {
    pub const INVALID: MemberId = MemberId(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Display for MemberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Product variant the member is running.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Edition {
    #[default]
    Community,
    Enterprise,
    Grid,
}

impl Edition {
    pub fn to_u8(self) -> u8 {
        match self {
            Edition::Community => 0,
            Edition::Enterprise => 1,
            Edition::Grid => 2,
        }
    }

    pub fn from_u8(n: u8) -> Option<Edition> {
        match n {
            0 => Some(Edition::Community),
            1 => Some(Edition::Enterprise),
            2 => Some(Edition::Grid),
            _ => None,
        }
    }
}

/// Identity of one cluster participant. The identity fields are immutable for
/// the lifetime of the member; a member that leaves and rejoins the cluster
/// comes back as a new `Member` with a new id.
#[derive(Debug, Clone, Eq, PartialEq, Hash, TypedBuilder)]
pub struct Member {
    pub id: MemberId,
    #[builder(setter(into))]
    pub cluster_name: String,
    pub socket_addr: SocketAddr,
    #[builder(default)]
    pub edition: Edition,
    /// Collocation key; members on the same machine share it.
    pub machine_id: u32,
}

impl Member {
    pub fn is_collocated(&self, other: &Member) -> bool {
        self.machine_id == other.machine_id
    }
}

impl Display for Member {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Member(Id={}, Address={}, MachineId={})",
            self.id, self.socket_addr, self.machine_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: u16, machine_id: u32) -> Member {
        Member::builder()
            .id(MemberId(id))
            .cluster_name("test")
            .socket_addr("127.0.0.1:7574".parse().unwrap())
            .machine_id(machine_id)
            .build()
    }

    #[test]
    fn test_collocation() {
        let a = member(1, 10);
        let b = member(2, 10);
        let c = member(3, 11);
        assert!(a.is_collocated(&b));
        assert!(!a.is_collocated(&c));
    }

    #[test]
    fn test_invalid_id() {
        assert!(!MemberId::INVALID.is_valid());
        assert!(MemberId(1).is_valid());
    }
}

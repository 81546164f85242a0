//! Cluster topology: the master's authoritative member list.
//!
//! Only the master holds a populated topology. The list always starts
//! with the master's own entry (self-registration) and grows as members
//! register; there is no removal.

use std::sync::Mutex;

use tracing::info;

use crate::error::{ClusterError, ClusterResult};
use crate::proto;

/// Kind of cluster participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberType {
    Master,
    Member,
}

impl MemberType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Member => "member",
        }
    }
}

impl std::str::FromStr for MemberType {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "master" => Ok(Self::Master),
            "member" => Ok(Self::Member),
            other => Err(ClusterError::Registration(format!("unknown member type {other:?}"))),
        }
    }
}

/// Immutable snapshot of a member exchanged over the registration protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub member_type: MemberType,
    pub member_addr: String,
    pub services: Vec<String>,
}

impl From<&MemberInfo> for proto::MemberInfo {
    fn from(info: &MemberInfo) -> Self {
        proto::MemberInfo {
            member_type: info.member_type.as_str().to_string(),
            member_addr: info.member_addr.clone(),
            services: info.services.clone(),
        }
    }
}

impl TryFrom<proto::MemberInfo> for MemberInfo {
    type Error = ClusterError;

    fn try_from(info: proto::MemberInfo) -> Result<Self, Self::Error> {
        Ok(MemberInfo {
            member_type: info.member_type.parse()?,
            member_addr: info.member_addr,
            services: info.services,
        })
    }
}

/// A topology entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub info: MemberInfo,
    pub is_master: bool,
}

/// Outcome of a successful registration.
#[derive(Debug, Clone)]
pub struct Registration {
    /// Member list at the instant of registration, including the registrant.
    pub members: Vec<MemberInfo>,
    /// Previously known non-master members that must hear about the registrant.
    pub peers: Vec<MemberInfo>,
}

/// The master's view of cluster membership.
///
/// Every mutation happens under one lock so concurrent registrations
/// never interleave and each response sees a consistent snapshot.
#[derive(Debug, Default)]
pub struct ClusterTopology {
    members: Mutex<Vec<Member>>,
}

impl ClusterTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the master's own entry. Never goes through the network.
    pub fn bootstrap_master(&self, info: MemberInfo) {
        let mut members = self.members.lock().expect("topology lock");
        info!(member_addr = %info.member_addr, services = info.services.len(), "master self-registered");
        members.push(Member {
            info,
            is_master: true,
        });
    }

    /// Append a newly registered member.
    ///
    /// Rejects a member whose address is already present.
    pub fn register(&self, info: MemberInfo) -> ClusterResult<Registration> {
        let mut members = self.members.lock().expect("topology lock");

        if members.iter().any(|m| m.info.member_addr == info.member_addr) {
            return Err(ClusterError::Registration(format!(
                "address {} has registered",
                info.member_addr
            )));
        }

        let peers = members
            .iter()
            .filter(|m| !m.is_master)
            .map(|m| m.info.clone())
            .collect();

        info!(member_addr = %info.member_addr, services = ?info.services, "new member registered");
        members.push(Member {
            info,
            is_master: false,
        });

        Ok(Registration {
            members: members.iter().map(|m| m.info.clone()).collect(),
            peers,
        })
    }

    /// Snapshot of all members in registration order.
    pub fn members(&self) -> Vec<Member> {
        self.members.lock().expect("topology lock").clone()
    }

    /// The master's own entry, once bootstrapped.
    pub fn master(&self) -> Option<Member> {
        self.members
            .lock()
            .expect("topology lock")
            .iter()
            .find(|m| m.is_master)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.members.lock().expect("topology lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

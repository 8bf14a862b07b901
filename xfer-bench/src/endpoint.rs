use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use xfer_engine::XferOp;
use xfer_error::{BenchError, Result};

/// Which side of a pair an endpoint plays.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Connects to the peer and initiates every transfer.
    #[default]
    Creator,
    /// Accepts the connection and observes transfers landing in its memory.
    Peer,
}

impl Role {
    pub fn tag(&self) -> &'static str {
        match self {
            Role::Creator => "creator",
            Role::Peer => "peer",
        }
    }

    pub fn complement(&self) -> Role {
        match self {
            Role::Creator => Role::Peer,
            Role::Peer => Role::Creator,
        }
    }

    /// Value every element of this role's dataset starts with.
    pub fn fill_value(&self) -> f64 {
        match self {
            Role::Creator => 1.0,
            Role::Peer => 0.0,
        }
    }

    /// The value this role must observe in its own memory after `op`
    /// completes, or `None` when it does not verify.
    ///
    /// The peer always verifies: it holds the creator's fill after a WRITE
    /// and its own untouched fill after a READ. The creator verifies only
    /// the READ it pulled into its memory.
    pub fn expected_after(&self, op: XferOp) -> Option<f64> {
        match (op, self) {
            (XferOp::Write, Role::Peer) => Some(Role::Creator.fill_value()),
            (XferOp::Read, Role::Peer) => Some(Role::Peer.fill_value()),
            (XferOp::Read, Role::Creator) => Some(Role::Peer.fill_value()),
            (XferOp::Write, Role::Creator) => None,
        }
    }
}

impl FromStr for Role {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "creator" => Ok(Role::Creator),
            "peer" => Ok(Role::Peer),
            other => Err(BenchError::Config(format!(
                "Unknown role '{}', expected creator or peer",
                other
            ))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// First `len` hex digits of a fresh v4 uuid.
pub fn short_uid(len: usize) -> String {
    let mut uid = Uuid::new_v4().simple().to_string();
    uid.truncate(len);
    uid
}

/// `{role}-{uid}-{index}`. The leading tag is what the remote side reads
/// back to check that it talks to the complementary role.
pub fn agent_name(role: Role, index: usize) -> String {
    format!("{}-{}-{}", role.tag(), short_uid(8), index)
}

/// A validated reference to the other endpoint of a pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteEndpointRef {
    identity: String,
    role: Role,
}

impl RemoteEndpointRef {
    /// Accepts `identity` only if its role tag, the text before its first
    /// `-`, is the complement of `local`.
    ///
    /// This is stricter than looking for the role name anywhere in the
    /// identity: `node-peer-1` is rejected, so engines that name agents
    /// with a prefix of their own need to keep the role first.
    pub fn resolve(local: Role, identity: &str) -> Result<Self> {
        let tag = identity.split('-').next().unwrap_or_default();
        let role = tag.parse::<Role>().map_err(|_| {
            BenchError::ProtocolDesync(format!(
                "Remote identity '{}' carries no role tag",
                identity
            ))
        })?;
        if role != local.complement() {
            return Err(BenchError::ProtocolDesync(format!(
                "Remote identity '{}' is a {}, expected a {}",
                identity,
                role,
                local.complement()
            )));
        }
        Ok(Self {
            identity: identity.to_string(),
            role,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn role(&self) -> Role {
        self.role
    }
}

/// Everything a single unit needs to know about itself.
#[derive(Clone, Debug)]
pub struct UnitContext {
    pub index: usize,
    pub role: Role,
    pub agent_name: String,
    pub device: String,
    pub port: u16,
}

impl fmt::Display for UnitContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[AgentPair-{} {}]", self.index, self.agent_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn agent_names_carry_role_and_index() {
        let name = agent_name(Role::Peer, 3);
        let parts: Vec<&str> = name.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "peer");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2], "3");
    }

    #[test]
    fn agent_names_are_unique_per_call() {
        assert_ne!(agent_name(Role::Creator, 0), agent_name(Role::Creator, 0));
    }

    #[rstest]
    #[case(Role::Creator, "peer-0badf00d-1")]
    #[case(Role::Peer, "creator-0badf00d-1")]
    fn accepts_complementary_role(#[case] local: Role, #[case] remote: &str) {
        let endpoint = RemoteEndpointRef::resolve(local, remote).unwrap();
        assert_eq!(endpoint.role(), local.complement());
        assert_eq!(endpoint.identity(), remote);
    }

    #[rstest]
    #[case(Role::Creator, "creator-0badf00d-1")]
    #[case(Role::Peer, "peer-0badf00d-1")]
    #[case(Role::Peer, "mallory")]
    #[case(Role::Creator, "node-peer-1")]
    fn rejects_mismatched_role(#[case] local: Role, #[case] remote: &str) {
        let err = RemoteEndpointRef::resolve(local, remote).unwrap_err();
        assert_eq!(err.kind(), xfer_error::ErrorKind::ProtocolDesync);
    }

    #[rstest]
    #[case(XferOp::Write, Role::Peer, Some(1.0))]
    #[case(XferOp::Write, Role::Creator, None)]
    #[case(XferOp::Read, Role::Creator, Some(0.0))]
    #[case(XferOp::Read, Role::Peer, Some(0.0))]
    fn verifying_sides_expect_their_final_fill(
        #[case] op: XferOp,
        #[case] role: Role,
        #[case] expected: Option<f64>,
    ) {
        assert_eq!(role.expected_after(op), expected);
    }
}

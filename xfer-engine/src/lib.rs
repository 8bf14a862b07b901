//! # Transfer engine capability
//!
//! The benchmark never moves bulk data itself. It drives an external
//! transfer engine through the [`TransferEngine`] trait: memory
//! registration, metadata and descriptor exchange, transfer execution and
//! completion polling. Descriptors and handles are opaque values owned by
//! the engine.
//!
//! [`LoopbackFabric`] is an in-process engine where every agent created on
//! the same fabric can address the buffers registered by the others.

use std::{fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use xfer_error::{BenchError, Result};

mod dataset;
mod loopback;

pub use dataset::{Block, BlockShape, Dataset, Dtype};
pub use loopback::{EngineStats, FaultPlan, LoopbackEngine, LoopbackFabric};

/// Direction of a transfer, seen from the initiating agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum XferOp {
    /// Pull remote buffers into local buffers.
    Read,
    /// Push local buffers into remote buffers.
    Write,
}

impl FromStr for XferOp {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "READ" => Ok(XferOp::Read),
            "WRITE" => Ok(XferOp::Write),
            other => Err(BenchError::Config(format!(
                "Unknown operation '{}', expected READ or WRITE",
                other
            ))),
        }
    }
}

impl fmt::Display for XferOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XferOp::Read => write!(f, "READ"),
            XferOp::Write => write!(f, "WRITE"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XferStatus {
    Pending,
    Done,
    Err,
}

/// One contiguous registered memory range.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct XferDesc {
    pub addr: u64,
    pub len: u64,
    pub dev_id: u32,
}

/// Ordered list of descriptors, one per registered buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct XferDescList {
    descs: Vec<XferDesc>,
}

impl XferDescList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_desc(&mut self, addr: u64, len: u64, dev_id: u32) {
        self.descs.push(XferDesc { addr, len, dev_id });
    }

    pub fn len(&self) -> usize {
        self.descs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &XferDesc> {
        self.descs.iter()
    }

    pub fn total_bytes(&self) -> u64 {
        self.descs.iter().map(|d| d.len).sum()
    }
}

/// Result of registering a set of buffers with an engine.
#[derive(Debug)]
pub struct RegionHandle {
    id: u64,
    descs: XferDescList,
}

impl RegionHandle {
    pub fn new(id: u64, descs: XferDescList) -> Self {
        Self { id, descs }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Strips engine-private registration state, leaving the descriptors
    /// that can be handed to a transfer or to the remote side.
    pub fn trim(&self) -> XferDescList {
        self.descs.clone()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TransferHandle(u64);

impl TransferHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Identifier shared by both sides of a pair so the reactive side can ask
/// whether the transfer started by the initiating side has landed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Both agents of pair `index` derive the same id without talking.
    pub fn for_pair(index: usize) -> Self {
        Self(format!("pair-{}", index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One agent's registration with a transfer engine.
pub trait TransferEngine: Send + Sync {
    /// Agent name this engine instance was created with.
    fn name(&self) -> &str;

    fn register(&self, blocks: &[Block]) -> Result<RegionHandle>;

    /// Opaque blob that lets a remote agent address this one.
    fn metadata(&self) -> Result<Vec<u8>>;

    /// Loads a remote agent's metadata and returns its identity.
    fn add_remote_agent(&self, metadata: &[u8]) -> Result<String>;

    fn serialize_descs(&self, descs: &XferDescList) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(descs)?)
    }

    fn deserialize_descs(&self, bytes: &[u8]) -> Result<XferDescList> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn initialize_transfer(
        &self,
        op: XferOp,
        local: &XferDescList,
        remote: &XferDescList,
        remote_agent: &str,
        session: &SessionId,
    ) -> Result<TransferHandle>;

    /// Posts the transfer. `XferStatus::Err` signals an immediate failure.
    fn execute(&self, handle: &TransferHandle) -> Result<XferStatus>;

    fn poll_status(&self, handle: &TransferHandle) -> Result<XferStatus>;

    /// True once a transfer posted by `remote_agent` under `session` has
    /// completed against this agent's memory.
    fn poll_remote_done(
        &self,
        remote_agent: &str,
        session: &SessionId,
    ) -> Result<bool>;

    fn release_transfer_handle(&self, handle: TransferHandle) -> Result<()>;

    fn deregister(&self, region: RegionHandle) -> Result<()>;

    fn remove_remote_agent(&self, name: &str) -> Result<()>;
}

/// Creates one engine agent per concurrency unit.
pub trait EngineFactory: Send + Sync {
    fn create_agent(
        &self,
        name: &str,
        device: &str,
    ) -> Result<Arc<dyn TransferEngine>>;

    /// Number of accelerator devices the engine can address.
    fn accelerator_count(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("READ", XferOp::Read)]
    #[case("write", XferOp::Write)]
    #[case("Write", XferOp::Write)]
    fn parses_operations(#[case] input: &str, #[case] expected: XferOp) {
        assert_eq!(input.parse::<XferOp>().unwrap(), expected);
    }

    #[test]
    fn rejects_unknown_operation() {
        assert!("COPY".parse::<XferOp>().is_err());
    }

    #[test]
    fn session_id_is_derived_from_pair_index_only() {
        assert_eq!(SessionId::for_pair(3), SessionId::for_pair(3));
        assert_ne!(SessionId::for_pair(3), SessionId::for_pair(4));
        assert_eq!(SessionId::for_pair(7).as_str(), "pair-7");
    }

    #[test]
    fn trimmed_descriptors_report_total_bytes() {
        let mut descs = XferDescList::new();
        descs.add_desc(0, 64, 0);
        descs.add_desc(1, 64, 0);
        let region = RegionHandle::new(9, descs);

        let trimmed = region.trim();
        assert_eq!(trimmed.len(), 2);
        assert_eq!(trimmed.total_bytes(), 128);
    }
}

//! In-process transfer engine.
//!
//! Every [`LoopbackEngine`] created from the same [`LoopbackFabric`] can
//! address the blocks the others registered, so a creator and a peer living
//! in one process move real bytes between their datasets. Completion of a
//! posted transfer is published on the fabric as a notification that the
//! target agent consumes through `poll_remote_done`.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread,
    time::Duration,
};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use xfer_error::{BenchError, Result};

use crate::{
    Block, EngineFactory, RegionHandle, SessionId, TransferEngine,
    TransferHandle, XferDescList, XferOp, XferStatus,
};

/// Failures and delays injected into loopback agents.
#[derive(Clone, Debug, Default)]
pub struct FaultPlan {
    pub fail_register: bool,
    /// `execute` answers `XferStatus::Err` without moving data.
    pub fail_execute: bool,
    /// `poll_status` answers `XferStatus::Err`.
    pub fail_poll: bool,
    /// `execute` completes and notifies without moving any bytes.
    pub drop_data: bool,
    /// Number of `Pending` answers before a posted transfer reports `Done`.
    pub pending_polls: u32,
    pub register_delay: Option<Duration>,
}

/// Counters of released engine resources.
#[derive(Debug, Default)]
pub struct EngineStats {
    released_transfers: AtomicUsize,
    deregistered_regions: AtomicUsize,
    removed_remote_agents: AtomicUsize,
}

impl EngineStats {
    pub fn released_transfers(&self) -> usize {
        self.released_transfers.load(Ordering::Acquire)
    }

    pub fn deregistered_regions(&self) -> usize {
        self.deregistered_regions.load(Ordering::Acquire)
    }

    pub fn removed_remote_agents(&self) -> usize {
        self.removed_remote_agents.load(Ordering::Acquire)
    }
}

type FaultRule = (Box<dyn Fn(&str) -> bool + Send + Sync>, FaultPlan);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct NotificationKey {
    target: String,
    initiator: String,
    session: SessionId,
}

#[derive(Default)]
struct FabricState {
    agents: HashMap<String, HashMap<u64, Block>>,
    notifications: HashMap<NotificationKey, usize>,
    next_addr: u64,
}

/// Shared address space of all loopback agents in this process.
#[derive(Clone, Default)]
pub struct LoopbackFabric {
    state: Arc<Mutex<FabricState>>,
    rules: Arc<Mutex<Vec<FaultRule>>>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Agents created later whose name satisfies `matches` get `plan`.
    /// The first matching rule wins.
    pub fn inject_faults(
        &self,
        matches: impl Fn(&str) -> bool + Send + Sync + 'static,
        plan: FaultPlan,
    ) {
        self.rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((Box::new(matches), plan));
    }

    pub fn agent(&self, name: &str) -> LoopbackEngine {
        let faults = self
            .rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|(matches, _)| matches(name))
            .map(|(_, plan)| plan.clone())
            .unwrap_or_default();
        self.agent_with_faults(name, faults)
    }

    pub fn agent_with_faults(
        &self,
        name: &str,
        faults: FaultPlan,
    ) -> LoopbackEngine {
        self.lock().agents.entry(name.to_string()).or_default();
        LoopbackEngine {
            name: name.to_string(),
            fabric: self.clone(),
            faults,
            remotes: Mutex::new(HashSet::new()),
            regions: Mutex::new(HashMap::new()),
            transfers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            stats: Arc::new(EngineStats::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FabricState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl EngineFactory for LoopbackFabric {
    fn create_agent(
        &self,
        name: &str,
        device: &str,
    ) -> Result<Arc<dyn TransferEngine>> {
        if device != "cpu" {
            warn!(
                "Loopback engine only addresses host memory, treating {} as cpu",
                device
            );
        }
        Ok(Arc::new(self.agent(name)))
    }
}

#[derive(Serialize, Deserialize)]
struct AgentMetadata {
    name: String,
}

struct LoopbackTransfer {
    op: XferOp,
    local: XferDescList,
    remote: XferDescList,
    remote_agent: String,
    session: SessionId,
    status: XferStatus,
    pending_left: u32,
}

pub struct LoopbackEngine {
    name: String,
    fabric: LoopbackFabric,
    faults: FaultPlan,
    remotes: Mutex<HashSet<String>>,
    regions: Mutex<HashMap<u64, Vec<u64>>>,
    transfers: Mutex<HashMap<u64, LoopbackTransfer>>,
    next_id: AtomicU64,
    stats: Arc<EngineStats>,
}

impl LoopbackEngine {
    pub fn stats(&self) -> Arc<EngineStats> {
        self.stats.clone()
    }

    fn transfers(&self) -> MutexGuard<'_, HashMap<u64, LoopbackTransfer>> {
        self.transfers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remotes(&self) -> MutexGuard<'_, HashSet<String>> {
        self.remotes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn regions(&self) -> MutexGuard<'_, HashMap<u64, Vec<u64>>> {
        self.regions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolves the descriptor pairs under the fabric lock, then copies with
    /// the lock released so other agents keep polling.
    fn move_data(&self, transfer: &LoopbackTransfer) -> Result<()> {
        let pairs = {
            let fabric = self.fabric.lock();
            let local = fabric.agents.get(&self.name).ok_or_else(|| {
                BenchError::Engine(format!(
                    "Agent {} left the fabric",
                    self.name
                ))
            })?;
            let remote =
                fabric.agents.get(&transfer.remote_agent).ok_or_else(|| {
                    BenchError::Engine(format!(
                        "Remote agent {} left the fabric",
                        transfer.remote_agent
                    ))
                })?;

            let mut pairs = Vec::with_capacity(transfer.local.len());
            for (l, r) in transfer.local.iter().zip(transfer.remote.iter()) {
                let (Some(local_block), Some(remote_block)) =
                    (local.get(&l.addr), remote.get(&r.addr))
                else {
                    return Err(BenchError::Engine(format!(
                        "Descriptor pair {:#x} -> {:#x} is not registered",
                        l.addr, r.addr
                    )));
                };
                pairs.push((local_block.clone(), remote_block.clone()));
            }
            pairs
        };

        for (local_block, remote_block) in &pairs {
            match transfer.op {
                XferOp::Write => remote_block.copy_from(local_block)?,
                XferOp::Read => local_block.copy_from(remote_block)?,
            }
        }
        Ok(())
    }

    fn notify(&self, transfer: &LoopbackTransfer) {
        let key = NotificationKey {
            target: transfer.remote_agent.clone(),
            initiator: self.name.clone(),
            session: transfer.session.clone(),
        };
        *self.fabric.lock().notifications.entry(key).or_insert(0) += 1;
    }
}

impl Drop for LoopbackEngine {
    fn drop(&mut self) {
        self.fabric.lock().agents.remove(&self.name);
    }
}

impl TransferEngine for LoopbackEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn register(&self, blocks: &[Block]) -> Result<RegionHandle> {
        if let Some(delay) = self.faults.register_delay {
            thread::sleep(delay);
        }
        if self.faults.fail_register {
            return Err(BenchError::Engine(format!(
                "Registration refused for {}",
                self.name
            )));
        }

        let mut descs = XferDescList::new();
        let mut addrs = Vec::with_capacity(blocks.len());
        {
            let mut fabric = self.fabric.lock();
            let first = fabric.next_addr;
            fabric.next_addr += blocks.len() as u64;
            let memory = fabric.agents.entry(self.name.clone()).or_default();
            for (offset, block) in blocks.iter().enumerate() {
                let addr = first + offset as u64;
                memory.insert(addr, block.clone());
                descs.add_desc(addr, block.len_bytes() as u64, 0);
                addrs.push(addr);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        self.regions().insert(id, addrs);
        debug!("{} registered {} blocks", self.name, blocks.len());
        Ok(RegionHandle::new(id, descs))
    }

    fn metadata(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&AgentMetadata {
            name: self.name.clone(),
        })?)
    }

    fn add_remote_agent(&self, metadata: &[u8]) -> Result<String> {
        let metadata: AgentMetadata = serde_json::from_slice(metadata)?;
        if !self.fabric.lock().agents.contains_key(&metadata.name) {
            return Err(BenchError::Engine(format!(
                "Agent {} is not reachable on this fabric",
                metadata.name
            )));
        }
        self.remotes().insert(metadata.name.clone());
        Ok(metadata.name)
    }

    fn initialize_transfer(
        &self,
        op: XferOp,
        local: &XferDescList,
        remote: &XferDescList,
        remote_agent: &str,
        session: &SessionId,
    ) -> Result<TransferHandle> {
        if !self.remotes().contains(remote_agent) {
            return Err(BenchError::Engine(format!(
                "Unknown remote agent {}",
                remote_agent
            )));
        }
        if local.len() != remote.len() {
            return Err(BenchError::Engine(format!(
                "Descriptor count mismatch: {} local, {} remote",
                local.len(),
                remote.len()
            )));
        }
        if let Some((l, r)) =
            local.iter().zip(remote.iter()).find(|(l, r)| l.len != r.len)
        {
            return Err(BenchError::Engine(format!(
                "Descriptor length mismatch: {} local, {} remote",
                l.len, r.len
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        self.transfers().insert(
            id,
            LoopbackTransfer {
                op,
                local: local.clone(),
                remote: remote.clone(),
                remote_agent: remote_agent.to_string(),
                session: session.clone(),
                status: XferStatus::Pending,
                pending_left: 0,
            },
        );
        Ok(TransferHandle::new(id))
    }

    fn execute(&self, handle: &TransferHandle) -> Result<XferStatus> {
        let mut transfers = self.transfers();
        let transfer = transfers.get_mut(&handle.id()).ok_or_else(|| {
            BenchError::Engine(format!("Unknown transfer {}", handle.id()))
        })?;
        if self.faults.fail_execute {
            transfer.status = XferStatus::Err;
            return Ok(XferStatus::Err);
        }
        if self.faults.drop_data {
            debug!(
                "{} dropping the payload of transfer {}",
                self.name,
                handle.id()
            );
        } else if let Err(e) = self.move_data(transfer) {
            warn!("{} failed to move data: {}", self.name, e);
            transfer.status = XferStatus::Err;
            return Ok(XferStatus::Err);
        }
        self.notify(transfer);
        transfer.pending_left = self.faults.pending_polls;
        transfer.status = if transfer.pending_left > 0 {
            XferStatus::Pending
        } else {
            XferStatus::Done
        };
        Ok(transfer.status)
    }

    fn poll_status(&self, handle: &TransferHandle) -> Result<XferStatus> {
        let mut transfers = self.transfers();
        let transfer = transfers.get_mut(&handle.id()).ok_or_else(|| {
            BenchError::Engine(format!("Unknown transfer {}", handle.id()))
        })?;
        if self.faults.fail_poll {
            return Ok(XferStatus::Err);
        }
        if transfer.pending_left > 0 {
            transfer.pending_left -= 1;
            if transfer.pending_left == 0 {
                transfer.status = XferStatus::Done;
            }
            return Ok(XferStatus::Pending);
        }
        Ok(transfer.status)
    }

    fn poll_remote_done(
        &self,
        remote_agent: &str,
        session: &SessionId,
    ) -> Result<bool> {
        let key = NotificationKey {
            target: self.name.clone(),
            initiator: remote_agent.to_string(),
            session: session.clone(),
        };
        let mut fabric = self.fabric.lock();
        match fabric.notifications.get_mut(&key) {
            Some(count) if *count > 0 => {
                *count -= 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release_transfer_handle(&self, handle: TransferHandle) -> Result<()> {
        if self.transfers().remove(&handle.id()).is_none() {
            return Err(BenchError::Engine(format!(
                "Transfer {} already released",
                handle.id()
            )));
        }
        self.stats
            .released_transfers
            .fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn deregister(&self, region: RegionHandle) -> Result<()> {
        let addrs = self.regions().remove(&region.id()).ok_or_else(|| {
            BenchError::Engine(format!(
                "Region {} already deregistered",
                region.id()
            ))
        })?;
        if let Some(memory) = self.fabric.lock().agents.get_mut(&self.name) {
            for addr in addrs {
                memory.remove(&addr);
            }
        }
        self.stats
            .deregistered_regions
            .fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn remove_remote_agent(&self, name: &str) -> Result<()> {
        if self.remotes().remove(name) {
            self.stats
                .removed_remote_agents
                .fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockShape, Dataset, Dtype};
    use std::sync::mpsc;

    fn dataset(fill: f64) -> Dataset {
        let shape = BlockShape {
            num_layers: 2,
            block_size: 2,
            hidden_dim: 2,
        };
        Dataset::create(shape, Dtype::BFloat16, 3, fill)
    }

    struct Pair {
        creator: LoopbackEngine,
        peer: LoopbackEngine,
        creator_data: Dataset,
        peer_data: Dataset,
        handle: TransferHandle,
    }

    fn connected_pair(fabric: &LoopbackFabric, op: XferOp) -> Pair {
        let creator = fabric.agent("creator-a-0");
        let peer = fabric.agent("peer-b-0");
        let creator_data = dataset(1.0);
        let peer_data = dataset(0.0);

        let local = creator.register(creator_data.blocks()).unwrap().trim();
        let remote_region = peer.register(peer_data.blocks()).unwrap();

        let peer_name =
            creator.add_remote_agent(&peer.metadata().unwrap()).unwrap();
        peer.add_remote_agent(&creator.metadata().unwrap()).unwrap();

        let wire = peer.serialize_descs(&remote_region.trim()).unwrap();
        let remote = creator.deserialize_descs(&wire).unwrap();
        let handle = creator
            .initialize_transfer(
                op,
                &local,
                &remote,
                &peer_name,
                &SessionId::for_pair(0),
            )
            .unwrap();
        Pair {
            creator,
            peer,
            creator_data,
            peer_data,
            handle,
        }
    }

    #[test]
    fn descriptors_survive_serialization() {
        let fabric = LoopbackFabric::new();
        let agent = fabric.agent("peer-x-0");
        let data = dataset(0.0);
        let region = agent.register(data.blocks()).unwrap();

        let wire = agent.serialize_descs(&region.trim()).unwrap();
        let decoded = agent.deserialize_descs(&wire).unwrap();

        assert_eq!(decoded.len(), data.blocks().len());
        assert_eq!(decoded, region.trim());
    }

    #[test]
    fn write_moves_bytes_and_notifies_target_once() {
        let fabric = LoopbackFabric::new();
        let pair = connected_pair(&fabric, XferOp::Write);
        let session = SessionId::for_pair(0);

        assert_eq!(pair.creator.execute(&pair.handle).unwrap(), XferStatus::Done);
        assert_eq!(
            pair.creator.poll_status(&pair.handle).unwrap(),
            XferStatus::Done
        );
        assert!(pair.peer_data.verify_fill(1.0, 1e-8).is_ok());

        assert!(pair.peer.poll_remote_done("creator-a-0", &session).unwrap());
        assert!(!pair.peer.poll_remote_done("creator-a-0", &session).unwrap());
    }

    #[test]
    fn read_pulls_remote_bytes() {
        let fabric = LoopbackFabric::new();
        let pair = connected_pair(&fabric, XferOp::Read);

        pair.creator.execute(&pair.handle).unwrap();

        assert!(pair.creator_data.verify_fill(0.0, 1e-8).is_ok());
    }

    #[test]
    fn pending_polls_delay_completion() {
        let fabric = LoopbackFabric::new();
        fabric.inject_faults(
            |name| name.starts_with("creator"),
            FaultPlan {
                pending_polls: 2,
                ..FaultPlan::default()
            },
        );
        let pair = connected_pair(&fabric, XferOp::Write);

        assert_eq!(
            pair.creator.execute(&pair.handle).unwrap(),
            XferStatus::Pending
        );
        let polls: Vec<_> = (0..3)
            .map(|_| pair.creator.poll_status(&pair.handle).unwrap())
            .collect();
        assert_eq!(
            polls,
            vec![XferStatus::Pending, XferStatus::Pending, XferStatus::Done]
        );
    }

    #[test]
    fn failed_execute_moves_nothing() {
        let fabric = LoopbackFabric::new();
        fabric.inject_faults(
            |name| name.starts_with("creator"),
            FaultPlan {
                fail_execute: true,
                ..FaultPlan::default()
            },
        );
        let pair = connected_pair(&fabric, XferOp::Write);

        assert_eq!(pair.creator.execute(&pair.handle).unwrap(), XferStatus::Err);
        assert!(pair.peer_data.verify_fill(0.0, 1e-8).is_ok());
        assert!(!pair
            .peer
            .poll_remote_done("creator-a-0", &SessionId::for_pair(0))
            .unwrap());
    }

    #[test]
    fn unknown_remote_agent_is_rejected() {
        let fabric = LoopbackFabric::new();
        let agent = fabric.agent("creator-a-0");
        let metadata =
            serde_json::to_vec(&AgentMetadata { name: "peer-z-9".into() })
                .unwrap();
        assert!(agent.add_remote_agent(&metadata).is_err());
    }

    #[test]
    fn resources_are_released_exactly_once() {
        let fabric = LoopbackFabric::new();
        let agent = fabric.agent("creator-a-0");
        let stats = agent.stats();
        let data = dataset(1.0);
        let region = agent.register(data.blocks()).unwrap();
        let region_id = region.id();

        agent.deregister(region).unwrap();
        assert!(agent
            .deregister(RegionHandle::new(region_id, XferDescList::new()))
            .is_err());
        assert_eq!(stats.deregistered_regions(), 1);
    }

    #[test]
    fn dropped_payload_still_completes() {
        let fabric = LoopbackFabric::new();
        fabric.inject_faults(
            |name| name.starts_with("creator"),
            FaultPlan {
                drop_data: true,
                ..FaultPlan::default()
            },
        );
        let pair = connected_pair(&fabric, XferOp::Write);

        assert_eq!(pair.creator.execute(&pair.handle).unwrap(), XferStatus::Done);
        assert!(pair
            .peer
            .poll_remote_done("creator-a-0", &SessionId::for_pair(0))
            .unwrap());
        assert!(pair.peer_data.verify_fill(0.0, 1e-8).is_ok());
    }

    #[test]
    fn copies_do_not_hold_up_other_agents() {
        let fabric = LoopbackFabric::new();
        let pair = connected_pair(&fabric, XferOp::Write);
        let target = pair.peer_data.blocks()[0].clone();
        let session = SessionId::for_pair(0);
        let (tx, rx) = mpsc::channel();

        // Parks the copy on the destination block.
        let guard = target.read();
        thread::scope(|s| {
            let creator = &pair.creator;
            let handle = &pair.handle;
            let copier = s.spawn(move || creator.execute(handle));
            thread::sleep(Duration::from_millis(50));

            let peer = &pair.peer;
            let session = &session;
            s.spawn(move || {
                let _ = tx.send(peer.poll_remote_done("creator-a-0", session));
            });
            let polled = rx.recv_timeout(Duration::from_secs(5));
            drop(guard);

            assert!(matches!(polled, Ok(Ok(false))));
            assert_eq!(copier.join().unwrap().unwrap(), XferStatus::Done);
        });
        assert!(pair.peer_data.verify_fill(1.0, 1e-8).is_ok());
    }
}

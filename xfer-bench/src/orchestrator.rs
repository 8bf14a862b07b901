//! Lifecycle of one creator/peer pair, seen from one side.
//!
//! `setup -> start gate -> rounds -> correctness check -> teardown`.
//! Every unit reaches the start gate, including one whose setup failed,
//! and every unit tears down whatever it acquired.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use xfer_channel::ControlChannel;
use xfer_engine::{
    Dataset, EngineFactory, RegionHandle, TransferEngine, TransferHandle,
};
use xfer_error::{BenchError, ErrorKind, Result};

use crate::{
    config::BenchConfig,
    endpoint::{Role, UnitContext},
    handshake::{Handshake, TransferSession},
    harness::StartGate,
    interrupt::Interrupt,
    round::{CompletionPolicy, RoundOutcome, RoundResult, TransferRound},
};

/// Tolerance of the post-transfer mean check.
pub const FILL_TOLERANCE: f64 = 1e-8;

/// What one unit reports back to the harness.
#[derive(Clone, Debug)]
pub struct UnitOutcome {
    pub index: usize,
    pub agent_name: String,
    /// Throughput of the last round in GB/s. Zero when the unit failed,
    /// including a failed correctness check.
    pub throughput: f64,
    pub rounds: Vec<RoundResult>,
    /// `None` when this side does not verify.
    pub correct: Option<bool>,
    pub error: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub handshake_completed_at: Option<Instant>,
    pub first_round_started_at: Option<Instant>,
}

impl UnitOutcome {
    pub fn new(ctx: &UnitContext) -> Self {
        Self {
            index: ctx.index,
            agent_name: ctx.agent_name.clone(),
            throughput: 0.0,
            rounds: Vec::new(),
            correct: None,
            error: None,
            error_message: None,
            handshake_completed_at: None,
            first_round_started_at: None,
        }
    }

    fn fail(&mut self, error: &BenchError) {
        self.error = Some(error.kind());
        self.error_message = Some(error.to_string());
    }
}

/// Engine-side resources of one unit, released in reverse order of
/// acquisition.
pub struct PairResources {
    engine: Option<Arc<dyn TransferEngine>>,
    channel: Option<ControlChannel>,
    region: Option<RegionHandle>,
    transfer: Option<TransferHandle>,
    remote_agent: Option<String>,
}

impl PairResources {
    pub fn new() -> Self {
        Self {
            engine: None,
            channel: None,
            region: None,
            transfer: None,
            remote_agent: None,
        }
    }

    /// Releases everything still held. Calling it again is a no-op.
    pub fn teardown(&mut self, ctx: &UnitContext) {
        if let Some(engine) = self.engine.as_ref() {
            if let Some(handle) = self.transfer.take() {
                if let Err(e) = engine.release_transfer_handle(handle) {
                    warn!("{} Failed to release transfer: {}", ctx, e);
                }
            }
            if let Some(region) = self.region.take() {
                if let Err(e) = engine.deregister(region) {
                    warn!("{} Failed to deregister memory: {}", ctx, e);
                }
            }
            if let Some(remote) = self.remote_agent.take() {
                if let Err(e) = engine.remove_remote_agent(&remote) {
                    warn!("{} Failed to remove {}: {}", ctx, remote, e);
                }
            }
        }
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        debug!("{} Resources released", ctx);
    }
}

impl Default for PairResources {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of the blocking measurement phase.
struct Measurement {
    rounds: Vec<RoundResult>,
    first_round_started_at: Option<Instant>,
    error: Option<BenchError>,
    correct: Option<bool>,
}

pub struct PairOrchestrator {
    ctx: UnitContext,
    config: Arc<BenchConfig>,
    factory: Arc<dyn EngineFactory>,
    gate: StartGate,
    interrupt: Interrupt,
    resources: PairResources,
    dataset: Option<Dataset>,
    session: Option<TransferSession>,
}

impl PairOrchestrator {
    pub fn new(
        ctx: UnitContext,
        config: Arc<BenchConfig>,
        factory: Arc<dyn EngineFactory>,
        gate: StartGate,
        interrupt: Interrupt,
    ) -> Self {
        Self {
            ctx,
            config,
            factory,
            gate,
            interrupt,
            resources: PairResources::new(),
            dataset: None,
            session: None,
        }
    }

    pub async fn run(mut self) -> UnitOutcome {
        let mut outcome = UnitOutcome::new(&self.ctx);
        let interrupt = self.interrupt.clone();

        let setup = tokio::select! {
            result = self.setup() => result,
            _ = interrupt.triggered() => Err(BenchError::Interrupted),
        };
        match &setup {
            Ok(elapsed) => {
                outcome.handshake_completed_at = Some(Instant::now());
                info!(
                    "{} Time to initialize transfer metadata: {:.2} seconds",
                    self.ctx,
                    elapsed.as_secs_f64()
                );
            }
            Err(e) => {
                error!("{} Setup failed: {}", self.ctx, e);
                outcome.fail(e);
                // Lets the remote side fail fast instead of waiting on us.
                if let Some(channel) = self.resources.channel.as_mut() {
                    channel.close();
                }
            }
        }

        tokio::select! {
            biased;
            _ = self.gate.wait() => {}
            _ = interrupt.triggered() => {
                if outcome.error.is_none() {
                    outcome.fail(&BenchError::Interrupted);
                }
            }
        }

        if outcome.error.is_none() {
            self.measure(&mut outcome).await;
        }

        self.resources.teardown(&self.ctx);
        outcome
    }

    /// Opens the channel, builds and registers the dataset and runs the
    /// handshake. Returns the time spent in the handshake.
    async fn setup(&mut self) -> Result<Duration> {
        let engine = self
            .factory
            .create_agent(&self.ctx.agent_name, &self.ctx.device)
            .map_err(BenchError::into_setup)?;
        self.resources.engine = Some(engine.clone());

        let addr = self.config.control_addr(self.ctx.index);
        let channel = match self.ctx.role {
            Role::Peer => ControlChannel::bind(&addr).await?,
            Role::Creator => {
                ControlChannel::connect(&addr, self.config.connect_timeout())
                    .await?
            }
        };
        let channel = self.resources.channel.insert(channel);

        info!(
            "{} Creating dataset: {} blocks of {:?} {} on {}",
            self.ctx,
            self.config.num_blocks,
            self.config.block_shape(),
            self.config.dtype,
            self.ctx.device
        );
        let dataset = Dataset::create(
            self.config.block_shape(),
            self.config.dtype,
            self.config.num_blocks,
            self.ctx.role.fill_value(),
        );

        let blocks = dataset.blocks().to_vec();
        let registrar = engine.clone();
        let region = tokio::task::spawn_blocking(move || {
            registrar.register(&blocks)
        })
        .await
        .map_err(|e| {
            BenchError::Setup(format!("Registration task failed: {}", e))
        })?
        .map_err(BenchError::into_setup)?;
        let local = region.trim();
        self.resources.region = Some(region);
        self.dataset = Some(dataset);

        let started = Instant::now();
        let (remote, session) = Handshake::new(
            &self.ctx,
            engine.as_ref(),
            channel,
            self.config.operation,
            local,
            &mut self.resources.remote_agent,
        )
        .run()
        .await?;
        let elapsed = started.elapsed();

        info!(
            "{} Ready for {} with {}",
            self.ctx,
            session.op,
            remote.identity()
        );
        self.resources.transfer = session.handle.clone();
        self.session = Some(session);
        Ok(elapsed)
    }

    async fn measure(&mut self, outcome: &mut UnitOutcome) {
        let (Some(engine), Some(session), Some(dataset)) = (
            self.resources.engine.clone(),
            self.session.clone(),
            self.dataset.clone(),
        ) else {
            outcome.fail(&BenchError::Setup(
                "Unit reached the measurement phase without a session"
                    .to_string(),
            ));
            return;
        };

        let ctx = self.ctx.clone();
        let interrupt = self.interrupt.clone();
        let policy = self.config.completion_policy();
        let iters = self.config.iters;

        let task = tokio::task::spawn_blocking(move || {
            measure_blocking(
                &ctx,
                engine.as_ref(),
                &session,
                &dataset,
                policy,
                &interrupt,
                iters,
            )
        });
        let measurement = match task.await {
            Ok(measurement) => measurement,
            Err(e) => {
                outcome.fail(&BenchError::Transfer(format!(
                    "Measurement task failed: {}",
                    e
                )));
                return;
            }
        };

        outcome.first_round_started_at = measurement.first_round_started_at;
        outcome.correct = measurement.correct;
        outcome.throughput = match (&measurement.error, measurement.correct) {
            (Some(BenchError::Interrupted), _) | (_, Some(false)) => 0.0,
            _ => measurement
                .rounds
                .last()
                .map(|round| round.throughput)
                .unwrap_or(0.0),
        };
        outcome.rounds = measurement.rounds;
        if let Some(e) = &measurement.error {
            outcome.fail(e);
        } else if outcome.correct == Some(false) {
            outcome.fail(&BenchError::Correctness(
                "Transferred data did not match the source fill".to_string(),
            ));
        }
    }
}

fn measure_blocking(
    ctx: &UnitContext,
    engine: &dyn TransferEngine,
    session: &TransferSession,
    dataset: &Dataset,
    policy: CompletionPolicy,
    interrupt: &Interrupt,
    iters: usize,
) -> Measurement {
    let bytes = dataset.total_bytes() as u64;
    let mut measurement = Measurement {
        rounds: Vec::with_capacity(iters),
        first_round_started_at: None,
        error: None,
        correct: None,
    };

    for n in 0..iters {
        let round =
            TransferRound::new(engine, session, ctx.role, policy, interrupt);
        if n == 0 {
            measurement.first_round_started_at = Some(Instant::now());
        }
        match round.run() {
            Ok(RoundOutcome::Completed(elapsed)) => {
                let result = RoundResult::completed(bytes, elapsed);
                info!(
                    "{} Round {}: Transfer speed: {:.2} GB/s",
                    ctx, n, result.throughput
                );
                measurement.rounds.push(result);
            }
            Ok(RoundOutcome::Rejected(e)) => {
                error!("{} Round {} failed: {}", ctx, n, e);
                if policy == CompletionPolicy::Spin {
                    warn!(
                        "{} Without a completion timeout the peer keeps \
                         waiting for round {} until interrupted",
                        ctx, n
                    );
                }
                measurement.rounds.push(RoundResult::failed(bytes));
                measurement.error = Some(e);
            }
            Err(e) => {
                error!("{} Round {} aborted: {}", ctx, n, e);
                measurement.rounds.push(RoundResult::failed(bytes));
                measurement.error = Some(e);
                break;
            }
        }
    }

    let interrupted = matches!(measurement.error, Some(BenchError::Interrupted));
    if let (Some(expected), false) =
        (ctx.role.expected_after(session.op), interrupted)
    {
        match dataset.verify_fill(expected, FILL_TOLERANCE) {
            Ok(()) => {
                info!("{} Passed correctness check!", ctx);
                measurement.correct = Some(true);
            }
            Err(e) => {
                error!("{} Correctness check failed: {}", ctx, e);
                measurement.correct = Some(false);
            }
        }
    }
    measurement
}

#[cfg(test)]
mod tests {
    use super::*;
    use xfer_engine::{Block, Dtype, LoopbackFabric, SessionId, XferOp};

    fn context() -> UnitContext {
        UnitContext {
            index: 0,
            role: Role::Creator,
            agent_name: "creator-0badf00d-0".to_string(),
            device: "cpu".to_string(),
            port: 0,
        }
    }

    #[test]
    fn teardown_releases_each_resource_once() {
        let fabric = LoopbackFabric::new();
        let engine = fabric.agent("creator-0badf00d-0");
        let peer = fabric.agent("peer-0badf00d-0");
        let stats = engine.stats();

        let local = engine
            .register(&[Block::filled(Dtype::UInt8, 4, 1.0)])
            .unwrap();
        let remote = peer
            .register(&[Block::filled(Dtype::UInt8, 4, 0.0)])
            .unwrap();
        let remote_agent =
            engine.add_remote_agent(&peer.metadata().unwrap()).unwrap();
        let handle = engine
            .initialize_transfer(
                XferOp::Write,
                &local.trim(),
                &remote.trim(),
                &remote_agent,
                &SessionId::for_pair(0),
            )
            .unwrap();

        let mut resources = PairResources {
            engine: Some(Arc::new(engine)),
            channel: None,
            region: Some(local),
            transfer: Some(handle),
            remote_agent: Some(remote_agent),
        };
        let ctx = context();
        resources.teardown(&ctx);
        resources.teardown(&ctx);

        assert_eq!(stats.released_transfers(), 1);
        assert_eq!(stats.deregistered_regions(), 1);
        assert_eq!(stats.removed_remote_agents(), 1);
    }

    #[test]
    fn teardown_of_nothing_is_harmless() {
        let mut resources = PairResources::new();
        resources.teardown(&context());
        resources.teardown(&context());
    }

    #[tokio::test]
    async fn unit_that_cannot_connect_still_reaches_the_gate() {
        let config = BenchConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            connect_timeout_ms: 50,
            ..Default::default()
        };
        let gate = StartGate::new(2);
        let orchestrator = PairOrchestrator::new(
            context(),
            Arc::new(config),
            Arc::new(LoopbackFabric::new()),
            gate.clone(),
            Interrupt::new(),
        );

        let (outcome, _) =
            tokio::join!(orchestrator.run(), async { gate.wait().await });
        assert_eq!(outcome.error, Some(ErrorKind::Setup));
        assert_eq!(outcome.throughput, 0.0);
        assert!(outcome.handshake_completed_at.is_none());
    }

    #[tokio::test]
    async fn interrupted_peer_gives_up_waiting_for_its_creator() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = BenchConfig {
            role: Role::Peer,
            host: "127.0.0.1".to_string(),
            port,
            ..Default::default()
        };
        let ctx = UnitContext {
            role: Role::Peer,
            agent_name: "peer-0badf00d-0".to_string(),
            port,
            ..context()
        };
        let interrupt = Interrupt::new();
        let orchestrator = PairOrchestrator::new(
            ctx,
            Arc::new(config),
            Arc::new(LoopbackFabric::new()),
            StartGate::new(1),
            interrupt.clone(),
        );

        let unit = tokio::spawn(orchestrator.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        interrupt.trigger();

        let outcome = tokio::time::timeout(Duration::from_secs(5), unit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.error, Some(ErrorKind::Interrupted));
        assert_eq!(outcome.throughput, 0.0);
    }
}

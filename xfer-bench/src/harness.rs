use std::sync::{Arc, Mutex};

use log::{error, info};
use tokio::sync::Barrier;
use xfer_engine::EngineFactory;
use xfer_error::Result;

use crate::{
    config::BenchConfig,
    endpoint::{agent_name, UnitContext},
    interrupt::Interrupt,
    orchestrator::{PairOrchestrator, UnitOutcome},
};

/// Barrier every unit of a run waits on between handshake and first round.
#[derive(Clone, Debug)]
pub struct StartGate {
    barrier: Arc<Barrier>,
    parties: usize,
}

impl StartGate {
    pub fn new(parties: usize) -> Self {
        Self {
            barrier: Arc::new(Barrier::new(parties)),
            parties,
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Returns once all parties have arrived. Arrival is registered on the
    /// first poll.
    pub async fn wait(&self) {
        self.barrier.wait().await;
    }
}

/// Collects unit outcomes from concurrently running tasks.
#[derive(Clone, Default)]
pub struct ResultSink {
    outcomes: Arc<Mutex<Vec<UnitOutcome>>>,
}

impl ResultSink {
    pub fn push(&self, outcome: UnitOutcome) {
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(outcome);
    }

    /// Drains the collected outcomes, ordered by unit index.
    pub fn take(&self) -> Vec<UnitOutcome> {
        let mut outcomes = std::mem::take(
            &mut *self.outcomes.lock().unwrap_or_else(|e| e.into_inner()),
        );
        outcomes.sort_by_key(|outcome| outcome.index);
        outcomes
    }
}

#[derive(Clone, Debug)]
pub struct BenchmarkResult {
    /// GB/s per unit, indexed by unit. Failed units report zero.
    pub per_unit: Vec<f64>,
    pub total: f64,
    /// `total` over the number of units, failed ones included.
    pub average: f64,
    /// False if any unit's correctness check failed.
    pub correct: bool,
    pub outcomes: Vec<UnitOutcome>,
}

impl BenchmarkResult {
    /// Sum and mean of `per_unit`. Both are zero for no units.
    pub fn aggregate(per_unit: &[f64]) -> (f64, f64) {
        let total: f64 = per_unit.iter().sum();
        let average = if per_unit.is_empty() {
            0.0
        } else {
            total / per_unit.len() as f64
        };
        (total, average)
    }

    /// Units without an outcome, for instance after a panic, count as
    /// zero throughput.
    pub fn from_outcomes(outcomes: Vec<UnitOutcome>, units: usize) -> Self {
        let mut per_unit = vec![0.0; units];
        for outcome in &outcomes {
            if let Some(slot) = per_unit.get_mut(outcome.index) {
                *slot = outcome.throughput;
            }
        }
        let (total, average) = Self::aggregate(&per_unit);
        let correct = outcomes
            .iter()
            .all(|outcome| outcome.correct != Some(false));
        Self {
            per_unit,
            total,
            average,
            correct,
            outcomes,
        }
    }
}

/// Runs `threads` independent pairs of one role concurrently.
pub struct BenchmarkHarness {
    config: Arc<BenchConfig>,
    factory: Arc<dyn EngineFactory>,
}

impl BenchmarkHarness {
    pub fn new(
        config: BenchConfig,
        factory: Arc<dyn EngineFactory>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            factory,
        })
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    pub async fn run(&self, interrupt: &Interrupt) -> BenchmarkResult {
        let threads = self.config.threads;
        let devices = self.config.devices(self.factory.accelerator_count());
        info!(
            "Starting {} benchmark: {} {} x{} over {} with {} threads",
            self.config.role,
            self.config.operation,
            self.config.num_blocks,
            self.config.iters,
            devices.join(","),
            threads
        );

        let gate = StartGate::new(threads);
        let sink = ResultSink::default();
        let mut units = Vec::with_capacity(threads);

        for index in 0..threads {
            let ctx = UnitContext {
                index,
                role: self.config.role,
                agent_name: agent_name(self.config.role, index),
                device: devices[index % devices.len()].clone(),
                port: self.config.unit_port(index),
            };
            info!("Started {} on {} port {}", ctx, ctx.device, ctx.port);

            let orchestrator = PairOrchestrator::new(
                ctx,
                self.config.clone(),
                self.factory.clone(),
                gate.clone(),
                interrupt.clone(),
            );
            let sink = sink.clone();
            units.push(tokio::spawn(async move {
                sink.push(orchestrator.run().await);
            }));
        }

        for (index, unit) in units.into_iter().enumerate() {
            match unit.await {
                Ok(()) => info!("Thread AgentPair-{} completed", index),
                Err(e) => error!("Thread AgentPair-{} panicked: {}", index, e),
            }
        }

        let result = BenchmarkResult::from_outcomes(sink.take(), threads);
        info!(
            "Total transfer speed across all threads: {:.2} GB/s",
            result.total
        );
        info!("Average speed per thread: {:.2} GB/s", result.average);
        if !result.correct {
            error!("At least one unit failed its correctness check");
        }
        result
    }
}

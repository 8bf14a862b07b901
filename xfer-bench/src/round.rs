//! A single measured transfer round.
//!
//! Rounds are synchronous and busy-spin on engine status, so callers run
//! them on a blocking thread rather than on the async runtime.

use std::time::{Duration, Instant};

use xfer_engine::{TransferEngine, XferStatus};
use xfer_error::{BenchError, Result};

use crate::{endpoint::Role, handshake::TransferSession, interrupt::Interrupt};

/// How long a completion wait may spin.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompletionPolicy {
    /// Spin until completion or interruption.
    ///
    /// A peer cannot tell a round the creator failed to post from a slow
    /// one, so after a rejected post it spins until the run is interrupted
    /// and never reaches its correctness check. Use `Deadline` when the
    /// engine may reject posts.
    #[default]
    Spin,
    /// Spin, but fail the wait with a transfer error once the limit passes.
    Deadline(Duration),
}

impl CompletionPolicy {
    /// Calls `poll` until it yields a value, the interrupt fires or the
    /// deadline passes.
    pub fn wait<T>(
        &self,
        interrupt: &Interrupt,
        mut poll: impl FnMut() -> Result<Option<T>>,
    ) -> Result<T> {
        let started = Instant::now();
        loop {
            if let Some(value) = poll()? {
                return Ok(value);
            }
            if interrupt.is_triggered() {
                return Err(BenchError::Interrupted);
            }
            if let CompletionPolicy::Deadline(limit) = self {
                if started.elapsed() >= *limit {
                    return Err(BenchError::Transfer(format!(
                        "No completion within {:?}",
                        limit
                    )));
                }
            }
            std::hint::spin_loop();
        }
    }
}

/// GB/s with decimal gigabytes. Zero for an empty interval.
pub fn gb_per_sec(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 / 1e9 / secs
    } else {
        0.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RoundResult {
    pub elapsed: Duration,
    pub bytes: u64,
    pub throughput: f64,
}

impl RoundResult {
    pub fn completed(bytes: u64, elapsed: Duration) -> Self {
        Self {
            elapsed,
            bytes,
            throughput: gb_per_sec(bytes, elapsed),
        }
    }

    pub fn failed(bytes: u64) -> Self {
        Self {
            elapsed: Duration::ZERO,
            bytes,
            throughput: 0.0,
        }
    }
}

#[derive(Debug)]
pub enum RoundOutcome {
    Completed(Duration),
    /// The engine refused to post the transfer. Later rounds may still run.
    Rejected(BenchError),
}

/// One round as seen from one side of a pair.
pub struct TransferRound<'a> {
    engine: &'a dyn TransferEngine,
    session: &'a TransferSession,
    role: Role,
    policy: CompletionPolicy,
    interrupt: &'a Interrupt,
}

impl<'a> TransferRound<'a> {
    pub fn new(
        engine: &'a dyn TransferEngine,
        session: &'a TransferSession,
        role: Role,
        policy: CompletionPolicy,
        interrupt: &'a Interrupt,
    ) -> Self {
        Self {
            engine,
            session,
            role,
            policy,
            interrupt,
        }
    }

    /// Runs the round and returns its wall-clock duration.
    ///
    /// An `Err` is terminal for the unit: no further round should start.
    pub fn run(&self) -> Result<RoundOutcome> {
        match self.role {
            Role::Creator => self.initiate(),
            Role::Peer => self.observe(),
        }
    }

    fn initiate(&self) -> Result<RoundOutcome> {
        let handle = self.session.handle.as_ref().ok_or_else(|| {
            BenchError::Transfer("Creator holds no transfer handle".to_string())
        })?;

        let started = Instant::now();
        let status = self
            .engine
            .execute(handle)
            .map_err(BenchError::into_transfer)?;
        if status == XferStatus::Err {
            return Ok(RoundOutcome::Rejected(BenchError::Transfer(
                "Engine reported ERR when posting the transfer".to_string(),
            )));
        }

        self.policy.wait(self.interrupt, || {
            match self
                .engine
                .poll_status(handle)
                .map_err(BenchError::into_transfer)?
            {
                XferStatus::Done => Ok(Some(())),
                XferStatus::Pending => Ok(None),
                XferStatus::Err => Err(BenchError::Transfer(
                    "Engine reported ERR while polling".to_string(),
                )),
            }
        })?;
        Ok(RoundOutcome::Completed(started.elapsed()))
    }

    fn observe(&self) -> Result<RoundOutcome> {
        let started = Instant::now();
        self.policy.wait(self.interrupt, || {
            let done = self
                .engine
                .poll_remote_done(
                    &self.session.remote_agent,
                    &self.session.session_id,
                )
                .map_err(BenchError::into_transfer)?;
            Ok(done.then_some(()))
        })?;
        Ok(RoundOutcome::Completed(started.elapsed()))
    }
}

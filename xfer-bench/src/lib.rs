//! # Point-to-point transfer benchmark
//!
//! Measures the throughput of bulk memory transfers driven through a
//! [`TransferEngine`](xfer_engine::TransferEngine). Two processes, or two
//! harnesses in one process, play complementary roles:
//!
//! - the **creator** connects, sends `START` and initiates every transfer;
//! - the **peer** binds, serves its descriptors and waits for each transfer
//!   to land.
//!
//! A run spawns `threads` independent units per side. Unit `i` of one side
//! pairs with unit `i` of the other over a private control channel on
//! `port + i`. All units of a side meet at a [`StartGate`] once their
//! handshake is done, so measured rounds start together.
//!
//! ```no_run
//! # async fn demo() -> xfer_error::Result<()> {
//! use std::sync::Arc;
//! use xfer_bench::{BenchConfig, BenchmarkHarness, Interrupt};
//! use xfer_engine::LoopbackFabric;
//!
//! let config = BenchConfig::from_toml_file("bench.toml")?;
//! let harness = BenchmarkHarness::new(config, Arc::new(LoopbackFabric::new()))?;
//! let result = harness.run(&Interrupt::new()).await;
//! println!("{:.2} GB/s", result.total);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod endpoint;
pub mod handshake;
pub mod harness;
pub mod interrupt;
pub mod logging;
pub mod orchestrator;
pub mod round;

pub use config::BenchConfig;
pub use endpoint::{agent_name, RemoteEndpointRef, Role, UnitContext};
pub use handshake::{HandshakeState, TransferSession};
pub use harness::{BenchmarkHarness, BenchmarkResult, ResultSink, StartGate};
pub use interrupt::Interrupt;
pub use orchestrator::{PairOrchestrator, PairResources, UnitOutcome};
pub use round::{CompletionPolicy, RoundResult};

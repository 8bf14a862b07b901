use std::{fs, path::Path, time::Duration};

use log::warn;
use serde::{Deserialize, Serialize};
use xfer_engine::{BlockShape, Dtype, XferOp};
use xfer_error::{BenchError, Result};

use crate::{endpoint::Role, round::CompletionPolicy};

/// Parameters of one benchmark run.
///
/// Every field has a default, so a config file only needs to name what it
/// changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub role: Role,
    pub operation: XferOp,
    /// `cpu`, or an accelerator kind such as `cuda` to spread units over
    /// every accelerator the engine reports.
    pub device: String,
    pub num_blocks: usize,
    pub num_layers: usize,
    pub block_size: usize,
    pub hidden_dim: usize,
    pub dtype: Dtype,
    pub threads: usize,
    pub iters: usize,
    pub host: String,
    /// Unit `i` talks over `port + i`.
    pub port: u16,
    pub connect_timeout_ms: u64,
    /// Upper bound on a single completion wait. Unbounded when absent.
    pub completion_timeout_ms: Option<u64>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            role: Role::Creator,
            operation: XferOp::Write,
            device: "cpu".to_string(),
            num_blocks: 100,
            num_layers: 32,
            block_size: 256,
            hidden_dim: 1024,
            dtype: Dtype::BFloat16,
            threads: 1,
            iters: 1,
            host: "0.0.0.0".to_string(),
            port: 5555,
            connect_timeout_ms: 30_000,
            completion_timeout_ms: None,
        }
    }
}

impl BenchConfig {
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| {
            BenchError::Config(format!(
                "Failed to parse {}: {}",
                path.display(),
                e
            ))
        })
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("num_blocks", self.num_blocks),
            ("num_layers", self.num_layers),
            ("block_size", self.block_size),
            ("hidden_dim", self.hidden_dim),
            ("threads", self.threads),
            ("iters", self.iters),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(BenchError::Config(format!(
                    "{} must be at least 1",
                    name
                )));
            }
        }

        let dataset_bytes = [
            self.num_layers,
            2,
            self.block_size,
            self.hidden_dim,
            self.num_blocks,
            self.dtype.size(),
        ]
        .into_iter()
        .try_fold(1usize, |acc, n| acc.checked_mul(n))
        .filter(|bytes| *bytes <= isize::MAX as usize);
        if dataset_bytes.is_none() {
            return Err(BenchError::Config(format!(
                "{} blocks of {:?} {} do not fit in addressable memory",
                self.num_blocks,
                self.block_shape(),
                self.dtype
            )));
        }

        let last_port = self.port as usize + self.threads - 1;
        if last_port > u16::MAX as usize {
            return Err(BenchError::Config(format!(
                "{} threads starting at port {} run past port {}",
                self.threads,
                self.port,
                u16::MAX
            )));
        }
        Ok(())
    }

    pub fn block_shape(&self) -> BlockShape {
        BlockShape {
            num_layers: self.num_layers,
            block_size: self.block_size,
            hidden_dim: self.hidden_dim,
        }
    }

    /// Port of unit `index`. Callers validate first.
    pub fn unit_port(&self, index: usize) -> u16 {
        self.port.saturating_add(index as u16)
    }

    pub fn control_addr(&self, index: usize) -> String {
        format!("{}:{}", self.host, self.unit_port(index))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn completion_policy(&self) -> CompletionPolicy {
        match self.completion_timeout_ms {
            Some(ms) => CompletionPolicy::Deadline(Duration::from_millis(ms)),
            None => CompletionPolicy::Spin,
        }
    }

    /// Devices the units are spread over, round-robin.
    pub fn devices(&self, accelerators: usize) -> Vec<String> {
        let kind = self.device.split(':').next().unwrap_or_default();
        if kind.eq_ignore_ascii_case("cpu") {
            return vec!["cpu".to_string()];
        }
        if accelerators == 0 {
            warn!(
                "No {} devices reported by the engine, falling back to cpu",
                kind
            );
            return vec!["cpu".to_string()];
        }
        (0..accelerators)
            .map(|i| format!("{}:{}", kind, i))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;
    use tempdir::TempDir;

    #[test]
    fn reads_partial_toml_over_defaults() {
        let dir = TempDir::new("xfer-config").unwrap();
        let path = dir.path().join("bench.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
role = "peer"
operation = "READ"
dtype = "float32"
threads = 4
completion_timeout_ms = 2500
"#
        )
        .unwrap();

        let config = BenchConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.role, Role::Peer);
        assert_eq!(config.operation, XferOp::Read);
        assert_eq!(config.dtype, Dtype::Float32);
        assert_eq!(config.threads, 4);
        assert_eq!(config.num_blocks, 100);
        assert_eq!(config.port, 5555);
        assert_eq!(
            config.completion_policy(),
            CompletionPolicy::Deadline(Duration::from_millis(2500))
        );
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let dir = TempDir::new("xfer-config").unwrap();
        let path = dir.path().join("bench.toml");
        fs::write(&path, "threads = \"many\"").unwrap();

        let err = BenchConfig::from_toml_file(&path).unwrap_err();
        assert!(matches!(err, BenchError::Config(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = TempDir::new("xfer-config").unwrap();
        let err = BenchConfig::from_toml_file(dir.path().join("absent.toml"))
            .unwrap_err();
        assert!(matches!(err, BenchError::Io(_)));
    }

    #[rstest]
    #[case::blocks(BenchConfig { num_blocks: 0, ..Default::default() })]
    #[case::threads(BenchConfig { threads: 0, ..Default::default() })]
    #[case::iters(BenchConfig { iters: 0, ..Default::default() })]
    #[case::ports(BenchConfig { port: 65535, threads: 2, ..Default::default() })]
    #[case::overflow(BenchConfig { hidden_dim: usize::MAX / 2, ..Default::default() })]
    #[case::too_large(BenchConfig {
        num_blocks: isize::MAX as usize / 2 + 1,
        num_layers: 1,
        block_size: 1,
        hidden_dim: 1,
        dtype: Dtype::UInt8,
        ..Default::default()
    })]
    fn rejects_invalid_config(#[case] config: BenchConfig) {
        assert!(matches!(config.validate(), Err(BenchError::Config(_))));
    }

    #[test]
    fn units_get_consecutive_ports() {
        let config = BenchConfig {
            host: "127.0.0.1".to_string(),
            port: 6000,
            threads: 3,
            ..Default::default()
        };
        config.validate().unwrap();
        assert_eq!(config.control_addr(0), "127.0.0.1:6000");
        assert_eq!(config.control_addr(2), "127.0.0.1:6002");
    }

    #[rstest]
    #[case("cpu", 4, vec!["cpu"])]
    #[case("cuda", 0, vec!["cpu"])]
    #[case("cuda", 2, vec!["cuda:0", "cuda:1"])]
    #[case("cuda:1", 2, vec!["cuda:0", "cuda:1"])]
    fn resolves_devices(
        #[case] device: &str,
        #[case] accelerators: usize,
        #[case] expected: Vec<&str>,
    ) {
        let config = BenchConfig {
            device: device.to_string(),
            ..Default::default()
        };
        assert_eq!(config.devices(accelerators), expected);
    }
}

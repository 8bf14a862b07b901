//! Same-sized host buffers the benchmark registers and moves.

use std::{
    fmt,
    str::FromStr,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use serde::{Deserialize, Serialize};
use xfer_error::{BenchError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    BFloat16,
    Float32,
    Float64,
    UInt8,
}

impl Dtype {
    /// Element size in bytes.
    pub fn size(&self) -> usize {
        match self {
            Dtype::BFloat16 => 2,
            Dtype::Float32 => 4,
            Dtype::Float64 => 8,
            Dtype::UInt8 => 1,
        }
    }

    pub fn encode(&self, value: f64) -> Vec<u8> {
        match self {
            Dtype::BFloat16 => {
                // round to nearest even on the dropped mantissa bits
                let bits = (value as f32).to_bits();
                let rounded = bits
                    .wrapping_add(0x7fff)
                    .wrapping_add((bits >> 16) & 1);
                ((rounded >> 16) as u16).to_le_bytes().to_vec()
            }
            Dtype::Float32 => (value as f32).to_le_bytes().to_vec(),
            Dtype::Float64 => value.to_le_bytes().to_vec(),
            Dtype::UInt8 => vec![value.clamp(0.0, 255.0) as u8],
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> f64 {
        match self {
            Dtype::BFloat16 => {
                let half = u16::from_le_bytes([bytes[0], bytes[1]]);
                f32::from_bits((half as u32) << 16) as f64
            }
            Dtype::Float32 => f32::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ]) as f64,
            Dtype::Float64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[..8]);
                f64::from_le_bytes(raw)
            }
            Dtype::UInt8 => bytes[0] as f64,
        }
    }
}

impl FromStr for Dtype {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bfloat16" | "bf16" => Ok(Dtype::BFloat16),
            "float32" | "f32" => Ok(Dtype::Float32),
            "float64" | "f64" => Ok(Dtype::Float64),
            "uint8" | "u8" => Ok(Dtype::UInt8),
            other => {
                Err(BenchError::Config(format!("Unsupported dtype '{}'", other)))
            }
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dtype::BFloat16 => "bfloat16",
            Dtype::Float32 => "float32",
            Dtype::Float64 => "float64",
            Dtype::UInt8 => "uint8",
        };
        write!(f, "{}", name)
    }
}

/// Shape of one block: `(num_layers, 2, block_size, hidden_dim)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockShape {
    pub num_layers: usize,
    pub block_size: usize,
    pub hidden_dim: usize,
}

impl BlockShape {
    pub fn numel(&self) -> usize {
        self.num_layers * 2 * self.block_size * self.hidden_dim
    }
}

/// A shared, lockable byte buffer holding `numel` elements of one dtype.
///
/// Clones share the same memory, which is what lets an engine write into a
/// buffer that the dataset still owns.
#[derive(Clone)]
pub struct Block {
    dtype: Dtype,
    data: Arc<RwLock<Vec<u8>>>,
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("dtype", &self.dtype)
            .field("len_bytes", &self.len_bytes())
            .finish()
    }
}

impl Block {
    pub fn filled(dtype: Dtype, numel: usize, value: f64) -> Self {
        Self {
            dtype,
            data: Arc::new(RwLock::new(dtype.encode(value).repeat(numel))),
        }
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn len_bytes(&self) -> usize {
        self.read().len()
    }

    pub fn numel(&self) -> usize {
        self.len_bytes() / self.dtype.size()
    }

    pub fn fill(&self, value: f64) {
        let element = self.dtype.encode(value);
        let mut data = self.write();
        for chunk in data.chunks_exact_mut(element.len()) {
            chunk.copy_from_slice(&element);
        }
    }

    pub fn mean(&self) -> f64 {
        let data = self.read();
        let size = self.dtype.size();
        let numel = data.len() / size;
        if numel == 0 {
            return 0.0;
        }
        let sum: f64 = data
            .chunks_exact(size)
            .map(|chunk| self.dtype.decode(chunk))
            .sum();
        sum / numel as f64
    }

    /// Overwrites this block with the contents of `source`.
    pub fn copy_from(&self, source: &Block) -> Result<()> {
        if Arc::ptr_eq(&self.data, &source.data) {
            return Ok(());
        }
        let src = source.read();
        let mut dst = self.write();
        if src.len() != dst.len() {
            return Err(BenchError::Engine(format!(
                "Block size mismatch: source {} bytes, destination {} bytes",
                src.len(),
                dst.len()
            )));
        }
        dst.copy_from_slice(&src);
        Ok(())
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// The full set of blocks one endpoint registers.
#[derive(Clone, Debug)]
pub struct Dataset {
    dtype: Dtype,
    shape: BlockShape,
    blocks: Vec<Block>,
}

impl Dataset {
    pub fn create(
        shape: BlockShape,
        dtype: Dtype,
        num_blocks: usize,
        fill: f64,
    ) -> Self {
        let blocks = (0..num_blocks)
            .map(|_| Block::filled(dtype, shape.numel(), fill))
            .collect();
        Self {
            dtype,
            shape,
            blocks,
        }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn shape(&self) -> BlockShape {
        self.shape
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn block_bytes(&self) -> usize {
        self.shape.numel() * self.dtype.size()
    }

    pub fn total_bytes(&self) -> usize {
        self.block_bytes() * self.blocks.len()
    }

    /// Checks that every block's mean equals `expected` within `tolerance`.
    pub fn verify_fill(&self, expected: f64, tolerance: f64) -> Result<()> {
        for (i, block) in self.blocks.iter().enumerate() {
            let mean = block.mean();
            if (mean - expected).abs() > tolerance {
                return Err(BenchError::Correctness(format!(
                    "Block {} has mean {}, expected {}",
                    i, mean, expected
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn shape() -> BlockShape {
        BlockShape {
            num_layers: 2,
            block_size: 4,
            hidden_dim: 3,
        }
    }

    #[rstest]
    #[case(Dtype::BFloat16)]
    #[case(Dtype::Float32)]
    #[case(Dtype::Float64)]
    #[case(Dtype::UInt8)]
    fn encodes_small_integers_exactly(#[case] dtype: Dtype) {
        for value in [0.0, 1.0, 2.0, 7.0] {
            let bytes = dtype.encode(value);
            assert_eq!(bytes.len(), dtype.size());
            assert_eq!(dtype.decode(&bytes), value);
        }
    }

    #[test]
    fn dataset_footprint_follows_shape_and_dtype() {
        let dataset = Dataset::create(shape(), Dtype::BFloat16, 5, 1.0);
        assert_eq!(dataset.block_bytes(), 2 * 2 * 4 * 3 * 2);
        assert_eq!(dataset.total_bytes(), 5 * dataset.block_bytes());
        assert_eq!(dataset.blocks()[0].numel(), shape().numel());
    }

    #[test]
    fn verify_fill_reports_the_first_bad_block() {
        let dataset = Dataset::create(shape(), Dtype::Float32, 3, 1.0);
        assert!(dataset.verify_fill(1.0, 1e-8).is_ok());

        dataset.blocks()[1].fill(0.0);
        let err = dataset.verify_fill(1.0, 1e-8).unwrap_err();
        assert!(err.to_string().contains("Block 1"));
    }

    #[test]
    fn copy_between_blocks_shares_memory_with_dataset() {
        let source = Dataset::create(shape(), Dtype::BFloat16, 1, 1.0);
        let target = Dataset::create(shape(), Dtype::BFloat16, 1, 0.0);

        let alias = target.blocks()[0].clone();
        alias.copy_from(&source.blocks()[0]).unwrap();

        assert_eq!(target.blocks()[0].mean(), 1.0);
    }

    #[test]
    fn copy_rejects_mismatched_sizes() {
        let small = Block::filled(Dtype::UInt8, 4, 1.0);
        let large = Block::filled(Dtype::UInt8, 8, 0.0);
        assert!(large.copy_from(&small).is_err());
    }

    #[test]
    fn parses_dtype_names() {
        assert_eq!("bfloat16".parse::<Dtype>().unwrap(), Dtype::BFloat16);
        assert_eq!("F32".parse::<Dtype>().unwrap(), Dtype::Float32);
        assert!("int4".parse::<Dtype>().is_err());
    }
}

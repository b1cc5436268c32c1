//! Model identity, runtime options, and metadata.
//!
//! A model is identified by the content digest of its manifest
//! ([`ModelKey`]); the subset of runtime options that changes runner
//! behavior is hashed into an [`OptionsKey`]. Two requests agreeing on both
//! keys may share a runner process.

pub mod store;

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content-addressed model identifier: hex sha256 of the manifest bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelKey(String);

impl ModelKey {
    pub fn from_manifest_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading digits, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint of the runner-affecting option subset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionsKey(String);

impl OptionsKey {
    /// Hash the options in a fixed field order so the fingerprint is
    /// deterministic across runs.
    pub fn of(options: &RunnerOptions) -> Self {
        let canonical = format!(
            "ctx={};batch={};parallel={};kv={};fa={};ngl={};mlock={};numa={};visible={}",
            options.context_length,
            options.batch,
            options.num_parallel,
            options.kv_cache_type.as_str(),
            options.flash_attention,
            options
                .num_gpu_layers
                .map(|n| n.to_string())
                .unwrap_or_else(|| "auto".into()),
            options.mlock,
            options.numa.as_deref().unwrap_or("-"),
            options
                .visible_devices
                .as_ref()
                .map(|v| v.join("+"))
                .unwrap_or_else(|| "-".into()),
        );
        Self(hex::encode(Sha256::digest(canonical.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for OptionsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a model can do. Requests declare what they need; a mismatch is
/// rejected before any scheduling work happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Completion,
    Tools,
    Thinking,
    Vision,
    Embedding,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::Completion => "completion",
            Capability::Tools => "tools",
            Capability::Thinking => "thinking",
            Capability::Vision => "vision",
            Capability::Embedding => "embedding",
        };
        f.write_str(s)
    }
}

/// KV cache quantization type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvCacheType {
    F32,
    F16,
    Bf16,
    #[serde(rename = "q8_0")]
    Q8_0,
    #[serde(rename = "q4_0")]
    Q4_0,
    #[serde(rename = "q4_1")]
    Q4_1,
    #[serde(rename = "q5_0")]
    Q5_0,
    #[serde(rename = "q5_1")]
    Q5_1,
}

impl KvCacheType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KvCacheType::F32 => "f32",
            KvCacheType::F16 => "f16",
            KvCacheType::Bf16 => "bf16",
            KvCacheType::Q8_0 => "q8_0",
            KvCacheType::Q4_0 => "q4_0",
            KvCacheType::Q4_1 => "q4_1",
            KvCacheType::Q5_0 => "q5_0",
            KvCacheType::Q5_1 => "q5_1",
        }
    }

    /// Bytes per cached element.
    ///
    /// Quantized types use block-based encoding, so the per-element cost is
    /// the block size divided by elements-per-block.
    pub fn bytes_per_element(&self) -> f64 {
        match self {
            KvCacheType::F32 => 4.0,
            KvCacheType::F16 | KvCacheType::Bf16 => 2.0,
            KvCacheType::Q8_0 => 1.0625,
            KvCacheType::Q4_0 => 0.5625,
            KvCacheType::Q4_1 => 0.625,
            KvCacheType::Q5_0 => 0.6875,
            KvCacheType::Q5_1 => 0.75,
        }
    }
}

impl Default for KvCacheType {
    fn default() -> Self {
        KvCacheType::F16
    }
}

/// Model structure the memory estimator works from, read from the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub architecture: String,
    /// Number of transformer blocks.
    pub block_count: u32,
    /// Weight bytes per transformer block. When fewer entries than blocks
    /// are given the last entry repeats, so a uniform model needs one entry.
    pub layer_sizes: Vec<u64>,
    /// Weight bytes of the output projection head.
    pub output_bytes: u64,
    pub embedding_length: u32,
    pub kv_head_count: u32,
    pub head_dim: u32,
    /// Vision projector weight bytes, 0 when the model has none.
    #[serde(default)]
    pub projector_bytes: u64,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

impl ModelMetadata {
    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    /// Weight bytes of block `i`.
    pub fn layer_size(&self, i: usize) -> u64 {
        self.layer_sizes
            .get(i)
            .or_else(|| self.layer_sizes.last())
            .copied()
            .unwrap_or(0)
    }

    /// Total weight bytes across blocks, output head, and projector.
    pub fn weight_bytes(&self) -> u64 {
        (0..self.block_count as usize)
            .map(|i| self.layer_size(i))
            .sum::<u64>()
            + self.output_bytes
            + self.projector_bytes
    }
}

/// The runtime options that shape a runner process. All fields participate
/// in the options fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerOptions {
    #[serde(default = "default_context_length")]
    pub context_length: u32,
    #[serde(default = "default_batch")]
    pub batch: u32,
    /// Concurrent sequences the runner serves. 0 = use the server default.
    #[serde(default)]
    pub num_parallel: u32,
    #[serde(default)]
    pub kv_cache_type: KvCacheType,
    #[serde(default)]
    pub flash_attention: bool,
    /// Cap on GPU-offloaded layers. None = offload as many as fit.
    #[serde(default)]
    pub num_gpu_layers: Option<u32>,
    #[serde(default)]
    pub mlock: bool,
    #[serde(default)]
    pub numa: Option<String>,
    /// Device-id subset this request may be placed on. None = all.
    #[serde(default)]
    pub visible_devices: Option<Vec<String>>,
}

fn default_context_length() -> u32 { 4096 }
fn default_batch() -> u32 { 512 }

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            context_length: default_context_length(),
            batch: default_batch(),
            num_parallel: 0,
            kv_cache_type: KvCacheType::default(),
            flash_attention: false,
            num_gpu_layers: None,
            mlock: false,
            numa: None,
            visible_devices: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_key_digest() {
        let a = ModelKey::from_manifest_bytes(b"manifest-a");
        let b = ModelKey::from_manifest_bytes(b"manifest-b");
        assert_ne!(a, b);
        assert_eq!(a, ModelKey::from_manifest_bytes(b"manifest-a"));
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_options_key_stable() {
        let opts = RunnerOptions::default();
        assert_eq!(OptionsKey::of(&opts), OptionsKey::of(&opts.clone()));
    }

    #[test]
    fn test_options_key_differs_on_runner_affecting_fields() {
        let base = RunnerOptions { num_parallel: 1, ..RunnerOptions::default() };
        let bigger_ctx = RunnerOptions { context_length: 8192, ..base.clone() };
        let quantized = RunnerOptions { kv_cache_type: KvCacheType::Q4_0, ..base.clone() };
        let capped = RunnerOptions { num_gpu_layers: Some(10), ..base.clone() };
        assert_ne!(OptionsKey::of(&base), OptionsKey::of(&bigger_ctx));
        assert_ne!(OptionsKey::of(&base), OptionsKey::of(&quantized));
        assert_ne!(OptionsKey::of(&base), OptionsKey::of(&capped));
    }

    #[test]
    fn test_kv_cache_bytes_per_element() {
        assert_eq!(KvCacheType::F32.bytes_per_element(), 4.0);
        assert_eq!(KvCacheType::F16.bytes_per_element(), 2.0);
        assert_eq!(KvCacheType::Q8_0.bytes_per_element(), 1.0625);
        assert_eq!(KvCacheType::Q4_0.bytes_per_element(), 0.5625);
    }

    #[test]
    fn test_layer_size_last_entry_repeats() {
        let meta = ModelMetadata {
            architecture: "llama".into(),
            block_count: 4,
            layer_sizes: vec![100],
            output_bytes: 50,
            embedding_length: 4096,
            kv_head_count: 8,
            head_dim: 128,
            projector_bytes: 0,
            capabilities: vec![Capability::Completion],
        };
        assert_eq!(meta.layer_size(0), 100);
        assert_eq!(meta.layer_size(3), 100);
        assert_eq!(meta.weight_bytes(), 4 * 100 + 50);
    }
}

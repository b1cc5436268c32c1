//! Memory estimation for runner placement.
//!
//! [`fit`] is a pure function from model structure, runtime options, and
//! per-device VRAM budgets to a placement: how many layers land on which
//! GPU, what spills to host memory, and how much VRAM each device will be
//! charged for. The scheduler reserves exactly these figures in its ledger,
//! so the function must be deterministic — identical inputs produce
//! byte-identical output, with no clock, randomness, or I/O anywhere.

use serde::Serialize;

use crate::discover::{DeviceId, LibraryTag};
use crate::model::{ModelMetadata, RunnerOptions};

/// VRAM the caller is willing to let us schedule on one device, after OS
/// overhead, existing reservations, and the configured per-GPU reserve.
#[derive(Debug, Clone)]
pub struct GpuBudget {
    pub id: DeviceId,
    pub library: LibraryTag,
    pub available: u64,
}

/// A concrete placement produced by [`fit`].
#[derive(Debug, Clone, Serialize)]
pub struct MemoryEstimate {
    /// Devices actually used, in assignment order.
    pub gpus: Vec<DeviceId>,
    /// VRAM charged per device in `gpus`, including fixed overheads.
    pub vram_per_gpu: Vec<u64>,
    pub total_vram: u64,
    /// Host memory for the non-offloaded tail, KV included.
    pub cpu_bytes: u64,
    /// Offloaded layer count; the output head counts as one layer.
    pub layers_offloaded: u32,
    pub fully_loaded: bool,
    /// Layers per device in `gpus`, for the runner's `--tensor-split`.
    pub tensor_split: Vec<u32>,
}

impl MemoryEstimate {
    /// Human-readable one-liner for log messages.
    pub fn summary(&self) -> String {
        format!(
            "layers={}{} vram={:.1}GiB cpu={:.1}GiB gpus={}",
            self.layers_offloaded,
            if self.fully_loaded { " (full)" } else { "" },
            self.total_vram as f64 / GIB_F,
            self.cpu_bytes as f64 / GIB_F,
            if self.gpus.is_empty() {
                "none".to_string()
            } else {
                self.gpus
                    .iter()
                    .map(|g| g.as_str())
                    .collect::<Vec<_>>()
                    .join(",")
            },
        )
    }
}

const GIB_F: f64 = 1024.0 * 1024.0 * 1024.0;

/// KV cache bytes one transformer block needs: keys and values across the
/// full context window at the configured batch size.
fn kv_bytes_per_layer(meta: &ModelMetadata, options: &RunnerOptions) -> u64 {
    let elements = 2u64
        * meta.kv_head_count as u64
        * meta.head_dim as u64
        * options.context_length as u64
        * options.batch as u64;
    (elements as f64 * options.kv_cache_type.bytes_per_element()).ceil() as u64
}

/// Per-device compute scratch: one batch of activations at full width.
fn compute_buffer_bytes(meta: &ModelMetadata, options: &RunnerOptions) -> u64 {
    options.batch as u64 * meta.embedding_length as u64 * 4
}

/// Place a model across the given budgets.
///
/// `spread` selects the distribution policy: fill devices in budget order,
/// or spread layers across all devices proportionally to what each has
/// free. Layers are never split; whatever doesn't fit stays on the host.
pub fn fit(
    meta: &ModelMetadata,
    options: &RunnerOptions,
    budgets: &[GpuBudget],
    spread: bool,
) -> MemoryEstimate {
    let block_count = meta.block_count;
    let total_layers = block_count + 1;
    let layer_cap = options.num_gpu_layers.unwrap_or(total_layers).min(total_layers);
    let kv_per_layer = kv_bytes_per_layer(meta, options);
    let compute = compute_buffer_bytes(meta, options);

    // Remaining capacity per budget once its fixed overheads are paid.
    // A device whose budget doesn't cover the overheads is never opened.
    let mut remaining: Vec<u64> = budgets
        .iter()
        .map(|b| {
            let fixed = b.library.graph_overhead() + compute;
            if b.available > fixed { b.available - fixed } else { 0 }
        })
        .collect();
    let mut split: Vec<u32> = vec![0; budgets.len()];
    let mut used: Vec<u64> = vec![0; budgets.len()];

    let pick = |remaining: &[u64], cost: u64| -> Option<usize> {
        if spread {
            // largest remaining budget wins, earlier device breaks ties
            remaining
                .iter()
                .enumerate()
                .filter(|(_, r)| **r >= cost)
                .max_by_key(|(i, r)| (**r, std::cmp::Reverse(*i)))
                .map(|(i, _)| i)
        } else {
            remaining.iter().position(|r| *r >= cost)
        }
    };

    let mut layers_offloaded = 0u32;
    let mut projector_placed = meta.projector_bytes == 0;

    for i in 0..block_count as usize {
        if layers_offloaded >= layer_cap {
            break;
        }
        let mut cost = meta.layer_size(i) + kv_per_layer;
        // the projector rides with the first offloaded layer
        if !projector_placed {
            cost += meta.projector_bytes;
        }
        let Some(target) = pick(&remaining, cost) else { break };
        remaining[target] -= cost;
        used[target] += cost;
        split[target] += 1;
        layers_offloaded += 1;
        projector_placed = true;
    }

    // The output head is only offloaded once every block is; a partial
    // offload keeps it on the host next to the tail layers.
    let mut output_offloaded = false;
    if layers_offloaded == block_count && layers_offloaded < layer_cap {
        if let Some(target) = pick(&remaining, meta.output_bytes) {
            remaining[target] -= meta.output_bytes;
            used[target] += meta.output_bytes;
            layers_offloaded += 1;
            output_offloaded = true;
        }
    }

    // Host tail: weights and KV of every layer that stayed behind.
    let offloaded_blocks = layers_offloaded.min(block_count);
    let mut cpu_bytes: u64 = (offloaded_blocks as usize..block_count as usize)
        .map(|i| meta.layer_size(i) + kv_per_layer)
        .sum();
    if !output_offloaded {
        cpu_bytes += meta.output_bytes;
    }
    if !projector_placed {
        cpu_bytes += meta.projector_bytes;
    }

    // Report only the devices that actually hold something, preserving
    // budget order so the tensor split lines up with device visibility.
    let mut gpus = Vec::new();
    let mut vram_per_gpu = Vec::new();
    let mut tensor_split = Vec::new();
    for (i, budget) in budgets.iter().enumerate() {
        if split[i] > 0 || used[i] > 0 {
            let fixed = budget.library.graph_overhead() + compute;
            gpus.push(budget.id.clone());
            vram_per_gpu.push(used[i] + fixed);
            tensor_split.push(split[i]);
        }
    }
    let total_vram = vram_per_gpu.iter().sum();

    MemoryEstimate {
        gpus,
        vram_per_gpu,
        total_vram,
        cpu_bytes,
        layers_offloaded,
        fully_loaded: layers_offloaded == total_layers,
        tensor_split,
    }
}

/// Placement with no GPU at all; everything lands on the host.
pub fn cpu_only(meta: &ModelMetadata, options: &RunnerOptions) -> MemoryEstimate {
    fit(meta, options, &[], false)
}

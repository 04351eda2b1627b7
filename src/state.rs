//! Running state carried across compression calls.

use std::collections::HashMap;
use std::mem::size_of;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;

use crate::compression::{mask_words, seed_lane_rngs};
use crate::config::DgcConfig;
use crate::device::Device;
use crate::element::{Element, Gradient};
use crate::error::{DgcError, Result};
use crate::memory::{DeviceArena, PinnedHostBuffer};
use crate::token::TokenPool;
use crate::types::{DataType, Layer};

/// Largest layer whose indices fit below the `u32` sentinel.
pub const MAX_LAYER_ELEMENTS: usize = u32::MAX as usize - 1;

struct LayerRecord {
    byte_offset: usize,
    num_elements: usize,
    steps: u64,
}

/// Device arenas owned by a [`DgcState`]. All of them only grow.
#[derive(Clone)]
pub(crate) struct Buffers {
    pub velocity: Arc<DeviceArena>,
    pub prev_velocity: Arc<DeviceArena>,
    pub accumulated: Arc<DeviceArena>,
    pub prev_accumulated: Arc<DeviceArena>,
    pub samples: Arc<DeviceArena>,
    pub thresholds: Arc<DeviceArena>,
    pub counters: Arc<DeviceArena>,
    pub send_values: Arc<DeviceArena>,
    pub send_indices: Arc<DeviceArena>,
    pub recv_values: Arc<DeviceArena>,
    pub recv_indices: Arc<DeviceArena>,
    pub global_gradients: Arc<DeviceArena>,
    pub masks: Arc<DeviceArena>,
    pub union_masks: Arc<DeviceArena>,
    pub mask_offsets: Arc<DeviceArena>,
    pub mask_counters: Arc<DeviceArena>,
    pub union_values: Arc<DeviceArena>,
    pub layer_starts: Arc<DeviceArena>,
    pub sample_starts: Arc<DeviceArena>,
}

impl Buffers {
    fn allocate(device: &Arc<Device>) -> Result<Self> {
        Ok(Self {
            velocity: device.alloc("velocity", 0)?,
            prev_velocity: device.alloc("prev_velocity", 0)?,
            accumulated: device.alloc("accumulated", 0)?,
            prev_accumulated: device.alloc("prev_accumulated", 0)?,
            samples: device.alloc("samples", 0)?,
            thresholds: device.alloc("thresholds", 0)?,
            counters: device.alloc("send_counters", 0)?,
            send_values: device.alloc("send_values", 0)?,
            send_indices: device.alloc("send_indices", 0)?,
            recv_values: device.alloc("recv_values", 0)?,
            recv_indices: device.alloc("recv_indices", 0)?,
            global_gradients: device.alloc("global_gradients", 0)?,
            masks: device.alloc("send_masks", 0)?,
            union_masks: device.alloc("recv_masks", 0)?,
            mask_offsets: device.alloc("mask_offsets", 0)?,
            mask_counters: device.alloc("mask_counters", 0)?,
            union_values: device.alloc("union_values", 0)?,
            layer_starts: device.alloc("layer_starts", 0)?,
            sample_starts: device.alloc("sample_starts", 0)?,
        })
    }
}

/// Placement of one layer for one call.
#[derive(Debug, Clone)]
pub(crate) struct LayerPlan {
    pub name: String,
    pub num_elements: usize,
    /// Element offset in the flattened input/output buffers.
    pub input_offset: usize,
    /// Element offset in the persistent momentum arenas.
    pub state_offset: usize,
    pub target: usize,
    /// Slot offset in the compacted send buffers.
    pub send_offset: usize,
    pub samples: usize,
    pub sample_offset: usize,
    /// Word offset in the selection bitmask.
    pub mask_offset: usize,
}

impl LayerPlan {
    pub fn input_range(&self) -> std::ops::Range<usize> {
        self.input_offset..self.input_offset + self.num_elements
    }

    pub fn state_range(&self) -> std::ops::Range<usize> {
        self.state_offset..self.state_offset + self.num_elements
    }

    pub fn send_range(&self) -> std::ops::Range<usize> {
        self.send_offset..self.send_offset + self.target
    }

    pub fn sample_range(&self) -> std::ops::Range<usize> {
        self.sample_offset..self.sample_offset + self.samples
    }

    pub fn mask_range(&self) -> std::ops::Range<usize> {
        self.mask_offset..self.mask_offset + mask_words(self.num_elements)
    }
}

/// Layout of one call, shared with the stream jobs that execute it.
#[derive(Debug)]
pub(crate) struct CallPlan {
    pub layers: Vec<LayerPlan>,
    pub total_elements: usize,
    pub total_targets: usize,
    pub total_samples: usize,
    pub total_mask_words: usize,
    /// The exchange sums only the union of every rank's selection.
    pub masked: bool,
    pub sparsity: f64,
    /// Prefix sums of layer sizes, one entry per layer plus the end.
    pub layer_starts: Vec<u64>,
    pub sample_starts: Vec<u64>,
}

/// Pairs one layer contributed to the last exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactedLayer<T> {
    pub name: String,
    pub values: Vec<T>,
    pub indices: Vec<u32>,
}

/// Everything that persists between calls on one worker.
///
/// Layers are identified by name. A layer seen for the first time gets a new
/// region at the end of the momentum arenas; regions are never reused.
pub struct DgcState {
    dtype: Option<DataType>,
    layers: HashMap<String, LayerRecord>,
    offset_byte_counter: usize,
    step: u64,
    epoch: f64,
    buffers: Option<Buffers>,
    rngs: Arc<Mutex<Vec<StdRng>>>,
    tokens: TokenPool,
    last_masks: Option<PinnedHostBuffer<u32>>,
    last_plan: Option<Arc<CallPlan>>,
}

impl Default for DgcState {
    fn default() -> Self {
        Self::new()
    }
}

impl DgcState {
    pub fn new() -> Self {
        Self {
            dtype: None,
            layers: HashMap::new(),
            offset_byte_counter: 0,
            step: 0,
            epoch: 0.0,
            buffers: None,
            rngs: Arc::new(Mutex::new(Vec::new())),
            tokens: TokenPool::new(),
            last_masks: None,
            last_plan: None,
        }
    }

    /// Gradient type the state is bound to, once a call has run.
    pub fn dtype(&self) -> Option<DataType> {
        self.dtype
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn epoch(&self) -> f64 {
        self.epoch
    }

    /// Compression calls that included `layer`.
    pub fn layer_steps(&self, layer: &str) -> Option<u64> {
        self.layers.get(layer).map(|r| r.steps)
    }

    /// Bytes of momentum state reserved so far.
    pub fn offset_byte_counter(&self) -> usize {
        self.offset_byte_counter
    }

    pub fn tokens(&self) -> &TokenPool {
        &self.tokens
    }

    pub(crate) fn tokens_mut(&mut self) -> &mut TokenPool {
        &mut self.tokens
    }

    pub(crate) fn rngs(&self) -> &Arc<Mutex<Vec<StdRng>>> {
        &self.rngs
    }

    /// Host mirror the last call copies its selection masks into.
    #[cfg(test)]
    pub(crate) fn last_masks(&self) -> Option<&PinnedHostBuffer<u32>> {
        self.last_masks.as_ref()
    }

    pub(crate) fn set_last_masks(&mut self, mirror: PinnedHostBuffer<u32>) {
        self.last_masks = Some(mirror);
    }

    pub(crate) fn buffers(&self) -> Result<&Buffers> {
        self.buffers
            .as_ref()
            .ok_or(DgcError::NotConfigured("state buffers are not allocated"))
    }

    /// Bind to `T`, allocate arenas and seed generators on first use.
    pub(crate) fn bind<T: Element>(&mut self, config: &DgcConfig) -> Result<()> {
        match self.dtype {
            Some(expected) if expected != T::DTYPE => {
                return Err(DgcError::DTypeMismatch {
                    expected,
                    actual: T::DTYPE,
                });
            }
            Some(_) => {}
            None => self.dtype = Some(T::DTYPE),
        }

        if self.buffers.is_none() {
            let device = config.stream()?.device();
            self.buffers = Some(Buffers::allocate(device)?);
        }

        let lanes = config.launch().num_lanes();
        let mut rngs = self
            .rngs
            .lock()
            .map_err(|_| DgcError::LockPoisoned("lane generators"))?;
        if rngs.len() < lanes {
            let seeded = seed_lane_rngs(config.rand_seed, lanes);
            let have = rngs.len();
            rngs.extend(seeded.into_iter().skip(have));
        }
        Ok(())
    }

    /// Lay out `layers` for one call and grow every arena to fit it.
    pub(crate) fn plan<T: Gradient>(&mut self, layers: &[Layer], config: &DgcConfig) -> Result<Arc<CallPlan>> {
        let elem = size_of::<T>();
        let sparsity = config.sparsity_at(self.epoch);

        let mut plans = Vec::with_capacity(layers.len());
        let mut layer_starts = Vec::with_capacity(layers.len() + 1);
        let mut sample_starts = Vec::with_capacity(layers.len() + 1);
        let (mut elements, mut targets, mut samples, mut words) = (0usize, 0usize, 0usize, 0usize);

        for layer in layers {
            let n = layer.num_elements;
            if n > MAX_LAYER_ELEMENTS {
                return Err(DgcError::LayerTooLarge {
                    name: layer.name.clone(),
                    num_elements: n,
                });
            }

            let byte_offset = match self.layers.get(&layer.name) {
                Some(record) if record.num_elements != n => {
                    return Err(DgcError::BufferSizeMismatch {
                        expected: record.num_elements * elem,
                        actual: n * elem,
                    });
                }
                Some(record) => record.byte_offset,
                None => {
                    let offset = self.offset_byte_counter;
                    self.offset_byte_counter += n * elem;
                    tracing::trace!(layer = %layer.name, offset, n, "new layer");
                    self.layers.insert(
                        layer.name.clone(),
                        LayerRecord {
                            byte_offset: offset,
                            num_elements: n,
                            steps: 0,
                        },
                    );
                    offset
                }
            };

            let target = config.target_count(n, sparsity);
            let layer_samples = config.sample_count(n);
            layer_starts.push(elements as u64);
            sample_starts.push(samples as u64);
            plans.push(LayerPlan {
                name: layer.name.clone(),
                num_elements: n,
                input_offset: elements,
                state_offset: byte_offset / elem,
                target,
                send_offset: targets,
                samples: layer_samples,
                sample_offset: samples,
                mask_offset: words,
            });
            elements += n;
            targets += target;
            samples += layer_samples;
            words += mask_words(n);
        }
        layer_starts.push(elements as u64);
        sample_starts.push(samples as u64);

        let world = config.topology().global_num_gpus as usize;
        let buffers = self.buffers()?;
        buffers.prev_velocity.ensure_capacity(self.offset_byte_counter)?;
        buffers.prev_accumulated.ensure_capacity(self.offset_byte_counter)?;
        buffers.velocity.ensure_capacity(elements * elem)?;
        buffers.accumulated.ensure_capacity(elements * elem)?;
        buffers.samples.ensure_capacity(samples * elem)?;
        buffers.thresholds.ensure_capacity(layers.len() * elem)?;
        buffers.counters.ensure_capacity(layers.len() * size_of::<u32>())?;
        buffers.send_values.ensure_capacity(targets * elem)?;
        buffers.send_indices.ensure_capacity(targets * size_of::<u32>())?;
        let masked = config.use_allreduce && config.use_masked_allreduce;
        if config.use_allreduce {
            buffers.global_gradients.ensure_capacity(elements * elem)?;
        } else {
            buffers.recv_values.ensure_capacity(world * targets * elem)?;
            buffers.recv_indices.ensure_capacity(world * targets * size_of::<u32>())?;
        }
        buffers.masks.ensure_capacity(words * size_of::<u32>())?;
        if masked {
            let union = elements.min(world.saturating_mul(targets));
            buffers.union_masks.ensure_capacity(words * size_of::<u32>())?;
            buffers.mask_offsets.ensure_capacity(words * size_of::<u64>())?;
            buffers.mask_counters.ensure_capacity(layers.len() * size_of::<u32>())?;
            buffers.union_values.ensure_capacity(union * elem)?;
        }
        buffers.layer_starts.ensure_capacity(layer_starts.len() * size_of::<u64>())?;
        buffers.sample_starts.ensure_capacity(sample_starts.len() * size_of::<u64>())?;

        let plan = Arc::new(CallPlan {
            layers: plans,
            total_elements: elements,
            total_targets: targets,
            total_samples: samples,
            total_mask_words: words,
            masked,
            sparsity,
            layer_starts,
            sample_starts,
        });
        self.last_plan = Some(Arc::clone(&plan));
        Ok(plan)
    }

    /// Advance the step and epoch counters after a compression call.
    pub(crate) fn advance(&mut self, plan: &CallPlan, config: &DgcConfig) {
        for layer in &plan.layers {
            if let Some(record) = self.layers.get_mut(&layer.name) {
                record.steps += 1;
            }
        }
        self.step += 1;
        self.epoch = self.step as f64
            * config.batch_size_per_gpu as f64
            * config.topology().global_num_gpus as f64
            / config.num_examples_per_epoch as f64;
    }

    fn last_plan(&self) -> Result<&Arc<CallPlan>> {
        self.last_plan
            .as_ref()
            .ok_or(DgcError::NotConfigured("no compression call has run"))
    }

    /// Elements each layer sent in the last call, at most its target.
    ///
    /// Reads device state; synchronize the stream first.
    pub fn selected_counts(&self) -> Result<Vec<usize>> {
        let plan = self.last_plan()?;
        let counters = self.buffers()?.counters.read::<u32>(0, plan.layers.len())?;
        Ok(plan
            .layers
            .iter()
            .zip(counters)
            .map(|(layer, c)| (c as usize).min(layer.target))
            .collect())
    }

    /// Per-layer targets of the last call.
    pub fn targets(&self) -> Result<Vec<usize>> {
        Ok(self.last_plan()?.layers.iter().map(|l| l.target).collect())
    }

    /// Sparsity the last call was planned with.
    pub fn last_sparsity(&self) -> Result<f64> {
        Ok(self.last_plan()?.sparsity)
    }

    /// Selection thresholds of the last call.
    pub fn thresholds<T: Gradient>(&self) -> Result<Vec<T>> {
        let plan = self.last_plan()?;
        self.buffers()?.thresholds.read::<T>(0, plan.layers.len())
    }

    /// Compacted send buffers of the last call, padding included.
    pub fn compacted<T: Gradient>(&self) -> Result<Vec<CompactedLayer<T>>> {
        let plan = self.last_plan()?;
        let buffers = self.buffers()?;
        let values = buffers.send_values.read::<T>(0, plan.total_targets)?;
        let indices = buffers.send_indices.read::<u32>(0, plan.total_targets)?;
        Ok(plan
            .layers
            .iter()
            .map(|l| CompactedLayer {
                name: l.name.clone(),
                values: values[l.send_range()].to_vec(),
                indices: indices[l.send_range()].to_vec(),
            })
            .collect())
    }

    /// Host copy of `layer`'s selection bitmask from the last call.
    pub fn selection_mask(&self, layer: &str) -> Result<Option<Vec<u32>>> {
        let plan = self.last_plan()?;
        let Some(l) = plan.layers.iter().find(|l| l.name == layer) else {
            return Ok(None);
        };
        let Some(mirror) = &self.last_masks else {
            return Ok(None);
        };
        let mirror = mirror.lock()?;
        Ok(mirror.get(l.mask_range()).map(<[u32]>::to_vec))
    }

    /// Per-layer size of the union of every rank's selection in the last
    /// call, or `None` when that call did not exchange through the union.
    pub fn union_counts(&self) -> Result<Option<Vec<usize>>> {
        let plan = self.last_plan()?;
        if !plan.masked {
            return Ok(None);
        }
        let counts = self.buffers()?.mask_counters.read::<u32>(0, plan.layers.len())?;
        Ok(Some(counts.into_iter().map(|c| c as usize).collect()))
    }

    /// Carried `(velocity, accumulated velocity)` of `layer`.
    pub fn momentum_state<T: Gradient>(&self, layer: &str) -> Result<Option<(Vec<T>, Vec<T>)>> {
        let Some(record) = self.layers.get(layer) else {
            return Ok(None);
        };
        let buffers = self.buffers()?;
        let offset = record.byte_offset / size_of::<T>();
        let v = buffers.prev_velocity.read::<T>(offset, record.num_elements)?;
        let a = buffers.prev_accumulated.read::<T>(offset, record.num_elements)?;
        Ok(Some((v, a)))
    }
}

impl std::fmt::Debug for DgcState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DgcState")
            .field("dtype", &self.dtype)
            .field("layers", &self.layers.len())
            .field("step", &self.step)
            .field("epoch", &self.epoch)
            .field("tokens", &self.tokens)
            .finish_non_exhaustive()
    }
}

//! Compression entry points.
//!
//! Both calls only enqueue work on the configured stream and return. Observe
//! completion with `config.stream()?.synchronize()`.

use std::mem::size_of;
use std::sync::Arc;

use crate::comm::{CommGroups, hierarchical_all_reduce};
use crate::compression::{
    SelectOutput, accumulate, clip_by_norm, fill, gather_masked, lookup_thresholds, mark_selected,
    mask_and_carry, mask_offsets, pad_layer, sample_magnitudes, scatter, scatter_add,
    scatter_masked, select_at_least, sort_segments_desc,
};
use crate::config::DgcConfig;
use crate::device::{DeviceStream, Event, LaunchConfig};
use crate::element::Gradient;
use crate::error::{DgcError, Result};
use crate::memory::{DeviceArena, as_atomic_u32};
use crate::state::{Buffers, CallPlan, DgcState};
use crate::token::TokenLease;
use crate::types::{DataType, Layer, ReduceOp};

/// Compress, exchange and merge the gradients of `layers`.
///
/// `input` holds the layers back to back in the order given; `output`
/// receives the averaged result in the same layout. They may be the same
/// arena. With local clipping enabled `input` is clipped in place.
pub fn gradient_all_reduce(
    dtype: DataType,
    input: &Arc<DeviceArena>,
    output: &Arc<DeviceArena>,
    layers: &[Layer],
    config: &DgcConfig,
    state: &mut DgcState,
) -> Result<()> {
    config.ensure_configured()?;
    config.stream()?.check_failed()?;
    match dtype {
        DataType::F32 => all_reduce_typed::<f32>(input, output, layers, config, state),
        DataType::F64 => all_reduce_typed::<f64>(input, output, layers, config, state),
        other => Err(DgcError::UnsupportedDType {
            dtype: other,
            op: "gradient_all_reduce",
        }),
    }
}

/// Clip every layer of `gradients` to an L2 norm of at most
/// `config.clipping_threshold`, in place.
///
/// Does not advance the step counters.
pub fn clip_gradient(
    dtype: DataType,
    gradients: &Arc<DeviceArena>,
    layers: &[Layer],
    config: &DgcConfig,
    state: &mut DgcState,
) -> Result<()> {
    config.ensure_configured()?;
    config.stream()?.check_failed()?;
    match dtype {
        DataType::F32 => clip_typed::<f32>(gradients, layers, config, state),
        DataType::F64 => clip_typed::<f64>(gradients, layers, config, state),
        other => Err(DgcError::UnsupportedDType {
            dtype: other,
            op: "clip_gradient",
        }),
    }
}

fn check_size<T: Gradient>(arena: &DeviceArena, elements: usize) -> Result<()> {
    let expected = elements * size_of::<T>();
    let actual = arena.allocated_bytes()?;
    if actual < expected {
        return Err(DgcError::BufferSizeMismatch { expected, actual });
    }
    Ok(())
}

/// Fill the lease's host arrays and queue their copies to the device.
fn stage_offsets(
    stream: &DeviceStream,
    lease: &TokenLease,
    buffers: &Buffers,
    layer_starts: &[u64],
    sample_starts: &[u64],
) -> Result<()> {
    lease.layer_starts.fill_from(layer_starts)?;
    lease.sample_starts.fill_from(sample_starts)?;
    stream.copy_to_device(lease.layer_starts.clone(), Arc::clone(&buffers.layer_starts), 0)?;
    stream.copy_to_device(lease.sample_starts.clone(), Arc::clone(&buffers.sample_starts), 0)
}

/// Hand a lease back after a failed enqueue. Copies queued before the
/// failure may still read it, so it waits for the stream when it can.
fn release_lease(stream: &DeviceStream, state: &mut DgcState, lease: &TokenLease) -> Result<()> {
    let event = stream.record_event().unwrap_or_else(|_| Event::completed());
    state.tokens_mut().finish(lease.id, event)
}

fn all_reduce_typed<T: Gradient>(
    input: &Arc<DeviceArena>,
    output: &Arc<DeviceArena>,
    layers: &[Layer],
    config: &DgcConfig,
    state: &mut DgcState,
) -> Result<()> {
    state.bind::<T>(config)?;
    let stream = Arc::clone(config.stream()?);
    let lease = state.tokens_mut().acquire();

    let enqueued = enqueue_all_reduce::<T>(&stream, &lease, input, output, layers, config, state);
    let plan = match enqueued {
        Ok(plan) => plan,
        Err(e) => {
            release_lease(&stream, state, &lease)?;
            return Err(e);
        }
    };

    let event = stream.record_event()?;
    state.tokens_mut().finish(lease.id, event)?;
    state.advance(&plan, config);
    Ok(())
}

fn enqueue_all_reduce<T: Gradient>(
    stream: &DeviceStream,
    lease: &TokenLease,
    input: &Arc<DeviceArena>,
    output: &Arc<DeviceArena>,
    layers: &[Layer],
    config: &DgcConfig,
    state: &mut DgcState,
) -> Result<Arc<CallPlan>> {
    let plan = state.plan::<T>(layers, config)?;
    check_size::<T>(input, plan.total_elements)?;
    check_size::<T>(output, plan.total_elements)?;

    let buffers = state.buffers()?.clone();
    let launch = config.launch();
    let comms = config.comm_groups()?.clone();
    tracing::debug!(
        step = state.step(),
        layers = plan.layers.len(),
        elements = plan.total_elements,
        targets = plan.total_targets,
        samples = plan.total_samples,
        sparsity = plan.sparsity,
        token = lease.id,
        "enqueueing gradient all-reduce"
    );

    stage_offsets(stream, lease, &buffers, &plan.layer_starts, &plan.sample_starts)?;

    if config.local_gradient_clipping {
        enqueue_clip::<T>(stream, launch, input, &plan, config.clipping_threshold)?;
    }
    enqueue_momentum::<T>(stream, launch, input, &buffers, &plan, T::from_f64(config.momentum))?;
    enqueue_sampling::<T>(stream, launch, &buffers, &plan, state)?;
    enqueue_thresholds::<T>(stream, launch, &buffers, &plan)?;
    let divisor = T::from_count(comms.global.world_size() as usize);
    let min_comm = config.min_gradients_comm_per_layer as usize;
    enqueue_selection::<T>(stream, launch, &buffers, &plan, divisor, min_comm)?;
    enqueue_padding::<T>(stream, launch, &buffers, &plan)?;
    enqueue_mask_build(stream, launch, &buffers, &plan)?;

    let hierarchical = config.use_hierarchical_allreduce;
    if plan.masked {
        enqueue_masked_exchange::<T>(stream, launch, &buffers, &plan, comms, hierarchical)?;
        enqueue_masked_merge::<T>(stream, launch, &buffers, &plan, output)?;
    } else if config.use_allreduce {
        enqueue_dense_exchange::<T>(stream, launch, &buffers, &plan, comms, hierarchical)?;
        enqueue_dense_merge::<T>(stream, &buffers, &plan, output)?;
    } else {
        enqueue_sparse_exchange::<T>(stream, &buffers, &plan, comms.clone())?;
        enqueue_sparse_merge::<T>(stream, launch, &buffers, &plan, output, comms.global.world_size())?;
    }

    enqueue_carry::<T>(stream, launch, &buffers, &plan)?;
    stream.copy_to_host(
        Arc::clone(&buffers.masks),
        0,
        plan.total_mask_words,
        lease.masks.clone(),
    )?;
    state.set_last_masks(lease.masks.clone());
    Ok(plan)
}

fn enqueue_clip<T: Gradient>(
    stream: &DeviceStream,
    launch: LaunchConfig,
    input: &Arc<DeviceArena>,
    plan: &Arc<CallPlan>,
    threshold: f64,
) -> Result<()> {
    let input = Arc::clone(input);
    let plan = Arc::clone(plan);
    stream.enqueue("clip", move |_| {
        let mut grads = input.lock()?;
        let grads = grads.as_mut_slice::<T>();
        for layer in &plan.layers {
            if let Some(scale) = clip_by_norm(launch, &mut grads[layer.input_range()], threshold) {
                tracing::trace!(layer = %layer.name, scale, "clipped");
            }
        }
        Ok(())
    })
}

fn enqueue_momentum<T: Gradient>(
    stream: &DeviceStream,
    launch: LaunchConfig,
    input: &Arc<DeviceArena>,
    buffers: &Buffers,
    plan: &Arc<CallPlan>,
    momentum: T,
) -> Result<()> {
    let input = Arc::clone(input);
    let buffers = buffers.clone();
    let plan = Arc::clone(plan);
    stream.enqueue("momentum", move |_| {
        let grads = input.lock()?;
        let prev_v = buffers.prev_velocity.lock()?;
        let prev_a = buffers.prev_accumulated.lock()?;
        let mut v = buffers.velocity.lock()?;
        let mut a = buffers.accumulated.lock()?;
        let (grads, prev_v, prev_a) = (
            grads.as_slice::<T>(),
            prev_v.as_slice::<T>(),
            prev_a.as_slice::<T>(),
        );
        let (v, a) = (v.as_mut_slice::<T>(), a.as_mut_slice::<T>());
        for layer in &plan.layers {
            accumulate(
                launch,
                momentum,
                &grads[layer.input_range()],
                &prev_v[layer.state_range()],
                &prev_a[layer.state_range()],
                &mut v[layer.input_range()],
                &mut a[layer.input_range()],
            );
        }
        Ok(())
    })
}

fn enqueue_sampling<T: Gradient>(
    stream: &DeviceStream,
    launch: LaunchConfig,
    buffers: &Buffers,
    plan: &Arc<CallPlan>,
    state: &DgcState,
) -> Result<()> {
    let buffers = buffers.clone();
    let rngs = Arc::clone(state.rngs());
    let bounds = plan.layers.len() + 1;
    let total = plan.total_elements;
    stream.enqueue("sample", move |_| {
        let acc = buffers.accumulated.lock()?;
        let layer_starts = buffers.layer_starts.lock()?;
        let sample_starts = buffers.sample_starts.lock()?;
        let mut samples = buffers.samples.lock()?;
        let mut rngs = rngs
            .lock()
            .map_err(|_| DgcError::LockPoisoned("lane generators"))?;
        sample_magnitudes(
            launch,
            &acc.as_slice::<T>()[..total],
            &layer_starts.as_slice::<u64>()[..bounds],
            &sample_starts.as_slice::<u64>()[..bounds],
            &mut rngs,
            samples.as_mut_slice::<T>(),
        );
        Ok(())
    })
}

fn enqueue_thresholds<T: Gradient>(
    stream: &DeviceStream,
    launch: LaunchConfig,
    buffers: &Buffers,
    plan: &Arc<CallPlan>,
) -> Result<()> {
    let buffers = buffers.clone();
    let plan = Arc::clone(plan);
    stream.enqueue("threshold", move |_| {
        let bounds = plan.layers.len() + 1;
        let layer_starts = buffers.layer_starts.lock()?;
        let sample_starts = buffers.sample_starts.lock()?;
        let (layer_starts, sample_starts) = (
            &layer_starts.as_slice::<u64>()[..bounds],
            &sample_starts.as_slice::<u64>()[..bounds],
        );
        let mut samples = buffers.samples.lock()?;
        let samples = &mut samples.as_mut_slice::<T>()[..plan.total_samples];
        sort_segments_desc(samples, sample_starts);

        let targets: Vec<usize> = plan.layers.iter().map(|l| l.target).collect();
        let mut thresholds = buffers.thresholds.lock()?;
        lookup_thresholds(
            launch,
            samples,
            layer_starts,
            sample_starts,
            &targets,
            thresholds.as_mut_slice::<T>(),
        );
        Ok(())
    })
}

fn enqueue_selection<T: Gradient>(
    stream: &DeviceStream,
    launch: LaunchConfig,
    buffers: &Buffers,
    plan: &Arc<CallPlan>,
    divisor: T,
    min_comm: usize,
) -> Result<()> {
    let buffers = buffers.clone();
    let plan = Arc::clone(plan);
    stream.enqueue("select", move |_| {
        let num_layers = plan.layers.len();
        let acc = buffers.accumulated.lock()?;
        let samples = buffers.samples.lock()?;
        let mut thresholds = buffers.thresholds.lock()?;
        let mut counters = buffers.counters.lock()?;
        let mut send_values = buffers.send_values.lock()?;
        let mut send_indices = buffers.send_indices.lock()?;

        let counters = &mut counters.as_mut_slice::<u32>()[..num_layers];
        fill(launch, counters, 0);
        let counters = as_atomic_u32(counters);

        let (acc, samples) = (acc.as_slice::<T>(), samples.as_slice::<T>());
        let thresholds = thresholds.as_mut_slice::<T>();
        let mut value_lanes = send_values.lanes::<T>();
        let mut index_lanes = send_indices.lanes::<u32>();

        for (l, layer) in plan.layers.iter().enumerate() {
            let out = SelectOutput {
                values: value_lanes.sub(layer.send_offset, layer.target),
                indices: index_lanes.sub(layer.send_offset, layer.target),
                counter: &counters[l],
            };
            let selection = select_at_least(
                launch,
                &acc[layer.input_range()],
                &samples[layer.sample_range()],
                layer.target,
                min_comm,
                thresholds[l],
                divisor,
                &out,
            );
            thresholds[l] = selection.threshold;
            tracing::trace!(
                layer = %layer.name,
                matched = selection.matched,
                target = layer.target,
                threshold = selection.threshold.to_f64(),
                "selected"
            );
        }
        Ok(())
    })
}

fn enqueue_padding<T: Gradient>(
    stream: &DeviceStream,
    launch: LaunchConfig,
    buffers: &Buffers,
    plan: &Arc<CallPlan>,
) -> Result<()> {
    let buffers = buffers.clone();
    let plan = Arc::clone(plan);
    stream.enqueue("pad", move |_| {
        let counters = buffers.counters.lock()?;
        let counters = counters.as_slice::<u32>();
        let mut values = buffers.send_values.lock()?;
        let mut indices = buffers.send_indices.lock()?;
        let (values, indices) = (values.as_mut_slice::<T>(), indices.as_mut_slice::<u32>());
        for (l, layer) in plan.layers.iter().enumerate() {
            let filled = (counters[l] as usize).min(layer.target);
            pad_layer(
                launch,
                &mut values[layer.send_range()],
                &mut indices[layer.send_range()],
                filled,
            );
        }
        Ok(())
    })
}

/// Scatter own pairs into the dense buffer, then sum it across ranks.
fn enqueue_dense_exchange<T: Gradient>(
    stream: &DeviceStream,
    launch: LaunchConfig,
    buffers: &Buffers,
    plan: &Arc<CallPlan>,
    comms: CommGroups,
    hierarchical: bool,
) -> Result<()> {
    let buffers = buffers.clone();
    let plan = Arc::clone(plan);
    stream.enqueue("exchange_allreduce", move |ctx| {
        let mut global = buffers.global_gradients.lock()?;
        {
            let values = buffers.send_values.lock()?;
            let indices = buffers.send_indices.lock()?;
            let (values, indices) = (values.as_slice::<T>(), indices.as_slice::<u32>());
            let dense = &mut global.as_mut_slice::<T>()[..plan.total_elements];
            fill(launch, dense, T::ZERO);
            for layer in &plan.layers {
                scatter(
                    launch,
                    &values[layer.send_range()],
                    &indices[layer.send_range()],
                    &mut dense[layer.input_range()],
                );
            }
        }

        let bytes = &mut global.as_bytes_mut()[..plan.total_elements * size_of::<T>()];
        ctx.block_on(reduce_across(&comms, bytes, T::DTYPE, ReduceOp::Sum, hierarchical))
    })
}

async fn reduce_across(
    comms: &CommGroups,
    buf: &mut [u8],
    dtype: DataType,
    op: ReduceOp,
    hierarchical: bool,
) -> Result<()> {
    if hierarchical {
        hierarchical_all_reduce(comms, buf, dtype, op).await
    } else {
        comms.global.all_reduce(buf, dtype, op).await
    }
}

/// Or-reduce the selection masks, pack own values at the union positions
/// and sum only the packed buffer across ranks.
fn enqueue_masked_exchange<T: Gradient>(
    stream: &DeviceStream,
    launch: LaunchConfig,
    buffers: &Buffers,
    plan: &Arc<CallPlan>,
    comms: CommGroups,
    hierarchical: bool,
) -> Result<()> {
    let buffers = buffers.clone();
    let plan = Arc::clone(plan);
    stream.enqueue("exchange_masked_allreduce", move |ctx| {
        let words = plan.total_mask_words;
        let mut union = buffers.union_masks.lock()?;
        union.as_mut_slice::<u32>()[..words]
            .copy_from_slice(&buffers.masks.lock()?.as_slice::<u32>()[..words]);
        let mask_bytes = &mut union.as_bytes_mut()[..words * size_of::<u32>()];
        ctx.block_on(reduce_across(&comms, mask_bytes, DataType::U32, ReduceOp::BitOr, hierarchical))?;
        let union = &union.as_slice::<u32>()[..words];

        let mut offsets = buffers.mask_offsets.lock()?;
        let offsets = offsets.as_mut_slice::<u64>();
        let mut counters = buffers.mask_counters.lock()?;
        let counters = counters.as_mut_slice::<u32>();
        let mut total = 0u64;
        for (l, layer) in plan.layers.iter().enumerate() {
            let next = mask_offsets(&union[layer.mask_range()], total, &mut offsets[layer.mask_range()]);
            counters[l] = (next - total) as u32;
            total = next;
        }
        let total = total as usize;

        let mut dense = buffers.global_gradients.lock()?;
        let dense = &mut dense.as_mut_slice::<T>()[..plan.total_elements];
        fill(launch, dense, T::ZERO);
        {
            let values = buffers.send_values.lock()?;
            let indices = buffers.send_indices.lock()?;
            let (values, indices) = (values.as_slice::<T>(), indices.as_slice::<u32>());
            for layer in &plan.layers {
                scatter(
                    launch,
                    &values[layer.send_range()],
                    &indices[layer.send_range()],
                    &mut dense[layer.input_range()],
                );
            }
        }

        let mut packed = buffers.union_values.lock()?;
        let capacity = packed.len_bytes();
        let packed_bytes = total * size_of::<T>();
        if packed_bytes > capacity {
            return Err(DgcError::BufferSizeMismatch {
                expected: packed_bytes,
                actual: capacity,
            });
        }
        {
            let packed = &mut packed.as_mut_slice::<T>()[..total];
            for layer in &plan.layers {
                gather_masked(
                    launch,
                    &union[layer.mask_range()],
                    &offsets[layer.mask_range()],
                    &dense[layer.input_range()],
                    packed,
                );
            }
        }
        tracing::trace!(union = total, elements = plan.total_elements, "packed selection union");
        let bytes = &mut packed.as_bytes_mut()[..packed_bytes];
        ctx.block_on(reduce_across(&comms, bytes, T::DTYPE, ReduceOp::Sum, hierarchical))
    })
}

/// Zero `output`, then unpack the summed union values into it.
fn enqueue_masked_merge<T: Gradient>(
    stream: &DeviceStream,
    launch: LaunchConfig,
    buffers: &Buffers,
    plan: &Arc<CallPlan>,
    output: &Arc<DeviceArena>,
) -> Result<()> {
    let buffers = buffers.clone();
    let plan = Arc::clone(plan);
    let output = Arc::clone(output);
    stream.enqueue("merge", move |_| {
        let union = buffers.union_masks.lock()?;
        let offsets = buffers.mask_offsets.lock()?;
        let packed = buffers.union_values.lock()?;
        let (union, offsets, packed) = (
            union.as_slice::<u32>(),
            offsets.as_slice::<u64>(),
            packed.as_slice::<T>(),
        );
        let mut out = output.lock()?;
        let out = &mut out.as_mut_slice::<T>()[..plan.total_elements];
        fill(launch, out, T::ZERO);
        for layer in &plan.layers {
            scatter_masked(
                launch,
                &union[layer.mask_range()],
                &offsets[layer.mask_range()],
                packed,
                &mut out[layer.input_range()],
            );
        }
        Ok(())
    })
}

fn enqueue_dense_merge<T: Gradient>(
    stream: &DeviceStream,
    buffers: &Buffers,
    plan: &Arc<CallPlan>,
    output: &Arc<DeviceArena>,
) -> Result<()> {
    let global = Arc::clone(&buffers.global_gradients);
    let output = Arc::clone(output);
    let total = plan.total_elements;
    stream.enqueue("merge", move |_| {
        let global = global.lock()?;
        let mut out = output.lock()?;
        out.as_mut_slice::<T>()[..total].copy_from_slice(&global.as_slice::<T>()[..total]);
        Ok(())
    })
}

/// Gather every rank's compacted buffers into the receive arenas.
fn enqueue_sparse_exchange<T: Gradient>(
    stream: &DeviceStream,
    buffers: &Buffers,
    plan: &Arc<CallPlan>,
    comms: CommGroups,
) -> Result<()> {
    let buffers = buffers.clone();
    let targets = plan.total_targets;
    stream.enqueue("exchange_allgather", move |ctx| {
        let sent_values = buffers.send_values.lock()?.as_bytes()[..targets * size_of::<T>()].to_vec();
        let sent_indices =
            buffers.send_indices.lock()?.as_bytes()[..targets * size_of::<u32>()].to_vec();

        let (values, indices) = ctx.block_on(async {
            let values = comms.global.all_gather(&sent_values).await?;
            let indices = comms.global.all_gather(&sent_indices).await?;
            Ok::<_, DgcError>((values, indices))
        })?;

        let expected = comms.global.world_size() as usize * sent_values.len();
        if values.len() != expected {
            return Err(DgcError::BufferSizeMismatch {
                expected,
                actual: values.len(),
            });
        }
        buffers.recv_values.lock()?.as_bytes_mut()[..values.len()].copy_from_slice(&values);
        buffers.recv_indices.lock()?.as_bytes_mut()[..indices.len()].copy_from_slice(&indices);
        Ok(())
    })
}

/// Zero `output`, then add every rank's pairs in rank order.
fn enqueue_sparse_merge<T: Gradient>(
    stream: &DeviceStream,
    launch: LaunchConfig,
    buffers: &Buffers,
    plan: &Arc<CallPlan>,
    output: &Arc<DeviceArena>,
    world: u32,
) -> Result<()> {
    let buffers = buffers.clone();
    let plan = Arc::clone(plan);
    let output = Arc::clone(output);
    stream.enqueue("merge", move |_| {
        let values = buffers.recv_values.lock()?;
        let indices = buffers.recv_indices.lock()?;
        let (values, indices) = (values.as_slice::<T>(), indices.as_slice::<u32>());
        let mut out = output.lock()?;
        let out = &mut out.as_mut_slice::<T>()[..plan.total_elements];
        fill(launch, out, T::ZERO);

        for rank in 0..world as usize {
            let base = rank * plan.total_targets;
            for layer in &plan.layers {
                let pairs = base + layer.send_offset..base + layer.send_offset + layer.target;
                scatter_add(
                    launch,
                    &values[pairs.clone()],
                    &indices[pairs],
                    &mut out[layer.input_range()],
                );
            }
        }
        Ok(())
    })
}

/// Rebuild the selection masks from the sent indices.
fn enqueue_mask_build(
    stream: &DeviceStream,
    launch: LaunchConfig,
    buffers: &Buffers,
    plan: &Arc<CallPlan>,
) -> Result<()> {
    let buffers = buffers.clone();
    let plan = Arc::clone(plan);
    stream.enqueue("mask", move |_| {
        let mut masks = buffers.masks.lock()?;
        let masks = masks.as_mut_slice::<u32>();
        let indices = buffers.send_indices.lock()?;
        let indices = indices.as_slice::<u32>();
        for layer in &plan.layers {
            let words = &mut masks[layer.mask_range()];
            fill(launch, words, 0);
            mark_selected(launch, &indices[layer.send_range()], as_atomic_u32(words));
        }
        Ok(())
    })
}

/// Carry the unsent momentum over to the next step.
fn enqueue_carry<T: Gradient>(
    stream: &DeviceStream,
    launch: LaunchConfig,
    buffers: &Buffers,
    plan: &Arc<CallPlan>,
) -> Result<()> {
    let buffers = buffers.clone();
    let plan = Arc::clone(plan);
    stream.enqueue("carry", move |_| {
        let masks = buffers.masks.lock()?;
        let masks = masks.as_slice::<u32>();
        let v = buffers.velocity.lock()?;
        let a = buffers.accumulated.lock()?;
        let mut prev_v = buffers.prev_velocity.lock()?;
        let mut prev_a = buffers.prev_accumulated.lock()?;
        let (v, a) = (v.as_slice::<T>(), a.as_slice::<T>());
        let (prev_v, prev_a) = (prev_v.as_mut_slice::<T>(), prev_a.as_mut_slice::<T>());
        for layer in &plan.layers {
            mask_and_carry(
                launch,
                &masks[layer.mask_range()],
                &v[layer.input_range()],
                &a[layer.input_range()],
                &mut prev_v[layer.state_range()],
                &mut prev_a[layer.state_range()],
            );
        }
        Ok(())
    })
}

fn clip_typed<T: Gradient>(
    gradients: &Arc<DeviceArena>,
    layers: &[Layer],
    config: &DgcConfig,
    state: &mut DgcState,
) -> Result<()> {
    state.bind::<T>(config)?;
    let stream = Arc::clone(config.stream()?);
    let lease = state.tokens_mut().acquire();

    let enqueued = enqueue_clip_only::<T>(&stream, &lease, gradients, layers, config, state);
    if let Err(e) = enqueued {
        release_lease(&stream, state, &lease)?;
        return Err(e);
    }
    let event = stream.record_event()?;
    state.tokens_mut().finish(lease.id, event)
}

fn enqueue_clip_only<T: Gradient>(
    stream: &DeviceStream,
    lease: &TokenLease,
    gradients: &Arc<DeviceArena>,
    layers: &[Layer],
    config: &DgcConfig,
    state: &DgcState,
) -> Result<()> {
    let mut layer_starts = Vec::with_capacity(layers.len() + 1);
    let mut total = 0u64;
    for layer in layers {
        layer_starts.push(total);
        total += layer.num_elements as u64;
    }
    layer_starts.push(total);
    check_size::<T>(gradients, total as usize)?;

    let buffers = state.buffers()?.clone();
    buffers
        .layer_starts
        .ensure_capacity(layer_starts.len() * size_of::<u64>())?;
    stage_offsets(stream, lease, &buffers, &layer_starts, &[])?;

    let launch = config.launch();
    let threshold = config.clipping_threshold;
    let gradients = Arc::clone(gradients);
    let bounds = layer_starts.len();
    let names: Vec<String> = layers.iter().map(|l| l.name.clone()).collect();
    stream.enqueue("clip", move |_| {
        let starts = buffers.layer_starts.lock()?;
        let starts = &starts.as_slice::<u64>()[..bounds];
        let mut grads = gradients.lock()?;
        let grads = grads.as_mut_slice::<T>();
        for (w, name) in starts.windows(2).zip(&names) {
            let layer = &mut grads[w[0] as usize..w[1] as usize];
            if let Some(scale) = clip_by_norm(launch, layer, threshold) {
                tracing::trace!(layer = %name, scale, "clipped");
            }
        }
        Ok(())
    })
}

//! Compression configuration.
//!
//! All values have defaults. Override them with [`DgcConfig::set`] using the
//! string keys below, or via environment variables (prefixed `NEXAR_DGC_`).
//! Attach a stream and communicator groups, then call
//! [`DgcConfig::finish_configuration`] before the first compression call.

use std::sync::Arc;

use crate::comm::CommGroups;
use crate::device::{DeviceStream, LaunchConfig};
use crate::error::{DgcError, Result};

/// Every key accepted by [`DgcConfig::set`].
pub const CONFIG_KEYS: &[&str] = &[
    "warmup_epochs",
    "num_examples_per_epoch",
    "batch_size_per_gpu",
    "init_sparsity",
    "final_sparsity",
    "sampling_rate",
    "rand_seed",
    "grid_size",
    "block_size",
    "min_sampling_num",
    "min_gradients_comm_per_layer",
    "min_selected_samples_per_layer",
    "momentum",
    "local_gradient_clipping",
    "clipping_threshold",
    "use_allreduce",
    "use_hierarchical_allreduce",
    "use_masked_allreduce",
];

/// Rank and group sizes of this worker, taken from the attached
/// [`CommGroups`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    pub global_num_gpus: u32,
    pub global_gpu_rank: u32,
    pub global_num_nodes: u32,
    pub global_node_rank: u32,
    pub local_num_gpus: u32,
    pub local_gpu_rank: u32,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            global_num_gpus: 1,
            global_gpu_rank: 0,
            global_num_nodes: 1,
            global_node_rank: 0,
            local_num_gpus: 1,
            local_gpu_rank: 0,
        }
    }
}

/// Tuning knobs and runtime handles for the compression engine.
#[derive(Debug, Clone)]
pub struct DgcConfig {
    /// Epochs over which sparsity ramps from `init_sparsity` to
    /// `final_sparsity`.
    pub warmup_epochs: f64,
    pub num_examples_per_epoch: u64,
    pub batch_size_per_gpu: u64,
    pub init_sparsity: f64,
    pub final_sparsity: f64,

    /// Fraction of each layer drawn for threshold estimation.
    pub sampling_rate: f64,
    pub rand_seed: u64,

    /// Launch geometry for every kernel.
    pub grid_size: usize,
    pub block_size: usize,

    pub min_sampling_num: u64,
    /// Lower bound on the number of elements sent per layer.
    pub min_gradients_comm_per_layer: u64,
    pub min_selected_samples_per_layer: u64,

    pub momentum: f64,
    pub local_gradient_clipping: bool,
    pub clipping_threshold: f64,

    /// Exchange through a dense sum all-reduce instead of gathering the
    /// sparse pairs of every rank.
    pub use_allreduce: bool,
    pub use_hierarchical_allreduce: bool,
    /// In all-reduce mode, or-reduce the selection masks first and sum only
    /// the union of selected positions.
    pub use_masked_allreduce: bool,

    topology: Topology,
    stream: Option<Arc<DeviceStream>>,
    comms: Option<CommGroups>,
    configured: bool,
}

impl Default for DgcConfig {
    fn default() -> Self {
        Self {
            warmup_epochs: 5.0,
            num_examples_per_epoch: 1_000_000,
            batch_size_per_gpu: 32,
            init_sparsity: 0.75,
            final_sparsity: 0.999,
            sampling_rate: 0.01,
            rand_seed: 2800,
            grid_size: 32,
            block_size: 512,
            min_sampling_num: 4000,
            min_gradients_comm_per_layer: 10,
            min_selected_samples_per_layer: 5,
            momentum: 0.9,
            local_gradient_clipping: true,
            clipping_threshold: 6.0,
            use_allreduce: true,
            use_hierarchical_allreduce: true,
            use_masked_allreduce: true,
            topology: Topology::default(),
            stream: None,
            comms: None,
            configured: false,
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| DgcError::invalid_value(key, value, e))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(DgcError::invalid_value(key, value, "expected a boolean")),
    }
}

impl DgcConfig {
    /// Set one value from its string form.
    ///
    /// Unknown keys are rejected. Any change clears the ready flag, so
    /// [`finish_configuration`](Self::finish_configuration) must run again.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "warmup_epochs" => self.warmup_epochs = parse(key, value)?,
            "num_examples_per_epoch" => self.num_examples_per_epoch = parse(key, value)?,
            "batch_size_per_gpu" => self.batch_size_per_gpu = parse(key, value)?,
            "init_sparsity" => self.init_sparsity = parse(key, value)?,
            "final_sparsity" => self.final_sparsity = parse(key, value)?,
            "sampling_rate" => self.sampling_rate = parse(key, value)?,
            "rand_seed" => self.rand_seed = parse(key, value)?,
            "grid_size" => self.grid_size = parse(key, value)?,
            "block_size" => self.block_size = parse(key, value)?,
            "min_sampling_num" => self.min_sampling_num = parse(key, value)?,
            "min_gradients_comm_per_layer" => {
                self.min_gradients_comm_per_layer = parse(key, value)?
            }
            "min_selected_samples_per_layer" => {
                self.min_selected_samples_per_layer = parse(key, value)?
            }
            "momentum" => self.momentum = parse(key, value)?,
            "local_gradient_clipping" => self.local_gradient_clipping = parse_bool(key, value)?,
            "clipping_threshold" => self.clipping_threshold = parse(key, value)?,
            "use_allreduce" | "use_allReduce" => self.use_allreduce = parse_bool(key, value)?,
            "use_hierarchical_allreduce" => {
                self.use_hierarchical_allreduce = parse_bool(key, value)?
            }
            "use_masked_allreduce" => self.use_masked_allreduce = parse_bool(key, value)?,
            _ => return Err(DgcError::UnknownConfigKey(key.to_string())),
        }
        self.configured = false;
        Ok(())
    }

    /// Defaults overridden by `NEXAR_DGC_<KEY>` variables.
    ///
    /// For example `NEXAR_DGC_FINAL_SPARSITY=0.99`. Values that do not parse
    /// are logged and ignored.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        for key in CONFIG_KEYS {
            let var = format!("NEXAR_DGC_{}", key.to_ascii_uppercase());
            if let Ok(value) = std::env::var(&var) {
                if let Err(e) = cfg.set(key, &value) {
                    tracing::warn!(%var, error = %e, "ignoring environment override");
                }
            }
        }
        cfg
    }

    /// Attach the stream all work is enqueued on.
    pub fn with_stream(mut self, stream: Arc<DeviceStream>) -> Self {
        self.stream = Some(stream);
        self.configured = false;
        self
    }

    /// Attach the communicators and take the topology from them.
    pub fn with_comm_groups(mut self, comms: CommGroups) -> Self {
        self.topology = Topology {
            global_num_gpus: comms.global.world_size(),
            global_gpu_rank: comms.global.rank(),
            global_num_nodes: comms.num_nodes,
            global_node_rank: comms.node_rank,
            local_num_gpus: comms.local.world_size(),
            local_gpu_rank: comms.local.rank(),
        };
        self.comms = Some(comms);
        self.configured = false;
        self
    }

    /// Validate and mark the configuration ready.
    pub fn finish_configuration(&mut self) -> Result<()> {
        if self.stream.is_none() {
            return Err(DgcError::NotConfigured("no device stream attached"));
        }
        if self.comms.is_none() {
            return Err(DgcError::NotConfigured("no communicator groups attached"));
        }
        self.validate()?;
        self.configured = true;
        tracing::debug!(
            rank = self.topology.global_gpu_rank,
            world = self.topology.global_num_gpus,
            init_sparsity = self.init_sparsity,
            final_sparsity = self.final_sparsity,
            warmup_epochs = self.warmup_epochs,
            use_allreduce = self.use_allreduce,
            use_masked_allreduce = self.use_masked_allreduce,
            "DGC configuration finished"
        );
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let check = |ok: bool, key: &str, value: String, reason: &str| {
            if ok {
                Ok(())
            } else {
                Err(DgcError::invalid_value(key, &value, reason))
            }
        };
        check(
            (0.0..1.0).contains(&self.init_sparsity),
            "init_sparsity",
            self.init_sparsity.to_string(),
            "must be in [0, 1)",
        )?;
        check(
            (self.init_sparsity..1.0).contains(&self.final_sparsity),
            "final_sparsity",
            self.final_sparsity.to_string(),
            "must be in [init_sparsity, 1)",
        )?;
        check(
            self.warmup_epochs >= 0.0 && self.warmup_epochs.is_finite(),
            "warmup_epochs",
            self.warmup_epochs.to_string(),
            "must be a non-negative number",
        )?;
        check(
            self.sampling_rate > 0.0 && self.sampling_rate <= 1.0,
            "sampling_rate",
            self.sampling_rate.to_string(),
            "must be in (0, 1]",
        )?;
        check(self.grid_size > 0, "grid_size", "0".into(), "must be positive")?;
        check(self.block_size > 0, "block_size", "0".into(), "must be positive")?;
        check(
            self.batch_size_per_gpu > 0,
            "batch_size_per_gpu",
            "0".into(),
            "must be positive",
        )?;
        check(
            self.num_examples_per_epoch > 0,
            "num_examples_per_epoch",
            "0".into(),
            "must be positive",
        )?;
        check(
            self.clipping_threshold > 0.0,
            "clipping_threshold",
            self.clipping_threshold.to_string(),
            "must be positive",
        )?;
        check(
            (0.0..1.0).contains(&self.momentum),
            "momentum",
            self.momentum.to_string(),
            "must be in [0, 1)",
        )
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub(crate) fn ensure_configured(&self) -> Result<()> {
        if self.configured {
            Ok(())
        } else {
            Err(DgcError::NotConfigured("finish_configuration has not succeeded"))
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn stream(&self) -> Result<&Arc<DeviceStream>> {
        self.stream
            .as_ref()
            .ok_or(DgcError::NotConfigured("no device stream attached"))
    }

    pub fn comm_groups(&self) -> Result<&CommGroups> {
        self.comms
            .as_ref()
            .ok_or(DgcError::NotConfigured("no communicator groups attached"))
    }

    pub fn launch(&self) -> LaunchConfig {
        LaunchConfig::new(self.grid_size, self.block_size)
    }

    /// Target sparsity at `epoch`.
    ///
    /// The kept density `1 - s` decays exponentially from `1 - init_sparsity`
    /// to `1 - final_sparsity` over `warmup_epochs`, then stays at the final
    /// value.
    pub fn sparsity_at(&self, epoch: f64) -> f64 {
        if self.warmup_epochs <= 0.0 || epoch >= self.warmup_epochs {
            return self.final_sparsity;
        }
        let progress = epoch.max(0.0) / self.warmup_epochs;
        let init_density = 1.0 - self.init_sparsity;
        let final_density = 1.0 - self.final_sparsity;
        let density = init_density * (final_density / init_density).powf(progress);
        1.0 - density
    }

    /// Elements sent for a layer of `num_elements` at `sparsity`.
    ///
    /// Never below `min_gradients_comm_per_layer`, even if that exceeds the
    /// layer size; the surplus slots are padding.
    pub fn target_count(&self, num_elements: usize, sparsity: f64) -> usize {
        let kept = (num_elements as f64 * (1.0 - sparsity)).round() as usize;
        kept.max(self.min_gradients_comm_per_layer as usize)
    }

    /// Samples drawn for threshold estimation, capped at the layer size.
    pub fn sample_count(&self, num_elements: usize) -> usize {
        let by_rate = (self.sampling_rate * num_elements as f64).round() as usize;
        by_rate
            .max(self.min_sampling_num as usize)
            .max(self.min_selected_samples_per_layer as usize)
            .min(num_elements)
    }
}

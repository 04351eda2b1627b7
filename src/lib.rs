pub mod comm;
pub mod compression;
pub mod config;
pub mod device;
pub mod element;
pub mod engine;
pub mod error;
pub mod memory;
pub mod state;
pub mod token;
pub mod types;

pub use comm::{CommGroups, Communicator, LocalComm, form_comm_groups, hierarchical_all_reduce};
pub use config::{CONFIG_KEYS, DgcConfig, Topology};
pub use device::{Device, DeviceStream, Event, LaunchConfig};
pub use element::{Element, Gradient};
pub use engine::{clip_gradient, gradient_all_reduce};
pub use error::{DgcError, Result};
pub use memory::{DeviceArena, PinnedHostBuffer};
pub use state::{CompactedLayer, DgcState, MAX_LAYER_ELEMENTS};
pub use token::{TokenLease, TokenPool};
pub use types::{DataType, Layer, Rank, ReduceOp};

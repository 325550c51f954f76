mod node_drain;

pub use node_drain::{
    manual_cordon, manual_drain, manual_uncordon, start_node_drain_controller, DrainContext,
    ManualDrainOutcome, ManualOpError,
};

mod adam;
pub use adam::AdamOptimizer;
mod catalog;
pub use catalog::{
    all_parameter_names, layer_norm_parameter_names, primary_parameter_names, GateWeights,
    LstmConfig, LstmModel, LstmWeights, ModelCatalog, GATE_KEYS,
};
mod lstm;
pub use lstm::{ForwardTrace, LstmCore};

pub mod action;
pub mod history;

pub use action::{
    ActionId, ActionMap, ActionRegistry, ActionValue, InputData, LifecycleKind, PredictionStrategy,
};
pub use history::{InputEntry, InputHistory};

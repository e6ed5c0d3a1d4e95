//! Pipes: selection, bookkeeping and naming.

mod concurrency;
mod info;
mod manager;
mod selector;

pub use concurrency::{ConcurrencyAction, ConcurrencyRules, PipeType};
pub use info::{
    module_info_for, pipe_name, ModuleInfo, ModuleRole, PipeAction, PipeInfo, PipeRole, PortHandle,
    A2DP_OUTPUT, HDI_INVALID_ID, MULTICHANNEL_OUTPUT, OFFLOAD_OUTPUT, PRIMARY_OUTPUT,
    REMOTE_CAST_INNER_CAPTURER,
};
pub use manager::PipeManager;
pub use selector::PipeSelector;

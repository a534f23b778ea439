pub mod selector;

pub use selector::{
    DeviceCandidate, PreferenceRecord, Selection, SelectionInput, SelectionRule, Trigger,
    effective_system_default, select_output_device,
};

pub mod runtime;
pub mod signals;

pub use runtime::OutputRoutingService;
pub use signals::{SignalHandler, SignalType};

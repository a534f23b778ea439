pub mod adapters;
#[cfg(target_os = "macos")]
pub mod coreaudio;
pub mod traits;

// Mock implementations for testing
#[cfg(any(test, feature = "test-mocks"))]
pub mod mocks;

// Re-export traits and adapters for easy access
pub use adapters::*;
#[cfg(target_os = "macos")]
pub use coreaudio::CoreAudioHardware;
pub use traits::*;

// Re-export mocks when testing
#[cfg(any(test, feature = "test-mocks"))]
pub use mocks::*;

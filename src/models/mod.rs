pub mod event;
pub mod host;
pub mod process;

pub use event::{Channel, OutputEvent};
pub use host::HostSpec;
pub use process::{ProcessHandle, ProcessState};

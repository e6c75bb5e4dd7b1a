pub mod exits;

pub use exits::{ExitContext, ExitPolicy, ExitRule};

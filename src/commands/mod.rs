//! Operator and presentation queries. Each command returns a serializable
//! response; the CLI prints them as JSON.

pub mod diagnostics;
pub mod queue;
pub mod settings;
pub mod stats;
pub mod status;
pub mod worker;

pub use diagnostics::*;
pub use queue::*;
pub use settings::*;
pub use stats::*;
pub use status::*;
pub use worker::*;

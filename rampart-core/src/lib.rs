// Core library for the rampart fault tolerance engine
// Policy types, the pipeline builder and the execution engine

pub mod arguments;
pub mod chain;
pub mod clock;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod interceptor;
pub mod invocation;
pub mod logging;
pub mod metrics;
pub mod outcome;
pub mod policy;
pub mod resilience;
pub mod settings;

// Re-export commonly used types
pub use arguments::*;
pub use chain::*;
pub use clock::*;
pub use descriptor::*;
pub use engine::*;
pub use error::*;
pub use interceptor::*;
pub use invocation::*;
pub use metrics::*;
pub use outcome::*;
pub use policy::*;
pub use resilience::*;
pub use settings::*;

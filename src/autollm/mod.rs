//! Adaptive two-lane model router: local-first Fast lane with learned
//! confidence and Smart-lane escalation, plus optional speculative
//! dual-model execution. See the module-level docs of each submodule for
//! the component it implements.

pub mod availability;
pub mod error;
pub mod launcher;
pub mod outcome;
pub mod prober;
pub mod provider;
pub mod router;
pub mod selector;
pub mod speculative;
pub mod types;

pub use availability::{AvailabilityCache, BackendEndpoints};
pub use error::RouterError;
pub use launcher::{BackendLaunchConfig, BackendLauncher};
pub use outcome::InMemoryOutcomeStore;
pub use prober::BackendProber;
pub use provider::{BackendClientProvider, KnowledgeFabric, OutcomeStore, PromptStore, Provider};
pub use router::{Router, RouterConfig};
pub use selector::ModelSelector;
pub use speculative::SpeculativeExecutor;
pub use types::{Constraint, Lane, Request, RequestMode, RoutingDecision};

//! Commonly imported types, re-exported for downstream crates.

pub use crate::config::{Config, ConfigError};
pub use crate::fsm::PhaseController;
pub use crate::registry::{EndpointDescriptor, EndpointRegistry};
pub use crate::roles::Role;
pub use crate::session::{FileSessionBackend, SessionBackend, SessionStore};
pub use crate::types::{Phase, SessionState, StepRequest, StepResponse, StepStatus, Todo};

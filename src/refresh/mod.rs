mod coordinator;
mod policy;

pub use coordinator::{RefreshCoordinator, RefreshOutcome, TokenExchanger};

pub(crate) use policy::{is_auth_endpoint, should_attempt_refresh};

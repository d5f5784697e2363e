//! Provider registry and the typed per-contract accessor
//!
//! - [`ProviderRegistry`]: contract -> ordered registrations, atomic snapshot publish
//! - [`Providers`]: selects providers of one contract through a strategy and
//!   invokes them, optionally through an [`Executor`](crate::executor::Executor)

mod accessor;
mod registry;

pub use accessor::Providers;
pub use registry::{
    ContractId, ProviderRegistry, Registration, RegistrationId, RegistrationSnapshot,
};

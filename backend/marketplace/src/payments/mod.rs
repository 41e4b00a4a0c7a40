//! Settlement: fee math, the versioned order state machine, the provider
//! client and inbound provider webhooks.

pub mod fees;
pub mod intake;
pub mod orders;
pub mod provider;

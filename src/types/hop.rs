use std::fmt;

use serde_derive::{Deserialize, Serialize};

//------------ HopResult -----------------------------------------------------

/// The classification of one customer-to-provider hop in an `AS_PATH`.
///
/// This is the result type of [`AspaTable::check_hop`]
/// [crate::AspaTable::check_hop]. Every `(customer, provider)` pair maps to
/// exactly one of the three values.
#[derive(
    Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize,
)]
pub enum HopResult {
    /// No attached cache session attests anything for the customer ASN.
    NoAttestation,
    /// The customer ASN is attested, but the provider ASN is not among its
    /// authorized providers.
    NotProviderPlus,
    /// The provider ASN is among the customer's authorized providers.
    ProviderPlus,
}

impl HopResult {
    pub fn is_attested(&self) -> bool {
        !matches!(self, Self::NoAttestation)
    }
}

impl fmt::Display for HopResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HopResult::NoAttestation => write!(f, "no-attestation"),
            HopResult::NotProviderPlus => write!(f, "not-provider-plus"),
            HopResult::ProviderPlus => write!(f, "provider-plus"),
        }
    }
}

//! Proof-of-purchase uploads attached to a request
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::Serialize;

use super::error::ValidationError;
use super::ledger::EventType;
use super::types::{ActorRole, TimeStamp};

#[derive(
    minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, Copy, Eq, PartialEq, Hash,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProofKind {
    #[n(0)]
    BuyerCheckout,
    #[n(1)]
    BuyerProduct,
    #[n(2)]
    CardholderInvoice,
    #[n(3)]
    CardholderCardTransaction,
}

impl ProofKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProofKind::BuyerCheckout => "BUYER_CHECKOUT",
            ProofKind::BuyerProduct => "BUYER_PRODUCT",
            ProofKind::CardholderInvoice => "CARDHOLDER_INVOICE",
            ProofKind::CardholderCardTransaction => "CARDHOLDER_CARD_TRANSACTION",
        }
    }

    /// The only role allowed to upload this kind of proof.
    pub fn uploader_role(&self) -> ActorRole {
        match self {
            ProofKind::BuyerCheckout | ProofKind::BuyerProduct => ActorRole::Buyer,
            ProofKind::CardholderInvoice | ProofKind::CardholderCardTransaction => {
                ActorRole::Cardholder
            }
        }
    }

    pub fn event_type(&self) -> EventType {
        match self.uploader_role() {
            ActorRole::Cardholder => EventType::CardholderProofUploaded,
            _ => EventType::BuyerProofUploaded,
        }
    }
}

impl fmt::Display for ProofKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProofKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUYER_CHECKOUT" => Ok(ProofKind::BuyerCheckout),
            "BUYER_PRODUCT" => Ok(ProofKind::BuyerProduct),
            "CARDHOLDER_INVOICE" => Ok(ProofKind::CardholderInvoice),
            "CARDHOLDER_CARD_TRANSACTION" => Ok(ProofKind::CardholderCardTransaction),
            _ => Err(ValidationError::UnknownProofKind(s.to_string())),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProofUpload {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub request_id: String,
    #[n(2)]
    pub uploader_email: String,
    #[n(3)]
    pub uploader_role: ActorRole,
    #[n(4)]
    pub kind: ProofKind,
    #[n(5)]
    pub url: String, // object storage location, never the file itself
    #[n(6)]
    pub created_at: TimeStamp<Utc>,
}

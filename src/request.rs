//! Buyer requests, their details and the canonical status vocabulary
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::Serialize;

use super::error::ValidationError;
use super::proof::ProofKind;
use super::types::{Currency, TimeStamp, normalize_email};

#[derive(
    minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, Copy, Eq, PartialEq, Hash,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    #[n(0)]
    Submitted,
    #[n(1)]
    AdminApproved,
    #[n(2)]
    Matched,
    #[n(3)]
    Completed,
    #[n(4)]
    Rejected,
    #[n(5)]
    Cancelled,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 6] = [
        RequestStatus::Submitted,
        RequestStatus::AdminApproved,
        RequestStatus::Matched,
        RequestStatus::Completed,
        RequestStatus::Rejected,
        RequestStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Submitted => "SUBMITTED",
            RequestStatus::AdminApproved => "ADMIN_APPROVED",
            RequestStatus::Matched => "MATCHED",
            RequestStatus::Completed => "COMPLETED",
            RequestStatus::Rejected => "REJECTED",
            RequestStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Rejected | RequestStatus::Cancelled
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Legacy spellings are folded into the canonical vocabulary here and nowhere else.
impl FromStr for RequestStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SUBMITTED" | "PENDING" | "PENDING_ADMIN_APPROVAL" => Ok(RequestStatus::Submitted),
            "ADMIN_APPROVED" | "APPROVED" => Ok(RequestStatus::AdminApproved),
            "MATCHED" => Ok(RequestStatus::Matched),
            "COMPLETED" => Ok(RequestStatus::Completed),
            "REJECTED" => Ok(RequestStatus::Rejected),
            "CANCELLED" | "CANCELED" => Ok(RequestStatus::Cancelled),
            _ => Err(ValidationError::UnknownStatus(s.to_string())),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, Default, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProductDetails {
    #[n(0)]
    pub link: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub price: u64, // minor units
    #[n(3)]
    pub currency: Option<Currency>,
}

/// Which card the buyer needs. Unset fields accept any card.
#[derive(minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, Default, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CardRequirement {
    #[n(0)]
    pub issuer: Option<String>,
    #[n(1)]
    pub network: Option<String>,
    #[n(2)]
    pub label: Option<String>,
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, Default, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAddress {
    #[n(0)]
    pub name: String,
    #[n(1)]
    pub line1: String,
    #[n(2)]
    pub line2: Option<String>,
    #[n(3)]
    pub city: String,
    #[n(4)]
    pub state: Option<String>,
    #[n(5)]
    pub postal_code: String,
    #[n(6)]
    pub phone: Option<String>,
}

/// Finalised buyer-editable content of a request.
#[derive(minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, Default, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestDetails {
    #[n(0)]
    pub product: ProductDetails,
    #[n(1)]
    pub requirement: CardRequirement,
    #[n(2)]
    pub delivery: DeliveryAddress,
}

impl RequestDetails {
    pub fn digest(&self) -> anyhow::Result<String> {
        super::utils::cbor_digest(self)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, Default, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProofUrls {
    #[n(0)]
    pub buyer_checkout: Option<String>,
    #[n(1)]
    pub buyer_product: Option<String>,
    #[n(2)]
    pub cardholder_invoice: Option<String>,
    #[n(3)]
    pub cardholder_card_transaction: Option<String>,
}

impl ProofUrls {
    pub fn set(&mut self, kind: ProofKind, url: String) {
        let slot = match kind {
            ProofKind::BuyerCheckout => &mut self.buyer_checkout,
            ProofKind::BuyerProduct => &mut self.buyer_product,
            ProofKind::CardholderInvoice => &mut self.cardholder_invoice,
            ProofKind::CardholderCardTransaction => &mut self.cardholder_card_transaction,
        };
        *slot = Some(url);
    }
    pub fn get(&self, kind: ProofKind) -> Option<&str> {
        match kind {
            ProofKind::BuyerCheckout => self.buyer_checkout.as_deref(),
            ProofKind::BuyerProduct => self.buyer_product.as_deref(),
            ProofKind::CardholderInvoice => self.cardholder_invoice.as_deref(),
            ProofKind::CardholderCardTransaction => self.cardholder_card_transaction.as_deref(),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[n(0)]
    pub id: String, // bech32 encoded uuid7
    #[n(1)]
    pub status: RequestStatus,
    #[n(2)]
    pub buyer_email: String,
    #[n(3)]
    pub matched_cardholder_email: Option<String>,
    #[n(4)]
    pub matched_card_id: Option<String>,
    #[n(5)]
    pub details: RequestDetails,
    #[n(6)]
    pub proofs: ProofUrls,
    #[n(7)]
    pub created_at: TimeStamp<Utc>,
    #[n(8)]
    pub updated_at: TimeStamp<Utc>,
    #[n(9)]
    pub matched_at: Option<TimeStamp<Utc>>,
    #[n(10)]
    pub completed_at: Option<TimeStamp<Utc>>,
}

impl Request {
    pub fn new(id: String, buyer_email: &str, details: RequestDetails, now: TimeStamp<Utc>) -> Self {
        Self {
            id,
            status: RequestStatus::Submitted,
            buyer_email: normalize_email(buyer_email),
            matched_cardholder_email: None,
            matched_card_id: None,
            details,
            proofs: ProofUrls::default(),
            created_at: now.clone(),
            updated_at: now,
            matched_at: None,
            completed_at: None,
        }
    }

    pub fn is_owned_by(&self, email: &str) -> bool {
        self.buyer_email == normalize_email(email)
    }

    pub fn is_matched_to(&self, email: &str) -> bool {
        self.matched_cardholder_email.as_deref() == Some(normalize_email(email).as_str())
    }
}

/// Builder used by buyers to draft a request before it is submitted.
#[derive(Debug, Default, Clone)]
pub struct RequestDraft {
    product_link: Option<String>,
    product_name: Option<String>,
    price: u64,
    currency: Option<Currency>,
    requirement: CardRequirement,
    delivery: DeliveryAddress,
}

impl RequestDraft {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_product_link(mut self, link: &str) -> Self {
        self.product_link = Some(link.trim().to_string());
        self
    }
    pub fn set_product_name(mut self, name: &str) -> Self {
        self.product_name = Some(name.trim().to_string());
        self
    }
    pub fn set_price(mut self, price: u64, currency: Currency) -> Self {
        self.price = price;
        self.currency = Some(currency);
        self
    }
    pub fn require_issuer(mut self, issuer: &str) -> Self {
        self.requirement.issuer = non_empty(issuer);
        self
    }
    pub fn require_network(mut self, network: &str) -> Self {
        self.requirement.network = non_empty(network);
        self
    }
    pub fn require_label(mut self, label: &str) -> Self {
        self.requirement.label = non_empty(label);
        self
    }
    pub fn set_delivery(mut self, delivery: DeliveryAddress) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn validate_and_finalise(&self) -> Result<RequestDetails, ValidationError> {
        let link = self
            .product_link
            .clone()
            .filter(|l| !l.is_empty())
            .ok_or(ValidationError::EmptyField("product link"))?;
        if !(link.starts_with("http://") || link.starts_with("https://")) {
            return Err(ValidationError::InvalidLink(link));
        }
        let name = self
            .product_name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or(ValidationError::EmptyField("product name"))?;
        if self.price == 0 {
            return Err(ValidationError::ZeroPrice);
        }

        let delivery = &self.delivery;
        for (field, value) in [
            ("delivery name", &delivery.name),
            ("delivery line1", &delivery.line1),
            ("delivery city", &delivery.city),
            ("delivery postal code", &delivery.postal_code),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::EmptyField(field));
            }
        }

        Ok(RequestDetails {
            product: ProductDetails {
                link,
                name,
                price: self.price,
                currency: self.currency,
            },
            requirement: self.requirement.clone(),
            delivery: self.delivery.clone(),
        })
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

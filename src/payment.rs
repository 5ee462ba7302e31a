//! Manual settlement records: buyer deposits and cardholder reimbursements
use chrono::Utc;
use serde::Serialize;

use super::ledger::EventType;
use super::types::{Currency, Side, TimeStamp};

#[derive(
    minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, Copy, Eq, PartialEq, Hash,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentKind {
    #[n(0)]
    BuyerDeposit,
    #[n(1)]
    CardholderReimbursement,
}

impl PaymentKind {
    /// Deposits flow into the platform, reimbursements flow out.
    pub fn side(&self) -> Side {
        match self {
            PaymentKind::BuyerDeposit => Side::Credit,
            PaymentKind::CardholderReimbursement => Side::Debit,
        }
    }
    pub fn created_event(&self) -> EventType {
        match self {
            PaymentKind::BuyerDeposit => EventType::BuyerDepositCreated,
            PaymentKind::CardholderReimbursement => EventType::CardholderReimbursementCreated,
        }
    }
    pub fn confirmed_event(&self) -> EventType {
        match self {
            PaymentKind::BuyerDeposit => EventType::BuyerDepositConfirmed,
            PaymentKind::CardholderReimbursement => EventType::CardholderReimbursementConfirmed,
        }
    }
}

#[derive(
    minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, Copy, Eq, PartialEq, Hash,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    #[n(0)]
    Created,
    #[n(1)]
    Confirmed,
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub request_id: String,
    #[n(2)]
    pub kind: PaymentKind,
    #[n(3)]
    pub amount: u64, // minor units
    #[n(4)]
    pub currency: Currency,
    #[n(5)]
    pub status: PaymentStatus,
    #[n(6)]
    pub reference_note: Option<String>, // UTR or bank reference, free text
    #[n(7)]
    pub created_at: TimeStamp<Utc>,
    #[n(8)]
    pub confirmed_at: Option<TimeStamp<Utc>>,
}

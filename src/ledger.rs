//! Append-only audit ledger: entry types, account keys and entry assembly
//!
//! Entries are assembled here and persisted by [`crate::store`] in the same
//! transaction as the mutation they document. Nothing in the crate updates or
//! deletes a stored entry.
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};

use super::config::Config;
use super::error::{LedgerError, ValidationError};
use super::types::{Currency, Side, TimeStamp};

/// Catch-all account for entries that reference nothing and nobody.
pub const PLATFORM_ACCOUNT_KEY: &str = "PLATFORM";

#[derive(
    minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, Copy, Eq, PartialEq, Hash,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    #[n(0)]
    RequestCreated,
    #[n(1)]
    RequestUpdated,
    #[n(2)]
    RequestCancelled,
    #[n(3)]
    BuyerProofUploaded,
    #[n(4)]
    CardholderProofUploaded,
    #[n(5)]
    CardholderAccepted,
    #[n(6)]
    AdminApprovedRequest,
    #[n(7)]
    AdminMarkedCompleted,
    #[n(8)]
    AdminRejectedRequest,
    #[n(9)]
    BuyerDepositCreated,
    #[n(10)]
    BuyerDepositConfirmed,
    #[n(11)]
    CardholderReimbursementCreated,
    #[n(12)]
    CardholderReimbursementConfirmed,
    #[n(13)]
    StatusChanged,
}

impl EventType {
    pub const ALL: [EventType; 14] = [
        EventType::RequestCreated,
        EventType::RequestUpdated,
        EventType::RequestCancelled,
        EventType::BuyerProofUploaded,
        EventType::CardholderProofUploaded,
        EventType::CardholderAccepted,
        EventType::AdminApprovedRequest,
        EventType::AdminMarkedCompleted,
        EventType::AdminRejectedRequest,
        EventType::BuyerDepositCreated,
        EventType::BuyerDepositConfirmed,
        EventType::CardholderReimbursementCreated,
        EventType::CardholderReimbursementConfirmed,
        EventType::StatusChanged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RequestCreated => "REQUEST_CREATED",
            EventType::RequestUpdated => "REQUEST_UPDATED",
            EventType::RequestCancelled => "REQUEST_CANCELLED",
            EventType::BuyerProofUploaded => "BUYER_PROOF_UPLOADED",
            EventType::CardholderProofUploaded => "CARDHOLDER_PROOF_UPLOADED",
            EventType::CardholderAccepted => "CARDHOLDER_ACCEPTED",
            EventType::AdminApprovedRequest => "ADMIN_APPROVED_REQUEST",
            EventType::AdminMarkedCompleted => "ADMIN_MARKED_COMPLETED",
            EventType::AdminRejectedRequest => "ADMIN_REJECTED_REQUEST",
            EventType::BuyerDepositCreated => "BUYER_DEPOSIT_CREATED",
            EventType::BuyerDepositConfirmed => "BUYER_DEPOSIT_CONFIRMED",
            EventType::CardholderReimbursementCreated => "CARDHOLDER_REIMBURSEMENT_CREATED",
            EventType::CardholderReimbursementConfirmed => "CARDHOLDER_REIMBURSEMENT_CONFIRMED",
            EventType::StatusChanged => "STATUS_CHANGED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        if wanted == "MANUAL_REIMBURSEMENT_COMPLETED" {
            return Ok(EventType::CardholderReimbursementCreated);
        }
        EventType::ALL
            .into_iter()
            .find(|event| event.as_str() == wanted)
            .ok_or(ValidationError::UnknownEventType(s.to_string()))
    }
}

#[derive(
    minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, Copy, Default, Eq, PartialEq,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scope {
    #[default]
    #[n(0)]
    UserTransaction,
    #[n(1)]
    Settlement,
    #[n(2)]
    Operational,
}

/// What a ledger entry is about.
///
/// Proof uploads carry their parent request so request timelines can find them
/// without a second lookup.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    #[n(0)]
    Request {
        #[n(0)]
        request_id: String,
    },
    #[n(1)]
    ProofUpload {
        #[n(0)]
        proof_id: String,
        #[n(1)]
        request_id: String,
    },
}

impl Reference {
    pub fn request(request_id: impl Into<String>) -> Self {
        Reference::Request {
            request_id: request_id.into(),
        }
    }
    pub fn proof_upload(proof_id: impl Into<String>, request_id: impl Into<String>) -> Self {
        Reference::ProofUpload {
            proof_id: proof_id.into(),
            request_id: request_id.into(),
        }
    }
    pub fn reference_type(&self) -> &'static str {
        match self {
            Reference::Request { .. } => "REQUEST",
            Reference::ProofUpload { .. } => "PROOF_UPLOAD",
        }
    }
    pub fn reference_id(&self) -> &str {
        match self {
            Reference::Request { request_id } => request_id,
            Reference::ProofUpload { proof_id, .. } => proof_id,
        }
    }
    /// The request this reference ultimately belongs to.
    pub fn request_id(&self) -> &str {
        match self {
            Reference::Request { request_id } | Reference::ProofUpload { request_id, .. } => {
                request_id
            }
        }
    }
}

/// Free-form event detail. Stored as JSON text inside the CBOR record.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct Meta(pub Value);

impl Meta {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

impl<C> minicbor::Encode<C> for Meta {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.str(&self.0.to_string())?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for Meta {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let text = d.str()?;
        serde_json::from_str(text)
            .map(Meta)
            .map_err(|_| minicbor::decode::Error::message("ledger meta is not valid json"))
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub seq: u64, // insertion order, breaks created_at ties
    #[n(2)]
    pub created_at: TimeStamp<Utc>,
    #[n(3)]
    pub scope: Scope,
    #[n(4)]
    pub event_type: EventType,
    #[n(5)]
    pub side: Option<Side>,
    #[n(6)]
    pub amount: Option<u64>,
    #[n(7)]
    pub currency: Option<Currency>,
    #[n(8)]
    pub account_key: String,
    #[n(9)]
    pub reference: Option<Reference>,
    #[n(10)]
    pub buyer_id: Option<String>,
    #[n(11)]
    pub cardholder_id: Option<String>,
    #[n(12)]
    pub admin_id: Option<String>,
    #[n(13)]
    pub description: Option<String>,
    #[n(14)]
    pub meta: Meta,
}

impl LedgerEntry {
    /// Key of the primary ledger tree: big-endian creation nanos then sequence.
    pub fn storage_key(&self) -> [u8; 16] {
        storage_key(&self.created_at, self.seq)
    }
}

pub(crate) fn storage_key(created_at: &TimeStamp<Utc>, seq: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&created_at.as_key_nanos().to_be_bytes());
    key[8..].copy_from_slice(&seq.to_be_bytes());
    key
}

/// Input to the recorder. Everything but the event type is optional.
#[derive(Debug, Clone, Default)]
pub struct NewLedgerEntry {
    pub event_type: Option<EventType>,
    pub scope: Option<Scope>,
    pub side: Option<Side>,
    pub amount: Option<u64>,
    pub currency: Option<Currency>,
    pub reference: Option<Reference>,
    pub buyer_id: Option<String>,
    pub cardholder_id: Option<String>,
    pub admin_id: Option<String>,
    pub account_key: Option<String>,
    pub description: Option<String>,
    pub meta: Option<Value>,
}

impl NewLedgerEntry {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type: Some(event_type),
            ..Default::default()
        }
    }
    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }
    pub fn money(mut self, side: Side, amount: u64, currency: Option<Currency>) -> Self {
        self.side = Some(side);
        self.amount = Some(amount);
        self.currency = currency;
        self
    }
    pub fn reference(mut self, reference: Reference) -> Self {
        self.reference = Some(reference);
        self
    }
    pub fn buyer(mut self, id: impl Into<String>) -> Self {
        self.buyer_id = Some(id.into());
        self
    }
    pub fn cardholder(mut self, id: impl Into<String>) -> Self {
        self.cardholder_id = Some(id.into());
        self
    }
    pub fn admin(mut self, id: impl Into<String>) -> Self {
        self.admin_id = Some(id.into());
        self
    }
    pub fn account_key(mut self, key: impl Into<String>) -> Self {
        self.account_key = Some(key.into());
        self
    }
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// explicit key, then `TYPE:id` of the reference, then `USER:<buyer|cardholder>`, then the platform
    pub fn derive_account_key(&self) -> String {
        if let Some(key) = self.account_key.as_deref().filter(|k| !k.trim().is_empty()) {
            return key.trim().to_string();
        }
        if let Some(reference) = &self.reference {
            return format!("{}:{}", reference.reference_type(), reference.reference_id());
        }
        if let Some(user) = self.buyer_id.as_ref().or(self.cardholder_id.as_ref()) {
            return format!("USER:{user}");
        }
        PLATFORM_ACCOUNT_KEY.to_string()
    }

    /// Validates the input and fills defaults. Called inside the storage transaction,
    /// so an error here rolls back the mutation being documented.
    pub fn finalise(
        self,
        config: &Config,
        id: String,
        seq: u64,
        created_at: TimeStamp<Utc>,
    ) -> Result<LedgerEntry, LedgerError> {
        if self.amount.is_none() && (self.side.is_some() || self.currency.is_some()) {
            return Err(LedgerError::SideWithoutAmount);
        }
        if let Some(description) = &self.description {
            let len = description.chars().count();
            if len > config.max_description_len {
                return Err(LedgerError::DescriptionTooLong {
                    len,
                    limit: config.max_description_len,
                });
            }
        }

        let mut meta = match self.meta.clone() {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => return Err(LedgerError::MetaNotObject),
        };
        if let Some(Reference::ProofUpload { request_id, .. }) = &self.reference {
            meta.insert("requestId".into(), Value::String(request_id.clone()));
        }

        let account_key = self.derive_account_key();
        let currency = match (self.amount, self.currency) {
            (Some(_), None) => Some(config.base_currency),
            (_, currency) => currency,
        };

        Ok(LedgerEntry {
            id,
            seq,
            created_at,
            scope: self.scope.unwrap_or_default(),
            event_type: self.event_type.unwrap_or(EventType::StatusChanged),
            side: self.side,
            amount: self.amount,
            currency,
            account_key,
            reference: self.reference,
            buyer_id: self.buyer_id,
            cardholder_id: self.cardholder_id,
            admin_id: self.admin_id,
            description: self.description,
            meta: Meta(Value::Object(meta)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    /// Chronological timeline.
    #[default]
    Ascending,
    /// Latest first.
    Descending,
}

/// Filter for the ledger browser. Results are always latest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerFilter {
    pub event_type: Option<EventType>,
    pub request_id: Option<String>,
    pub limit: Option<usize>,
}

impl LedgerFilter {
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        let event_ok = self.event_type.is_none_or(|e| e == entry.event_type);
        let request_ok = match &self.request_id {
            None => true,
            Some(id) => entry.reference.as_ref().is_some_and(|r| r.request_id() == id),
        };
        event_ok && request_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn finalise(input: NewLedgerEntry) -> Result<LedgerEntry, LedgerError> {
        input.finalise(&Config::default(), "led1test".into(), 1, TimeStamp::new())
    }

    #[test]
    fn account_key_prefers_explicit_then_reference_then_user() {
        let explicit = NewLedgerEntry::new(EventType::StatusChanged)
            .account_key("ESCROW")
            .reference(Reference::request("r1"));
        assert_eq!(explicit.derive_account_key(), "ESCROW");

        let by_reference = NewLedgerEntry::new(EventType::StatusChanged)
            .reference(Reference::request("r1"))
            .buyer("b1");
        assert_eq!(by_reference.derive_account_key(), "REQUEST:r1");

        let by_cardholder = NewLedgerEntry::new(EventType::StatusChanged).cardholder("c1");
        assert_eq!(by_cardholder.derive_account_key(), "USER:c1");

        let nothing = NewLedgerEntry::new(EventType::StatusChanged);
        assert_eq!(nothing.derive_account_key(), PLATFORM_ACCOUNT_KEY);
    }

    #[test]
    fn amount_defaults_to_base_currency() {
        let entry = finalise(
            NewLedgerEntry::new(EventType::BuyerDepositCreated).money(Side::Credit, 500, None),
        )
        .unwrap();
        assert_eq!(entry.currency, Some(Config::default().base_currency));
        assert_eq!(entry.scope, Scope::UserTransaction);
    }

    #[test]
    fn operational_entries_have_no_money_fields() {
        let entry = finalise(NewLedgerEntry::new(EventType::RequestCreated)).unwrap();
        assert_eq!((entry.side, entry.amount, entry.currency), (None, None, None));
    }

    #[test]
    fn rejects_side_without_amount_and_non_object_meta() {
        let mut input = NewLedgerEntry::new(EventType::BuyerDepositCreated);
        input.side = Some(Side::Credit);
        assert_eq!(finalise(input).unwrap_err(), LedgerError::SideWithoutAmount);

        let input = NewLedgerEntry::new(EventType::StatusChanged).meta(json!([1, 2]));
        assert_eq!(finalise(input).unwrap_err(), LedgerError::MetaNotObject);
    }

    #[test]
    fn proof_references_embed_parent_request() {
        let entry = finalise(
            NewLedgerEntry::new(EventType::BuyerProofUploaded)
                .reference(Reference::proof_upload("prf1", "req1"))
                .meta(json!({ "kind": "BUYER_CHECKOUT" })),
        )
        .unwrap();
        assert_eq!(entry.account_key, "PROOF_UPLOAD:prf1");
        assert_eq!(entry.meta.get("requestId"), Some(&json!("req1")));
        assert_eq!(entry.meta.get("kind"), Some(&json!("BUYER_CHECKOUT")));
    }

    #[test]
    fn event_type_parse_accepts_reimbursement_alias() {
        assert_eq!(
            "MANUAL_REIMBURSEMENT_COMPLETED".parse::<EventType>().unwrap(),
            EventType::CardholderReimbursementCreated
        );
        for event in EventType::ALL {
            assert_eq!(event.as_str().parse::<EventType>().unwrap(), event);
        }
    }

    #[test]
    fn entry_cbor_keeps_meta() {
        let entry = finalise(
            NewLedgerEntry::new(EventType::RequestCancelled).meta(json!({ "actor": "buyer" })),
        )
        .unwrap();
        let encoded = minicbor::to_vec(&entry).unwrap();
        let decoded: LedgerEntry = minicbor::decode(&encoded).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn storage_keys_sort_by_time_then_sequence() {
        let early = TimeStamp::new_with(2024, 5, 1, 0, 0, 0);
        let late = TimeStamp::new_with(2024, 5, 1, 0, 0, 1);
        assert!(storage_key(&early, 9) < storage_key(&late, 1));
        assert!(storage_key(&early, 1) < storage_key(&early, 2));
    }
}

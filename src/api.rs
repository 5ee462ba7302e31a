//! JSON-shaped handler surface
//!
//! Route handlers in the web tier deserialize their input into these types,
//! call one function here, and send back the [`ApiResponse`] body with
//! [`ApiResponse::status`]. Handlers never panic or propagate errors.
use serde::{Deserialize, Serialize};

use super::error::RequestError;
use super::ledger::{EventType, LedgerEntry, LedgerFilter, Meta, Order, Scope};
use super::request::{Request, RequestStatus};
use super::service::MarketplaceService;
use super::types::{Actor, Currency, Side};

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(flatten)]
    pub body: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub status: u16,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(body: T) -> Self {
        Self {
            ok: true,
            body: Some(body),
            error: None,
            status: 200,
        }
    }

    pub fn failure(err: &RequestError) -> Self {
        let status = err.http_status();
        if status >= 500 {
            tracing::error!(error = %err, "handler failed");
        } else {
            tracing::warn!(status, error = %err, "handler rejected input");
        }
        Self {
            ok: false,
            body: None,
            error: Some(err.to_string()),
            status,
        }
    }

    fn from_result(result: Result<T, RequestError>) -> Self {
        match result {
            Ok(body) => Self::success(body),
            Err(err) => Self::failure(&err),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"ok":false,"error":"failed to serialize response"}"#.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionInput {
    pub request_id: String,
    pub target_status: String,
    pub expected_status: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestBody {
    pub request: Request,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerQuery {
    pub request_id: Option<String>,
    pub event_type: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerItems {
    pub items: Vec<LedgerEntryView>,
}

/// Wire shape of a ledger entry; the reference union is flattened into two columns.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntryView {
    pub id: String,
    pub created_at: String,
    pub scope: Scope,
    pub event_type: String,
    pub side: Option<Side>,
    pub amount: Option<u64>,
    pub currency: Option<Currency>,
    pub description: Option<String>,
    pub reference_type: Option<&'static str>,
    pub reference_id: Option<String>,
    pub account_key: String,
    pub buyer_id: Option<String>,
    pub cardholder_id: Option<String>,
    pub admin_id: Option<String>,
    pub meta: Meta,
}

impl From<&LedgerEntry> for LedgerEntryView {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            id: entry.id.clone(),
            created_at: entry.created_at.to_rfc3339(),
            scope: entry.scope,
            event_type: entry.event_type.as_str().to_string(),
            side: entry.side,
            amount: entry.amount,
            currency: entry.currency,
            description: entry.description.clone(),
            reference_type: entry.reference.as_ref().map(|r| r.reference_type()),
            reference_id: entry.reference.as_ref().map(|r| r.reference_id().to_string()),
            account_key: entry.account_key.clone(),
            buyer_id: entry.buyer_id.clone(),
            cardholder_id: entry.cardholder_id.clone(),
            admin_id: entry.admin_id.clone(),
            meta: entry.meta.clone(),
        }
    }
}

fn items(entries: &[LedgerEntry]) -> LedgerItems {
    LedgerItems {
        items: entries.iter().map(LedgerEntryView::from).collect(),
    }
}

/// Move a request to the status named in `input`. Legacy status names are accepted.
pub fn handle_transition(
    service: &MarketplaceService,
    actor: &Actor,
    input: &TransitionInput,
) -> ApiResponse<RequestBody> {
    ApiResponse::from_result(transition(service, actor, input))
}

fn transition(
    service: &MarketplaceService,
    actor: &Actor,
    input: &TransitionInput,
) -> Result<RequestBody, RequestError> {
    let target: RequestStatus = input.target_status.parse()?;
    let expected = input
        .expected_status
        .as_deref()
        .map(str::parse::<RequestStatus>)
        .transpose()?;
    let outcome = service.transition(
        actor,
        &input.request_id,
        target,
        expected,
        input.reason.as_deref(),
    )?;
    Ok(RequestBody {
        request: outcome.request,
    })
}

/// Ledger explorer: latest first, optionally narrowed by request and event type.
pub fn handle_ledger_read(service: &MarketplaceService, query: &LedgerQuery) -> ApiResponse<LedgerItems> {
    ApiResponse::from_result(ledger_read(service, query))
}

fn ledger_read(service: &MarketplaceService, query: &LedgerQuery) -> Result<LedgerItems, RequestError> {
    let filter = LedgerFilter {
        event_type: query
            .event_type
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .map(str::parse::<EventType>)
            .transpose()?,
        request_id: query
            .request_id
            .clone()
            .filter(|id| !id.trim().is_empty()),
        limit: query.limit,
    };
    Ok(items(&service.browse_ledger(&filter)?))
}

/// Chronological timeline of a single request.
pub fn handle_request_timeline(service: &MarketplaceService, request_id: &str) -> ApiResponse<LedgerItems> {
    let result = service
        .request(request_id)
        .and_then(|_| service.ledger_for_request(request_id, Order::Ascending))
        .map(|entries| items(&entries));
    ApiResponse::from_result(result)
}

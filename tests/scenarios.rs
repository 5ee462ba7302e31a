//! End-to-end request workflows against a real sled database
use std::sync::Arc;

use anyhow::Context;
use card_offer::{
    card::CardDraft,
    config::Config,
    error::RequestError,
    ledger::{EventType, LedgerFilter, Order},
    proof::ProofKind,
    request::{DeliveryAddress, RequestDraft, RequestStatus},
    service::MarketplaceService,
    types::{Actor, Currency},
};
use sled::open;
use tempfile::{TempDir, tempdir};

// Sled locks its directory, so every test gets its own database under a temp dir.
fn service(name: &str) -> anyhow::Result<(TempDir, MarketplaceService)> {
    let temp_dir = tempdir()?;
    let db = open(temp_dir.path().join(name))?;
    let service = MarketplaceService::new(Arc::new(db), Config::default())?;
    Ok((temp_dir, service))
}

fn hdfc_draft() -> RequestDraft {
    RequestDraft::new()
        .set_product_link("https://shop.example/phone")
        .set_product_name("Phone")
        .set_price(74_999_00, Currency::INR)
        .require_issuer("HDFC")
        .require_network("VISA")
        .require_label("Diners Black")
        .set_delivery(DeliveryAddress {
            name: "Asha".into(),
            line1: "12 MG Road".into(),
            city: "Pune".into(),
            postal_code: "411001".into(),
            ..Default::default()
        })
}

fn count(service: &MarketplaceService, request_id: &str) -> usize {
    service
        .ledger_for_request(request_id, Order::Ascending)
        .map(|entries| entries.len())
        .unwrap_or_default()
}

#[test]
fn submit_approve_accept_complete() -> anyhow::Result<()> {
    let (_dir, service) = service("happy_path.db")?;
    let buyer = Actor::buyer("buyer@example.com");
    let cardholder = Actor::cardholder("holder@example.com");
    let admin = Actor::admin("ops@example.com");

    let request = service
        .create_request(&buyer, &hdfc_draft())
        .context("Request failed on create: ")?;
    assert_eq!(request.status, RequestStatus::Submitted);
    assert_eq!(count(&service, &request.id), 1);

    let approved = service.approve_request(&admin, &request.id)?;
    assert_eq!(approved.request.status, RequestStatus::AdminApproved);
    assert_eq!(
        approved.entry.as_ref().map(|e| e.event_type),
        Some(EventType::AdminApprovedRequest)
    );

    service.register_card(&cardholder, &CardDraft::new().network("VISA").last4("4242"))?;
    let matched = service.accept_request(&cardholder, &request.id)?;
    assert_eq!(matched.request.status, RequestStatus::Matched);
    assert_eq!(
        matched.request.matched_cardholder_email.as_deref(),
        Some("holder@example.com")
    );
    assert!(matched.request.matched_at.is_some());
    assert_eq!(
        matched.entry.as_ref().map(|e| e.event_type),
        Some(EventType::CardholderAccepted)
    );

    let completed = service.complete_request(&admin, &request.id)?;
    assert_eq!(completed.request.status, RequestStatus::Completed);
    assert!(completed.request.completed_at.is_some());

    let events: Vec<EventType> = service
        .ledger_for_request(&request.id, Order::Ascending)?
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        events,
        vec![
            EventType::RequestCreated,
            EventType::AdminApprovedRequest,
            EventType::CardholderAccepted,
            EventType::AdminMarkedCompleted,
        ]
    );

    let err = service
        .admin_cancel_request(&admin, &request.id, None)
        .unwrap_err();
    assert_eq!(err.to_string(), "invalid transition: COMPLETED is terminal");
    assert_eq!(err.http_status(), 400);
    assert_eq!(count(&service, &request.id), 4);

    Ok(())
}

#[test]
fn replayed_transition_writes_nothing() -> anyhow::Result<()> {
    let (_dir, service) = service("replay.db")?;
    let admin = Actor::admin("ops@example.com");
    let request = service.create_request(&Actor::buyer("b@example.com"), &hdfc_draft())?;

    let first = service.approve_request(&admin, &request.id)?;
    let second = service.approve_request(&admin, &request.id)?;

    assert!(!first.was_replay());
    assert!(second.was_replay());
    assert_eq!(second.request.status, RequestStatus::AdminApproved);
    assert_eq!(count(&service, &request.id), 2);
    Ok(())
}

#[test]
fn failed_ledger_write_rolls_back_status() -> anyhow::Result<()> {
    let (_dir, service) = service("atomicity.db")?;
    let admin = Actor::admin("ops@example.com");
    let request = service.create_request(&Actor::buyer("b@example.com"), &hdfc_draft())?;
    let before = service.store().ledger_len();

    // the reason becomes the entry description, which is over the configured limit
    let reason = "x".repeat(service.config().max_description_len + 1);
    let err = service
        .reject_request(&admin, &request.id, Some(&reason))
        .unwrap_err();

    assert!(matches!(err, RequestError::Ledger(_)));
    assert_eq!(service.request(&request.id)?.status, RequestStatus::Submitted);
    assert_eq!(service.store().ledger_len(), before);
    assert_eq!(count(&service, &request.id), 1);
    Ok(())
}

#[test]
fn missing_request_is_not_found() -> anyhow::Result<()> {
    let (_dir, service) = service("missing.db")?;
    let err = service
        .approve_request(&Actor::admin("ops@example.com"), "req1doesnotexist")
        .unwrap_err();
    assert!(matches!(err, RequestError::NotFound(_)));
    assert_eq!(err.http_status(), 404);
    assert_eq!(service.store().ledger_len(), 0);
    Ok(())
}

#[test]
fn actor_scoped_cancellation() -> anyhow::Result<()> {
    let (_dir, service) = service("cancel.db")?;
    let buyer = Actor::buyer("b@example.com");
    let stranger = Actor::buyer("someone@example.com");
    let cardholder = Actor::cardholder("holder@example.com");
    let admin = Actor::admin("ops@example.com");
    service.register_card(&cardholder, &CardDraft::new())?;

    // buyer cancels before matching
    let early = service.create_request(&buyer, &hdfc_draft())?;
    let err = service.cancel_as_buyer(&stranger, &early.id, None).unwrap_err();
    assert_eq!(err.http_status(), 403);
    let cancelled = service.cancel_as_buyer(&buyer, &early.id, Some("changed my mind"))?;
    assert_eq!(cancelled.request.status, RequestStatus::Cancelled);
    let entry = cancelled.entry.expect("cancellation is recorded");
    assert_eq!(entry.event_type, EventType::RequestCancelled);
    assert_eq!(entry.meta.get("actor"), Some(&serde_json::json!("buyer")));
    assert_eq!(
        entry.description.as_deref(),
        Some("buyer moved request from SUBMITTED to CANCELLED: changed my mind")
    );

    // buyer may not cancel once matched, the matched cardholder may
    let late = service.create_request(&buyer, &hdfc_draft())?;
    service.approve_request(&admin, &late.id)?;
    service.accept_request(&cardholder, &late.id)?;
    let err = service.cancel_as_buyer(&buyer, &late.id, None).unwrap_err();
    assert!(matches!(err, RequestError::Precondition(_)));
    assert_eq!(service.request(&late.id)?.status, RequestStatus::Matched);

    let other_holder = Actor::cardholder("other@example.com");
    assert!(service.cancel_as_cardholder(&other_holder, &late.id, None).is_err());
    let cancelled = service.cancel_as_cardholder(&cardholder, &late.id, None)?;
    assert_eq!(cancelled.request.status, RequestStatus::Cancelled);
    assert_eq!(
        cancelled.request.matched_cardholder_email.as_deref(),
        Some("holder@example.com")
    );

    // cardholders cannot cancel unmatched requests
    let fresh = service.create_request(&buyer, &hdfc_draft())?;
    assert!(service.cancel_as_cardholder(&cardholder, &fresh.id, None).is_err());
    let by_admin = service.admin_cancel_request(&admin, &fresh.id, Some("duplicate"))?;
    assert_eq!(by_admin.request.status, RequestStatus::Cancelled);
    Ok(())
}

#[test]
fn acceptance_preconditions() -> anyhow::Result<()> {
    let (_dir, service) = service("accept.db")?;
    let buyer = Actor::buyer("b@example.com");
    let admin = Actor::admin("ops@example.com");
    let first = Actor::cardholder("first@example.com");
    let second = Actor::cardholder("second@example.com");

    let request = service.create_request(&buyer, &hdfc_draft())?;

    // not yet approved
    service.register_card(&first, &CardDraft::new().issuer("HDFC"))?;
    let err = service.accept_request(&first, &request.id).unwrap_err();
    assert_eq!(
        err.to_string(),
        "invalid transition: cannot move from SUBMITTED to MATCHED"
    );

    service.approve_request(&admin, &request.id)?;

    // no active card
    let err = service.accept_request(&second, &request.id).unwrap_err();
    assert!(matches!(err, RequestError::Precondition(_)));

    service.accept_request(&first, &request.id)?;
    service.register_card(&second, &CardDraft::new())?;
    let err = service.accept_request(&second, &request.id).unwrap_err();
    assert!(err.to_string().contains("already matched"));

    // the matched cardholder retrying is harmless
    let replay = service.accept_request(&first, &request.id)?;
    assert!(replay.was_replay());
    assert_eq!(count(&service, &request.id), 3);
    Ok(())
}

#[test]
fn acceptance_prefers_oldest_compatible_card() -> anyhow::Result<()> {
    let (_dir, service) = service("card_choice.db")?;
    let buyer = Actor::buyer("b@example.com");
    let admin = Actor::admin("ops@example.com");
    let holder = Actor::cardholder("holder@example.com");

    service.register_card(&holder, &CardDraft::new().issuer("SBI").network("VISA"))?;
    let compatible = service.register_card(&holder, &CardDraft::new().network("VISA"))?;
    service.register_card(&holder, &CardDraft::new().issuer("HDFC").network("VISA"))?;

    let request = service.create_request(&buyer, &hdfc_draft())?;
    service.approve_request(&admin, &request.id)?;
    let matched = service.accept_request(&holder, &request.id)?;

    assert_eq!(matched.request.matched_card_id.as_deref(), Some(compatible.id.as_str()));
    let entry = matched.entry.expect("acceptance is recorded");
    assert_eq!(entry.meta.get("fallbackCard"), Some(&serde_json::json!(false)));
    Ok(())
}

#[test]
fn deactivated_and_failed_cards_cannot_accept() -> anyhow::Result<()> {
    let (_dir, service) = service("card_status.db")?;
    let holder = Actor::cardholder("holder@example.com");
    let admin = Actor::admin("ops@example.com");

    let card = service.register_card(&holder, &CardDraft::new())?;
    let failed = service.record_card_verification(&card.id, false)?;
    assert!(!failed.active);

    let request = service.create_request(&Actor::buyer("b@example.com"), &hdfc_draft())?;
    service.approve_request(&admin, &request.id)?;
    assert!(service.accept_request(&holder, &request.id).is_err());

    let card = service.register_card(&holder, &CardDraft::new())?;
    service.deactivate_card(&holder, &card.id)?;
    assert!(service.accept_request(&holder, &request.id).is_err());
    assert_eq!(service.request(&request.id)?.status, RequestStatus::AdminApproved);
    Ok(())
}

#[test]
fn proof_uploads_land_on_the_request_timeline() -> anyhow::Result<()> {
    let (_dir, service) = service("proofs.db")?;
    let buyer = Actor::buyer("b@example.com");
    let holder = Actor::cardholder("holder@example.com");
    let admin = Actor::admin("ops@example.com");
    service.register_card(&holder, &CardDraft::new())?;

    let request = service.create_request(&buyer, &hdfc_draft())?;
    let checkout = service.upload_proof(
        &buyer,
        &request.id,
        ProofKind::BuyerCheckout,
        "https://files.example/checkout.png",
    )?;

    // cardholder proofs need a match first
    let err = service
        .upload_proof(&holder, &request.id, ProofKind::CardholderInvoice, "https://files.example/inv.pdf")
        .unwrap_err();
    assert_eq!(err.http_status(), 403);

    service.approve_request(&admin, &request.id)?;
    service.accept_request(&holder, &request.id)?;
    service.upload_proof(
        &holder,
        &request.id,
        ProofKind::CardholderInvoice,
        "https://files.example/inv.pdf",
    )?;

    // buyer uploads close once matched
    let err = service
        .upload_proof(&buyer, &request.id, ProofKind::BuyerProduct, "https://files.example/p.png")
        .unwrap_err();
    assert!(matches!(err, RequestError::Precondition(_)));

    let stored = service.request(&request.id)?;
    assert_eq!(
        stored.proofs.get(ProofKind::BuyerCheckout),
        Some("https://files.example/checkout.png")
    );
    assert!(stored.proofs.get(ProofKind::CardholderInvoice).is_some());
    assert_eq!(service.proofs_for_request(&request.id)?.len(), 2);

    let timeline = service.ledger_for_request(&request.id, Order::Ascending)?;
    let proof_entries: Vec<_> = timeline
        .iter()
        .filter(|e| e.reference.as_ref().map(|r| r.reference_type()) == Some("PROOF_UPLOAD"))
        .collect();
    assert_eq!(proof_entries.len(), 2);
    assert_eq!(proof_entries[0].reference.as_ref().map(|r| r.reference_id()), Some(checkout.id.as_str()));
    assert_eq!(
        proof_entries[0].meta.get("requestId"),
        Some(&serde_json::json!(request.id))
    );
    assert_eq!(proof_entries[1].event_type, EventType::CardholderProofUploaded);
    Ok(())
}

#[test]
fn deposits_and_reimbursements() -> anyhow::Result<()> {
    let (_dir, service) = service("payments.db")?;
    let buyer = Actor::buyer("b@example.com");
    let holder = Actor::cardholder("holder@example.com");
    let admin = Actor::admin("ops@example.com");
    service.register_card(&holder, &CardDraft::new())?;

    let request = service.create_request(&buyer, &hdfc_draft())?;
    assert!(service
        .record_buyer_deposit(&buyer, &request.id, 1_000, None, None)
        .is_err());

    service.approve_request(&admin, &request.id)?;
    let deposit = service.record_buyer_deposit(&buyer, &request.id, 74_999_00, None, Some("UTR123"))?;
    assert_eq!(deposit.currency, Currency::INR);

    let confirmed = service.confirm_buyer_deposit(&admin, &deposit.id)?;
    let again = service.confirm_buyer_deposit(&admin, &deposit.id)?;
    assert_eq!(confirmed, again);

    assert!(service
        .record_cardholder_reimbursement(&admin, &request.id, 500, None, None)
        .is_err());
    service.accept_request(&holder, &request.id)?;
    let payout = service.record_cardholder_reimbursement(&admin, &request.id, 74_999_00, None, None)?;
    service.confirm_cardholder_reimbursement(&holder, &payout.id)?;
    assert!(service
        .confirm_cardholder_reimbursement(&holder, &deposit.id)
        .is_err());

    let money: Vec<_> = service
        .browse_ledger(&LedgerFilter {
            request_id: Some(request.id.clone()),
            ..Default::default()
        })?
        .into_iter()
        .filter(|e| e.amount.is_some())
        .map(|e| (e.event_type, e.side.map(|s| format!("{s:?}"))))
        .collect();
    assert_eq!(
        money,
        vec![
            (EventType::CardholderReimbursementConfirmed, Some("Debit".to_string())),
            (EventType::CardholderReimbursementCreated, Some("Debit".to_string())),
            (EventType::BuyerDepositConfirmed, Some("Credit".to_string())),
            (EventType::BuyerDepositCreated, Some("Credit".to_string())),
        ]
    );
    assert_eq!(service.payments_for_request(&request.id)?.len(), 2);
    Ok(())
}

#[test]
fn buyer_edits_only_while_submitted() -> anyhow::Result<()> {
    let (_dir, service) = service("edits.db")?;
    let buyer = Actor::buyer("b@example.com");
    let admin = Actor::admin("ops@example.com");
    let request = service.create_request(&buyer, &hdfc_draft())?;

    // identical details are a no-op
    service.update_request(&buyer, &request.id, &hdfc_draft())?;
    assert_eq!(count(&service, &request.id), 1);

    let cheaper = hdfc_draft().set_price(69_999_00, Currency::INR);
    let updated = service.update_request(&buyer, &request.id, &cheaper)?;
    assert_eq!(updated.details.product.price, 69_999_00);
    let last = service.ledger_for_request(&request.id, Order::Descending)?;
    assert_eq!(last[0].event_type, EventType::RequestUpdated);

    service.approve_request(&admin, &request.id)?;
    assert!(service.update_request(&buyer, &request.id, &hdfc_draft()).is_err());
    Ok(())
}

#[test]
fn admin_cannot_force_a_match() -> anyhow::Result<()> {
    let (_dir, service) = service("force_match.db")?;
    let admin = Actor::admin("ops@example.com");
    let request = service.create_request(&Actor::buyer("b@example.com"), &hdfc_draft())?;
    service.approve_request(&admin, &request.id)?;

    let err = service
        .transition(&admin, &request.id, RequestStatus::Matched, None, None)
        .unwrap_err();
    assert!(matches!(err, RequestError::Precondition(_)));

    let buyer = Actor::buyer("b@example.com");
    let err = service
        .transition(&buyer, &request.id, RequestStatus::Completed, None, None)
        .unwrap_err();
    assert_eq!(err.http_status(), 403);
    Ok(())
}

#[test]
fn admin_matched_replay_succeeds() -> anyhow::Result<()> {
    let (_dir, service) = service("matched_replay.db")?;
    let admin = Actor::admin("ops@example.com");
    let holder = Actor::cardholder("holder@example.com");
    service.register_card(&holder, &CardDraft::new())?;
    let request = service.create_request(&Actor::buyer("b@example.com"), &hdfc_draft())?;
    service.approve_request(&admin, &request.id)?;
    service.accept_request(&holder, &request.id)?;

    let replay = service.transition(&admin, &request.id, RequestStatus::Matched, None, None)?;
    assert!(replay.was_replay());
    assert_eq!(replay.request.status, RequestStatus::Matched);
    assert_eq!(count(&service, &request.id), 3);
    Ok(())
}

#[test]
fn accepted_request_replays_after_card_is_deactivated() -> anyhow::Result<()> {
    let (_dir, service) = service("accept_replay.db")?;
    let admin = Actor::admin("ops@example.com");
    let holder = Actor::cardholder("holder@example.com");
    let card = service.register_card(&holder, &CardDraft::new())?;
    let request = service.create_request(&Actor::buyer("b@example.com"), &hdfc_draft())?;
    service.approve_request(&admin, &request.id)?;
    service.accept_request(&holder, &request.id)?;

    service.deactivate_card(&holder, &card.id)?;
    let replay = service
        .accept_request(&holder, &request.id)
        .context("retrying an accepted request")?;
    assert!(replay.was_replay());
    assert_eq!(replay.request.matched_card_id.as_deref(), Some(card.id.as_str()));
    assert_eq!(count(&service, &request.id), 3);
    Ok(())
}

#[test]
fn accepting_a_missing_request_is_not_found() -> anyhow::Result<()> {
    let (_dir, service) = service("accept_missing.db")?;
    // no cards at all, the missing request still wins
    let holder = Actor::cardholder("holder@example.com");
    let err = service.accept_request(&holder, "req1doesnotexist").unwrap_err();
    assert!(matches!(err, RequestError::NotFound(_)));
    assert_eq!(err.http_status(), 404);
    Ok(())
}

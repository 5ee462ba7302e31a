//! Manual settlement: buyer deposits in, cardholder reimbursements out
use serde_json::json;

use super::{MarketplaceService, abort, forbidden, require_role, with_actor};
use crate::error::{RequestError, ValidationError};
use crate::ledger::{NewLedgerEntry, Reference, Scope};
use crate::payment::{Payment, PaymentKind, PaymentStatus};
use crate::request::{Request, RequestStatus};
use crate::types::{Actor, ActorRole, Currency};
use crate::utils;

impl MarketplaceService {
    /// Buyer reports a deposit against an approved or matched request.
    pub fn record_buyer_deposit(
        &self,
        buyer: &Actor,
        request_id: &str,
        amount: u64,
        currency: Option<Currency>,
        reference_note: Option<&str>,
    ) -> Result<Payment, RequestError> {
        require_role(buyer, ActorRole::Buyer, request_id)?;
        self.create_payment(
            buyer,
            request_id,
            PaymentKind::BuyerDeposit,
            amount,
            currency,
            reference_note,
            |request| {
                if !request.is_owned_by(&buyer.email) {
                    return Err(forbidden(buyer, request_id));
                }
                match request.status {
                    RequestStatus::AdminApproved | RequestStatus::Matched => Ok(()),
                    status => Err(RequestError::precondition(format!(
                        "deposits are accepted only for ADMIN_APPROVED or MATCHED requests, {request_id} is {status}"
                    ))),
                }
            },
        )
    }

    /// Admin records a manual payout to the matched cardholder.
    pub fn record_cardholder_reimbursement(
        &self,
        admin: &Actor,
        request_id: &str,
        amount: u64,
        currency: Option<Currency>,
        reference_note: Option<&str>,
    ) -> Result<Payment, RequestError> {
        require_role(admin, ActorRole::Admin, request_id)?;
        self.create_payment(
            admin,
            request_id,
            PaymentKind::CardholderReimbursement,
            amount,
            currency,
            reference_note,
            |request| {
                if request.matched_cardholder_email.is_none() {
                    return Err(RequestError::precondition(format!(
                        "request {request_id} has no matched cardholder to reimburse"
                    )));
                }
                match request.status {
                    RequestStatus::Matched | RequestStatus::Completed => Ok(()),
                    status => Err(RequestError::precondition(format!(
                        "reimbursements are recorded only for MATCHED or COMPLETED requests, {request_id} is {status}"
                    ))),
                }
            },
        )
    }

    /// Admin confirms the deposit arrived.
    pub fn confirm_buyer_deposit(&self, admin: &Actor, payment_id: &str) -> Result<Payment, RequestError> {
        require_role(admin, ActorRole::Admin, payment_id)?;
        self.confirm_payment(admin, payment_id, PaymentKind::BuyerDeposit, |_| Ok(()))
    }

    /// Matched cardholder confirms receipt of their reimbursement.
    pub fn confirm_cardholder_reimbursement(
        &self,
        cardholder: &Actor,
        payment_id: &str,
    ) -> Result<Payment, RequestError> {
        require_role(cardholder, ActorRole::Cardholder, payment_id)?;
        self.confirm_payment(
            cardholder,
            payment_id,
            PaymentKind::CardholderReimbursement,
            |request| {
                if request.is_matched_to(&cardholder.email) {
                    Ok(())
                } else {
                    Err(forbidden(cardholder, &request.id))
                }
            },
        )
    }

    pub fn payments_for_request(&self, request_id: &str) -> Result<Vec<Payment>, RequestError> {
        self.store.payments_for_request(request_id)
    }

    #[allow(clippy::too_many_arguments)]
    fn create_payment<G>(
        &self,
        actor: &Actor,
        request_id: &str,
        kind: PaymentKind,
        amount: u64,
        currency: Option<Currency>,
        reference_note: Option<&str>,
        guard: G,
    ) -> Result<Payment, RequestError>
    where
        G: Fn(&Request) -> Result<(), RequestError>,
    {
        if amount == 0 {
            return Err(ValidationError::ZeroAmount.into());
        }
        let payment_id = utils::new_uuid_to_bech32(utils::PAYMENT_HRP)?;
        let note = reference_note.map(str::trim).filter(|n| !n.is_empty());
        let stamp = self.stamp()?;

        let payment = self.store.atomically(|tx| {
            let request = tx.request(request_id)?;
            if let Err(e) = guard(&request) {
                return abort(e);
            }
            let currency = currency
                .or(request.details.product.currency)
                .unwrap_or(self.config.base_currency);
            let payment = Payment {
                id: payment_id.clone(),
                request_id: request_id.to_string(),
                kind,
                amount,
                currency,
                status: PaymentStatus::Created,
                reference_note: note.map(str::to_string),
                created_at: stamp.now.clone(),
                confirmed_at: None,
            };
            tx.put_payment(&payment)?;

            let mut entry = NewLedgerEntry::new(kind.created_event())
                .scope(Scope::Settlement)
                .money(kind.side(), amount, Some(currency))
                .reference(Reference::request(request_id))
                .buyer(request.buyer_email.clone())
                .description(format!("{} recorded {amount} {currency}", actor.role))
                .meta(json!({ "paymentId": payment.id, "note": note }));
            if let Some(cardholder) = &request.matched_cardholder_email {
                entry = entry.cardholder(cardholder.clone());
            }
            self.record(tx, &stamp, with_actor(entry, actor))?;
            Ok(payment)
        })?;

        tracing::info!(
            request_id,
            payment_id = %payment.id,
            kind = ?payment.kind,
            amount = payment.amount,
            currency = %payment.currency,
            "payment recorded"
        );
        Ok(payment)
    }

    fn confirm_payment<G>(
        &self,
        actor: &Actor,
        payment_id: &str,
        kind: PaymentKind,
        guard: G,
    ) -> Result<Payment, RequestError>
    where
        G: Fn(&Request) -> Result<(), RequestError>,
    {
        let stamp = self.stamp()?;

        let (payment, confirmed_now) = self.store.atomically(|tx| {
            let mut payment = tx.payment(payment_id)?;
            if payment.kind != kind {
                return abort(RequestError::precondition(format!(
                    "payment {payment_id} is a {:?}, not a {kind:?}",
                    payment.kind
                )));
            }
            let request = tx.request(&payment.request_id)?;
            if let Err(e) = guard(&request) {
                return abort(e);
            }
            if payment.status == PaymentStatus::Confirmed {
                return Ok((payment, false));
            }

            payment.status = PaymentStatus::Confirmed;
            payment.confirmed_at = Some(stamp.now.clone());
            tx.put_payment(&payment)?;

            let mut entry = NewLedgerEntry::new(kind.confirmed_event())
                .scope(Scope::Settlement)
                .money(kind.side(), payment.amount, Some(payment.currency))
                .reference(Reference::request(&payment.request_id))
                .buyer(request.buyer_email.clone())
                .description(format!("{} confirmed payment {payment_id}", actor.role))
                .meta(json!({ "paymentId": payment.id }));
            if let Some(cardholder) = &request.matched_cardholder_email {
                entry = entry.cardholder(cardholder.clone());
            }
            self.record(tx, &stamp, with_actor(entry, actor))?;
            Ok((payment, true))
        })?;

        if confirmed_now {
            tracing::info!(payment_id, request_id = %payment.request_id, "payment confirmed");
        } else {
            tracing::debug!(payment_id, "payment already confirmed, nothing written");
        }
        Ok(payment)
    }
}

//! Request creation, edits and status transitions
use serde_json::json;
use sled::transaction::ConflictableTransactionResult;

use super::{MarketplaceService, abort, forbidden, require_role, with_actor};
use crate::card::select_card;
use crate::error::RequestError;
use crate::ledger::{EventType, LedgerEntry, NewLedgerEntry, Reference, Scope};
use crate::request::{Request, RequestDraft, RequestStatus};
use crate::store::Tx;
use crate::transition::{self, Plan};
use crate::types::{Actor, ActorRole};
use crate::utils;

/// Result of a transition call. `entry` is `None` for an idempotent replay.
#[derive(Debug, Clone)]
pub struct Transitioned {
    pub request: Request,
    pub entry: Option<LedgerEntry>,
}

impl Transitioned {
    pub fn was_replay(&self) -> bool {
        self.entry.is_none()
    }
}

struct Move<'a> {
    actor: &'a Actor,
    request_id: &'a str,
    target: RequestStatus,
    expected: Option<RequestStatus>,
    reason: Option<&'a str>,
}

impl MarketplaceService {
    /// Submit a new buyer request. It starts in `SUBMITTED`.
    pub fn create_request(&self, buyer: &Actor, draft: &RequestDraft) -> Result<Request, RequestError> {
        require_role(buyer, ActorRole::Buyer, "(new)")?;
        let details = draft.validate_and_finalise()?;
        let request_id = utils::new_uuid_to_bech32(utils::REQUEST_HRP)?;
        let details_hash = details.digest()?;
        let stamp = self.stamp()?;

        let request = Request::new(request_id.clone(), &buyer.email, details, stamp.now.clone());

        self.store.atomically(|tx| {
            tx.put_request(&request)?;
            let entry = NewLedgerEntry::new(EventType::RequestCreated)
                .reference(Reference::request(&request.id))
                .buyer(request.buyer_email.clone())
                .description("buyer submitted request")
                .meta(json!({
                    "status": RequestStatus::Submitted.as_str(),
                    "detailsHash": details_hash,
                    "productName": request.details.product.name,
                    "price": request.details.product.price,
                }));
            self.record(tx, &stamp, entry)?;
            Ok(())
        })?;

        tracing::info!(request_id = %request.id, buyer = %request.buyer_email, "request created");
        Ok(request)
    }

    /// Replace the buyer-editable details. Only the owner, only while `SUBMITTED`.
    /// Submitting identical details writes nothing.
    pub fn update_request(
        &self,
        buyer: &Actor,
        request_id: &str,
        draft: &RequestDraft,
    ) -> Result<Request, RequestError> {
        require_role(buyer, ActorRole::Buyer, request_id)?;
        let details = draft.validate_and_finalise()?;
        let new_hash = details.digest()?;
        let stamp = self.stamp()?;

        let (request, changed) = self.store.atomically(|tx| {
            let mut request = tx.request(request_id)?;
            if !request.is_owned_by(&buyer.email) {
                return abort(forbidden(buyer, request_id));
            }
            if request.status != RequestStatus::Submitted {
                return abort(RequestError::precondition(format!(
                    "request {request_id} can only be edited while SUBMITTED, it is {}",
                    request.status
                )));
            }
            let previous_hash = match request.details.digest() {
                Ok(hash) => hash,
                Err(e) => return abort(e.into()),
            };
            if previous_hash == new_hash {
                return Ok((request, false));
            }

            request.details = details.clone();
            request.updated_at = stamp.now.clone();
            tx.put_request(&request)?;
            let entry = NewLedgerEntry::new(EventType::RequestUpdated)
                .reference(Reference::request(request_id))
                .buyer(request.buyer_email.clone())
                .description("buyer updated request details")
                .meta(json!({
                    "previousDetailsHash": previous_hash,
                    "detailsHash": new_hash,
                }));
            self.record(tx, &stamp, entry)?;
            Ok((request, true))
        })?;

        if changed {
            tracing::info!(request_id, "request details updated");
        } else {
            tracing::debug!(request_id, "request update carried identical details");
        }
        Ok(request)
    }

    /// Move a request to `target` on behalf of `actor`.
    ///
    /// Admins drive approval, rejection, completion and cancellation. `MATCHED` is
    /// only reachable through [`MarketplaceService::accept_request`], and buyers and
    /// cardholders can only cancel. `expected` is the status the caller believes the
    /// request is in; it is logged when stale but never trusted.
    pub fn transition(
        &self,
        actor: &Actor,
        request_id: &str,
        target: RequestStatus,
        expected: Option<RequestStatus>,
        reason: Option<&str>,
    ) -> Result<Transitioned, RequestError> {
        match (actor.role, target) {
            (ActorRole::Cardholder, RequestStatus::Matched) => self.accept_request(actor, request_id),
            (_, RequestStatus::Cancelled) => self.cancel(actor, request_id, expected, reason),
            (ActorRole::Admin, RequestStatus::Matched) => {
                let request = self.request(request_id)?;
                match transition::plan(request.status, target)? {
                    Plan::Replay => Ok(Transitioned {
                        request,
                        entry: None,
                    }),
                    Plan::Apply { .. } => Err(RequestError::precondition(
                        "MATCHED is reached only through cardholder acceptance",
                    )),
                }
            }
            (ActorRole::Admin, _) => self.admin_move(Move {
                actor,
                request_id,
                target,
                expected,
                reason,
            }),
            _ => Err(forbidden(actor, request_id)),
        }
    }

    pub fn approve_request(&self, admin: &Actor, request_id: &str) -> Result<Transitioned, RequestError> {
        self.admin_move(Move {
            actor: admin,
            request_id,
            target: RequestStatus::AdminApproved,
            expected: Some(RequestStatus::Submitted),
            reason: None,
        })
    }

    pub fn reject_request(
        &self,
        admin: &Actor,
        request_id: &str,
        reason: Option<&str>,
    ) -> Result<Transitioned, RequestError> {
        self.admin_move(Move {
            actor: admin,
            request_id,
            target: RequestStatus::Rejected,
            expected: None,
            reason,
        })
    }

    pub fn complete_request(&self, admin: &Actor, request_id: &str) -> Result<Transitioned, RequestError> {
        self.admin_move(Move {
            actor: admin,
            request_id,
            target: RequestStatus::Completed,
            expected: Some(RequestStatus::Matched),
            reason: None,
        })
    }

    pub fn admin_cancel_request(
        &self,
        admin: &Actor,
        request_id: &str,
        reason: Option<&str>,
    ) -> Result<Transitioned, RequestError> {
        require_role(admin, ActorRole::Admin, request_id)?;
        self.cancel(admin, request_id, None, reason)
    }

    /// Buyer withdraws their own request before it is matched.
    pub fn cancel_as_buyer(
        &self,
        buyer: &Actor,
        request_id: &str,
        reason: Option<&str>,
    ) -> Result<Transitioned, RequestError> {
        require_role(buyer, ActorRole::Buyer, request_id)?;
        self.cancel(buyer, request_id, None, reason)
    }

    /// Matched cardholder backs out of a request they accepted.
    pub fn cancel_as_cardholder(
        &self,
        cardholder: &Actor,
        request_id: &str,
        reason: Option<&str>,
    ) -> Result<Transitioned, RequestError> {
        require_role(cardholder, ActorRole::Cardholder, request_id)?;
        self.cancel(cardholder, request_id, None, reason)
    }

    fn admin_move(&self, mv: Move<'_>) -> Result<Transitioned, RequestError> {
        require_role(mv.actor, ActorRole::Admin, mv.request_id)?;
        self.run(&mv, |_| Ok(()), |_, _, _, entry| Ok(entry))
    }

    fn cancel(
        &self,
        actor: &Actor,
        request_id: &str,
        expected: Option<RequestStatus>,
        reason: Option<&str>,
    ) -> Result<Transitioned, RequestError> {
        let mv = Move {
            actor,
            request_id,
            target: RequestStatus::Cancelled,
            expected,
            reason,
        };
        let window = transition::cancel_window(actor.role);

        self.run(
            &mv,
            |request| match actor.role {
                ActorRole::Buyer if !request.is_owned_by(&actor.email) => {
                    Err(forbidden(actor, request_id))
                }
                ActorRole::Cardholder if !request.is_matched_to(&actor.email) => {
                    Err(forbidden(actor, request_id))
                }
                _ => Ok(()),
            },
            |_, from, _, entry| {
                if !window.contains(&from) {
                    return abort(RequestError::precondition(format!(
                        "{} may not cancel request {request_id} while it is {from}",
                        actor.role
                    )));
                }
                Ok(entry)
            },
        )
    }

    /// Cardholder takes an approved request, committing one of their active cards.
    pub fn accept_request(&self, cardholder: &Actor, request_id: &str) -> Result<Transitioned, RequestError> {
        require_role(cardholder, ActorRole::Cardholder, request_id)?;

        // settle not-found, replay and illegal moves before looking at cards;
        // the transaction below re-checks all of it against the committed request
        let request = self.request(request_id)?;
        if request
            .matched_cardholder_email
            .as_ref()
            .is_some_and(|email| *email != cardholder.email)
        {
            return Err(already_matched(request_id));
        }
        match transition::plan(request.status, RequestStatus::Matched)? {
            Plan::Replay => {
                tracing::debug!(request_id, "acceptance replayed, nothing written");
                return Ok(Transitioned {
                    request,
                    entry: None,
                });
            }
            Plan::Apply { .. } => {}
        }

        let cards = self.store.cards_for(&cardholder.email)?;
        let selection = select_card(&cards, &request.details.requirement).ok_or_else(|| {
            RequestError::precondition(format!(
                "cardholder {} has no active saved card",
                cardholder.email
            ))
        })?;
        let card_id = selection.card.id.clone();
        let fallback = selection.fallback;

        let mv = Move {
            actor: cardholder,
            request_id,
            target: RequestStatus::Matched,
            expected: Some(RequestStatus::AdminApproved),
            reason: None,
        };

        let outcome = self.run(
            &mv,
            |request| match &request.matched_cardholder_email {
                Some(email) if *email != cardholder.email => Err(already_matched(request_id)),
                _ => Ok(()),
            },
            |tx, _, request, entry| {
                // the card may have been deactivated since it was selected
                let card = tx.card(&card_id)?;
                if !card.active || card.cardholder_email != cardholder.email {
                    return abort(RequestError::precondition(format!(
                        "card {card_id} is no longer active"
                    )));
                }
                request.matched_cardholder_email = Some(cardholder.email.clone());
                request.matched_card_id = Some(card_id.clone());
                request.matched_at = Some(request.updated_at.clone());
                Ok(entry.meta(json!({
                    "from": RequestStatus::AdminApproved.as_str(),
                    "to": RequestStatus::Matched.as_str(),
                    "actor": ActorRole::Cardholder.as_str(),
                    "cardId": card_id,
                    "fallbackCard": fallback,
                })))
            },
        )?;

        if fallback && !outcome.was_replay() {
            tracing::warn!(request_id, card_id = %card_id, "no compatible card, accepted with fallback card");
        }
        Ok(outcome)
    }

    /// Shared transition path.
    ///
    /// `guard` runs before the replay check and rejects actors who may not touch
    /// the request at all. `apply` runs once the move is known to be legal and
    /// may refuse it, edit the updated request, or extend the ledger entry.
    fn run<G, A>(&self, mv: &Move<'_>, guard: G, apply: A) -> Result<Transitioned, RequestError>
    where
        G: Fn(&Request) -> Result<(), RequestError>,
        A: Fn(
            &Tx<'_>,
            RequestStatus,
            &mut Request,
            NewLedgerEntry,
        ) -> ConflictableTransactionResult<NewLedgerEntry, RequestError>,
    {
        let stamp = self.stamp()?;

        let (outcome, from) = self.store.atomically(|tx| {
            let current = tx.request(mv.request_id)?;
            if let Err(e) = guard(&current) {
                return abort(e);
            }
            let from = current.status;
            let (from, to) = match transition::plan(from, mv.target) {
                Ok(Plan::Replay) => {
                    return Ok((
                        Transitioned {
                            request: current,
                            entry: None,
                        },
                        from,
                    ));
                }
                Ok(Plan::Apply { from, to }) => (from, to),
                Err(e) => return abort(e),
            };

            let mut updated = current.clone();
            updated.status = to;
            updated.updated_at = stamp.now.clone();
            if to == RequestStatus::Completed {
                updated.completed_at = Some(stamp.now.clone());
            }

            let summary = format!("{} moved request from {from} to {to}", mv.actor.role);
            let description = match mv.reason {
                Some(reason) => format!("{summary}: {reason}"),
                None => summary,
            };
            let entry = NewLedgerEntry::new(transition::event_for(to))
                .scope(Scope::UserTransaction)
                .reference(Reference::request(mv.request_id))
                .buyer(current.buyer_email.clone())
                .description(description)
                .meta(json!({
                    "from": from.as_str(),
                    "to": to.as_str(),
                    "actor": mv.actor.role.as_str(),
                    "reason": mv.reason,
                }));
            let mut entry = with_actor(entry, mv.actor);
            if let Some(cardholder) = &current.matched_cardholder_email {
                entry = entry.cardholder(cardholder.clone());
            }
            let entry = apply(tx, from, &mut updated, entry)?;

            tx.put_request(&updated)?;
            let entry = self.record(tx, &stamp, entry)?;
            Ok((
                Transitioned {
                    request: updated,
                    entry: Some(entry),
                },
                from,
            ))
        })?;

        if let Some(expected) = mv.expected.filter(|e| *e != from && *e != mv.target) {
            tracing::warn!(
                request_id = mv.request_id,
                expected = %expected,
                actual = %from,
                "caller expected a different status"
            );
        }
        match &outcome.entry {
            None => tracing::debug!(
                request_id = mv.request_id,
                status = %mv.target,
                "transition replayed, nothing written"
            ),
            Some(entry) => tracing::info!(
                request_id = mv.request_id,
                from = %from,
                to = %mv.target,
                actor = %mv.actor.email,
                entry_id = %entry.id,
                "request transitioned"
            ),
        }
        Ok(outcome)
    }
}

fn already_matched(request_id: &str) -> RequestError {
    RequestError::precondition(format!(
        "request {request_id} is already matched to another cardholder"
    ))
}

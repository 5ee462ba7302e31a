//! Saved card registration and verification status
use super::{MarketplaceService, abort, require_role};
use crate::card::{CardDraft, SavedCard, Verification};
use crate::error::RequestError;
use crate::types::{Actor, ActorRole, TimeStamp};
use crate::utils;

impl MarketplaceService {
    pub fn register_card(&self, cardholder: &Actor, draft: &CardDraft) -> Result<SavedCard, RequestError> {
        require_role(cardholder, ActorRole::Cardholder, "(card)")?;
        draft.validate()?;

        let card = SavedCard {
            id: utils::new_uuid_to_bech32(utils::CARD_HRP)?,
            cardholder_email: cardholder.email.clone(),
            issuer: draft.issuer.clone(),
            network: draft.network.clone(),
            label: draft.label.clone(),
            last4: draft.last4.clone(),
            active: true,
            verification: Verification::Unverified,
            created_at: TimeStamp::new(),
        };
        self.store.atomically(|tx| tx.put_card(&card))?;

        tracing::info!(card_id = %card.id, cardholder = %card.cardholder_email, "card registered");
        Ok(card)
    }

    pub fn deactivate_card(&self, cardholder: &Actor, card_id: &str) -> Result<SavedCard, RequestError> {
        require_role(cardholder, ActorRole::Cardholder, card_id)?;

        let card = self.store.atomically(|tx| {
            let mut card = tx.card(card_id)?;
            if card.cardholder_email != cardholder.email {
                return abort(RequestError::Forbidden {
                    role: cardholder.role,
                    email: cardholder.email.clone(),
                    request_id: card_id.to_string(),
                });
            }
            if card.active {
                card.active = false;
                tx.put_card(&card)?;
            }
            Ok(card)
        })?;

        tracing::info!(card_id, "card deactivated");
        Ok(card)
    }

    /// Store the pass/fail signal from the external card verification service.
    /// A failed verification also takes the card out of matching.
    pub fn record_card_verification(&self, card_id: &str, passed: bool) -> Result<SavedCard, RequestError> {
        let card = self.store.atomically(|tx| {
            let mut card = tx.card(card_id)?;
            card.verification = if passed {
                Verification::Passed
            } else {
                Verification::Failed
            };
            if !passed {
                card.active = false;
            }
            tx.put_card(&card)?;
            Ok(card)
        })?;

        if passed {
            tracing::info!(card_id, "card verification passed");
        } else {
            tracing::warn!(card_id, "card verification failed, card deactivated");
        }
        Ok(card)
    }

    /// Cards held by `cardholder_email`, oldest first.
    pub fn cards_for(&self, cardholder_email: &str) -> Result<Vec<SavedCard>, RequestError> {
        let mut cards = self
            .store
            .cards_for(&crate::types::normalize_email(cardholder_email))?;
        cards.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(cards)
    }
}

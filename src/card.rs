//! Cardholders' saved payment instruments and request compatibility
use chrono::Utc;
use serde::Serialize;

use super::error::ValidationError;
use super::request::CardRequirement;
use super::types::TimeStamp;

/// Outcome reported by the external BIN/PAN verification collaborator.
#[derive(
    minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, Copy, Default, Eq, PartialEq,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verification {
    #[default]
    #[n(0)]
    Unverified,
    #[n(1)]
    Passed,
    #[n(2)]
    Failed,
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SavedCard {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub cardholder_email: String,
    #[n(2)]
    pub issuer: Option<String>,
    #[n(3)]
    pub network: Option<String>,
    #[n(4)]
    pub label: Option<String>,
    #[n(5)]
    pub last4: Option<String>,
    #[n(6)]
    pub active: bool,
    #[n(7)]
    pub verification: Verification,
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
}

impl SavedCard {
    /// A card field left unset is a wildcard; so is an unset requirement field.
    pub fn is_compatible_with(&self, requirement: &CardRequirement) -> bool {
        field_matches(requirement.issuer.as_deref(), self.issuer.as_deref())
            && field_matches(requirement.network.as_deref(), self.network.as_deref())
            && field_matches(requirement.label.as_deref(), self.label.as_deref())
    }
}

fn field_matches(wanted: Option<&str>, held: Option<&str>) -> bool {
    match (wanted, held) {
        (Some(wanted), Some(held)) => wanted == held,
        _ => true,
    }
}

/// Card chosen for an acceptance, and whether it actually satisfied the requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardSelection<'a> {
    pub card: &'a SavedCard,
    pub fallback: bool,
}

/// Picks the oldest active compatible card, else the oldest active card.
/// `cards` may arrive in any order.
pub fn select_card<'a>(
    cards: &'a [SavedCard],
    requirement: &CardRequirement,
) -> Option<CardSelection<'a>> {
    let mut active: Vec<&SavedCard> = cards.iter().filter(|c| c.active).collect();
    active.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    if let Some(card) = active.iter().copied().find(|c| c.is_compatible_with(requirement)) {
        return Some(CardSelection {
            card,
            fallback: false,
        });
    }
    active.first().copied().map(|card| CardSelection {
        card,
        fallback: true,
    })
}

/// Registration input for a new saved card.
#[derive(Debug, Clone, Default)]
pub struct CardDraft {
    pub issuer: Option<String>,
    pub network: Option<String>,
    pub label: Option<String>,
    pub last4: Option<String>,
}

impl CardDraft {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn issuer(mut self, issuer: &str) -> Self {
        self.issuer = Some(issuer.trim().to_string()).filter(|s| !s.is_empty());
        self
    }
    pub fn network(mut self, network: &str) -> Self {
        self.network = Some(network.trim().to_string()).filter(|s| !s.is_empty());
        self
    }
    pub fn label(mut self, label: &str) -> Self {
        self.label = Some(label.trim().to_string()).filter(|s| !s.is_empty());
        self
    }
    pub fn last4(mut self, last4: &str) -> Self {
        self.last4 = Some(last4.trim().to_string()).filter(|s| !s.is_empty());
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(last4) = &self.last4 {
            if last4.len() != 4 || !last4.chars().all(|c| c.is_ascii_digit()) {
                return Err(ValidationError::InvalidLast4(last4.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(id: &str, issuer: Option<&str>, network: Option<&str>, label: Option<&str>, sec: u32) -> SavedCard {
        SavedCard {
            id: id.into(),
            cardholder_email: "c@x.io".into(),
            issuer: issuer.map(Into::into),
            network: network.map(Into::into),
            label: label.map(Into::into),
            last4: None,
            active: true,
            verification: Verification::Unverified,
            created_at: TimeStamp::new_with(2024, 1, 1, 0, 0, sec),
        }
    }

    fn hdfc_diners() -> CardRequirement {
        CardRequirement {
            issuer: Some("HDFC".into()),
            network: Some("VISA".into()),
            label: Some("Diners Black".into()),
        }
    }

    #[test]
    fn null_card_fields_are_wildcards() {
        let wildcard = card("a", None, Some("VISA"), None, 0);
        assert!(wildcard.is_compatible_with(&hdfc_diners()));
    }

    #[test]
    fn explicit_mismatch_is_rejected() {
        let sbi = card("a", Some("SBI"), Some("VISA"), None, 0);
        assert!(!sbi.is_compatible_with(&hdfc_diners()));
    }

    #[test]
    fn unset_requirement_accepts_anything() {
        let sbi = card("a", Some("SBI"), Some("RUPAY"), Some("Prime"), 0);
        assert!(sbi.is_compatible_with(&CardRequirement::default()));
    }

    #[test]
    fn selects_oldest_compatible_then_falls_back() {
        let cards = vec![
            card("newer", Some("HDFC"), Some("VISA"), None, 5),
            card("older-sbi", Some("SBI"), None, None, 1),
            card("older-hdfc", Some("HDFC"), None, None, 2),
        ];
        let chosen = select_card(&cards, &hdfc_diners()).unwrap();
        assert_eq!(chosen.card.id, "older-hdfc");
        assert!(!chosen.fallback);

        let only_sbi = vec![card("sbi", Some("SBI"), None, None, 3)];
        let chosen = select_card(&only_sbi, &hdfc_diners()).unwrap();
        assert_eq!(chosen.card.id, "sbi");
        assert!(chosen.fallback);
    }

    #[test]
    fn inactive_cards_are_ignored() {
        let mut inactive = card("gone", None, None, None, 0);
        inactive.active = false;
        assert!(select_card(&[inactive], &CardRequirement::default()).is_none());
    }
}

//! Request lifecycle state machine and append-only audit ledger for a
//! card-offer marketplace.
//!
//! Buyers submit requests for purchases that need a card they do not hold,
//! admins approve them, cardholders accept them with a saved card, and admins
//! settle and complete them. Every change is written together with exactly one
//! [`ledger::LedgerEntry`].

pub mod api;
pub mod card;
pub mod config;
pub mod error;
pub mod ledger;
pub mod payment;
pub mod proof;
pub mod request;
pub mod service;
pub mod store;
pub mod transition;
pub mod types;
pub mod utils;

//! Service layer API for request workflow operations
//!
//! Each mutating operation validates, then writes the entity and its ledger
//! entry inside one [`Store::atomically`] call. Ids, timestamps and ledger
//! sequence numbers are generated before the transaction starts because the
//! closure may run more than once.
use std::sync::Arc;

use chrono::Utc;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult};

use super::config::Config;
use super::error::RequestError;
use super::ledger::{LedgerEntry, LedgerFilter, NewLedgerEntry, Order};
use super::request::Request;
use super::store::{Store, Tx};
use super::types::{Actor, ActorRole, TimeStamp};
use super::utils;

mod cards;
mod lifecycle;
mod payments;
mod uploads;

pub use lifecycle::Transitioned;

pub struct MarketplaceService {
    instance: Arc<sled::Db>,
    store: Store,
    config: Config,
}

/// Identity of the ledger entry an operation may write, fixed before the transaction.
#[derive(Debug, Clone)]
struct Stamp {
    entry_id: String,
    seq: u64,
    now: TimeStamp<Utc>,
}

impl MarketplaceService {
    pub fn new(instance: Arc<sled::Db>, config: Config) -> Result<Self, RequestError> {
        let store = Store::open(&instance)?;
        Ok(Self {
            instance,
            store,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), RequestError> {
        self.instance.flush()?;
        Ok(())
    }

    fn stamp(&self) -> Result<Stamp, RequestError> {
        Ok(Stamp {
            entry_id: utils::new_uuid_to_bech32(utils::LEDGER_HRP)?,
            seq: self.store.next_seq()?,
            now: TimeStamp::new(),
        })
    }

    /// Assemble and append one ledger entry inside the caller's transaction.
    fn record(
        &self,
        tx: &Tx<'_>,
        stamp: &Stamp,
        input: NewLedgerEntry,
    ) -> ConflictableTransactionResult<LedgerEntry, RequestError> {
        let entry = input
            .finalise(&self.config, stamp.entry_id.clone(), stamp.seq, stamp.now.clone())
            .map_err(|e| ConflictableTransactionError::Abort(e.into()))?;
        tx.append_ledger(&entry)?;
        Ok(entry)
    }

    pub fn request(&self, request_id: &str) -> Result<Request, RequestError> {
        self.store
            .get_request(request_id)?
            .ok_or_else(|| RequestError::NotFound(request_id.to_string()))
    }

    /// Timeline for a request, including entries recorded against its proof uploads.
    pub fn ledger_for_request(
        &self,
        request_id: &str,
        order: Order,
    ) -> Result<Vec<LedgerEntry>, RequestError> {
        self.store.ledger_for_request(request_id, order)
    }

    pub fn ledger_for_account(
        &self,
        account_key: &str,
        order: Order,
    ) -> Result<Vec<LedgerEntry>, RequestError> {
        self.store.ledger_for_account(account_key, order)
    }

    pub fn ledger_entry(&self, entry_id: &str) -> Result<LedgerEntry, RequestError> {
        self.store
            .ledger_entry(entry_id)?
            .ok_or_else(|| RequestError::EntityNotFound {
                entity: "ledger entry",
                id: entry_id.to_string(),
            })
    }

    /// Latest-first ledger browser, capped at the configured page size.
    pub fn browse_ledger(&self, filter: &LedgerFilter) -> Result<Vec<LedgerEntry>, RequestError> {
        let limit = self.config.page_size(filter.limit);
        let entries = self.store.browse_ledger(filter, limit)?;
        tracing::debug!(
            event_type = ?filter.event_type,
            request_id = ?filter.request_id,
            count = entries.len(),
            "ledger browse"
        );
        Ok(entries)
    }
}

fn abort<T>(err: RequestError) -> ConflictableTransactionResult<T, RequestError> {
    Err(ConflictableTransactionError::Abort(err))
}

fn require_role(actor: &Actor, role: ActorRole, request_id: &str) -> Result<(), RequestError> {
    if actor.role != role {
        return Err(forbidden(actor, request_id));
    }
    Ok(())
}

fn forbidden(actor: &Actor, request_id: &str) -> RequestError {
    RequestError::Forbidden {
        role: actor.role,
        email: actor.email.clone(),
        request_id: request_id.to_string(),
    }
}

/// Puts the acting identity on the entry in the column matching its role.
fn with_actor(entry: NewLedgerEntry, actor: &Actor) -> NewLedgerEntry {
    match actor.role {
        ActorRole::Buyer => entry.buyer(actor.email.clone()),
        ActorRole::Cardholder => entry.cardholder(actor.email.clone()),
        ActorRole::Admin => entry.admin(actor.email.clone()),
    }
}

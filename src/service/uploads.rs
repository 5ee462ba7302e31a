//! Proof-of-purchase uploads
use serde_json::json;

use super::{MarketplaceService, abort, forbidden};
use crate::error::{RequestError, ValidationError};
use crate::ledger::{NewLedgerEntry, Reference};
use crate::proof::{ProofKind, ProofUpload};
use crate::request::RequestStatus;
use crate::types::{Actor, ActorRole};
use crate::utils;

impl MarketplaceService {
    /// Attach an already stored file to a request.
    ///
    /// Buyers upload checkout and product screenshots while the request is
    /// unmatched; the matched cardholder uploads the invoice and card
    /// transaction proof while it is `MATCHED`. A later upload of the same kind
    /// replaces the request's URL slot but keeps the earlier upload record.
    pub fn upload_proof(
        &self,
        uploader: &Actor,
        request_id: &str,
        kind: ProofKind,
        url: &str,
    ) -> Result<ProofUpload, RequestError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(ValidationError::EmptyField("proof url").into());
        }
        if uploader.role != kind.uploader_role() {
            return Err(forbidden(uploader, request_id));
        }

        let stamp = self.stamp()?;
        let proof = ProofUpload {
            id: utils::new_uuid_to_bech32(utils::PROOF_HRP)?,
            request_id: request_id.to_string(),
            uploader_email: uploader.email.clone(),
            uploader_role: uploader.role,
            kind,
            url: url.to_string(),
            created_at: stamp.now.clone(),
        };

        self.store.atomically(|tx| {
            let mut request = tx.request(request_id)?;
            let allowed = match uploader.role {
                ActorRole::Buyer => {
                    if !request.is_owned_by(&uploader.email) {
                        return abort(forbidden(uploader, request_id));
                    }
                    matches!(
                        request.status,
                        RequestStatus::Submitted | RequestStatus::AdminApproved
                    )
                }
                ActorRole::Cardholder => {
                    if !request.is_matched_to(&uploader.email) {
                        return abort(forbidden(uploader, request_id));
                    }
                    request.status == RequestStatus::Matched
                }
                ActorRole::Admin => false,
            };
            if !allowed {
                return abort(RequestError::precondition(format!(
                    "{} proof cannot be uploaded while request {request_id} is {}",
                    kind, request.status
                )));
            }

            tx.put_proof(&proof)?;
            request.proofs.set(kind, proof.url.clone());
            request.updated_at = stamp.now.clone();
            tx.put_request(&request)?;

            let mut entry = NewLedgerEntry::new(kind.event_type())
                .reference(Reference::proof_upload(&proof.id, request_id))
                .buyer(request.buyer_email.clone())
                .description(format!("{} uploaded {}", uploader.role, kind))
                .meta(json!({ "kind": kind.as_str(), "url": proof.url }));
            if let Some(cardholder) = &request.matched_cardholder_email {
                entry = entry.cardholder(cardholder.clone());
            }
            self.record(tx, &stamp, entry)?;
            Ok(())
        })?;

        tracing::info!(
            request_id,
            proof_id = %proof.id,
            kind = %kind,
            uploader = %uploader.email,
            "proof uploaded"
        );
        Ok(proof)
    }

    pub fn proofs_for_request(&self, request_id: &str) -> Result<Vec<ProofUpload>, RequestError> {
        self.store.proofs_for_request(request_id)
    }
}

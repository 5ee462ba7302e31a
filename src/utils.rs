//! Id generation and small encoding helpers

use bech32::Bech32m;
use uuid7::uuid7;

pub const REQUEST_HRP: &str = "req";
pub const LEDGER_HRP: &str = "led";
pub const PROOF_HRP: &str = "prf";
pub const PAYMENT_HRP: &str = "pay";
pub const CARD_HRP: &str = "card";

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// SHA-256 digest of the CBOR encoding of `value`, used to fingerprint request details.
pub fn cbor_digest<T: minicbor::Encode<()>>(value: &T) -> anyhow::Result<String> {
    let contents = minicbor::to_vec(value)?;
    Ok(sha256::digest(&contents))
}

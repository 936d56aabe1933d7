use sha2::{Digest, Sha256};

use crate::envelope::Envelope;
use crate::error::BrokerError;
use crate::types::RunId;

/// Derive the run id of a call envelope.
///
/// The id is the SHA-256 digest of the encoded envelope with its `actid`
/// blanked, so the id can be written back into the envelope afterwards and the
/// same logical call always yields the same id.
pub fn run_id_for(envelope: &Envelope) -> Result<RunId, BrokerError> {
    let mut keyed = envelope.clone();
    keyed.actid = crate::envelope::PLACEHOLDER.to_string();
    let bytes = keyed.encode()?;
    Ok(RunId::from_digest(&Sha256::digest(&bytes)))
}

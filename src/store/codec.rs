//! Value codec between stored bytes and the object model

use crate::types::Object;
use crate::Result;

/// Opaque byte <-> object codec used by the primary store
pub trait ValueCodec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<Object>;

    fn encode(&self, object: &Object) -> Result<Vec<u8>>;
}

/// JSON codec (default)
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl ValueCodec for JsonCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Object> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn encode(&self, object: &Object) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(object)?)
    }
}

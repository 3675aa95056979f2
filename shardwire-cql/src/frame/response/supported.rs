use crate::errors::CqlResponseKind;
use crate::frame::frame_errors::ResponseParseError;
use crate::frame::types;
use std::collections::HashMap;

/// Options the server supports, as listed in a SUPPORTED response.
#[derive(Debug)]
pub struct Supported {
    pub options: HashMap<String, Vec<String>>,
}

impl Supported {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ResponseParseError> {
        let options = types::read_string_multimap(buf)
            .map_err(|err| ResponseParseError::malformed(CqlResponseKind::Supported, err))?;

        Ok(Supported { options })
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), std::num::TryFromIntError> {
        types::write_string_multimap(&self.options, buf)
    }
}

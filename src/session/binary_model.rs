//! Binary model file format
//!
//! ```text
//! [0, 4096)        header string "SHL binary model v<N>", zero padded
//! u64 LE + bytes   JSON section: config, input/output descriptors and ids
//! u64 LE + bytes   backend blob (may be empty)
//! ```
//!
//! Tensor descriptors in the JSON section never carry data.

use super::config::SessionConfig;
use super::TensorId;
use crate::error::{ShlError, ShlResult};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

pub const HEADER_SIZE: usize = 4096;
pub const FORMAT_VERSION: u32 = 2;
const MAGIC: &str = "SHL binary model";

/// Session description stored after the header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    pub version: u32,
    pub config: SessionConfig,
    pub inputs: Vec<Tensor>,
    pub outputs: Vec<Tensor>,
    pub input_ids: Vec<TensorId>,
    pub output_ids: Vec<TensorId>,
}

/// A decoded binary model
#[derive(Debug, Clone)]
pub struct BinaryModel {
    pub section: ModelSection,
    pub blob: Vec<u8>,
}

impl BinaryModel {
    pub fn encode(&self) -> ShlResult<Vec<u8>> {
        let json = serde_json::to_vec(&self.section)?;
        let mut out = Vec::with_capacity(HEADER_SIZE + 16 + json.len() + self.blob.len());

        let header = format!("{} v{}\n", MAGIC, self.section.version);
        out.extend_from_slice(header.as_bytes());
        out.resize(HEADER_SIZE, 0);

        out.extend_from_slice(&(json.len() as u64).to_le_bytes());
        out.extend_from_slice(&json);
        out.extend_from_slice(&(self.blob.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.blob);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> ShlResult<BinaryModel> {
        if bytes.len() < HEADER_SIZE {
            return Err(ShlError::InvalidModelFile(format!(
                "{} bytes is shorter than the header",
                bytes.len()
            )));
        }
        if !bytes.starts_with(MAGIC.as_bytes()) {
            return Err(ShlError::InvalidModelFile("missing model header".to_string()));
        }

        let mut pos = HEADER_SIZE;
        let json = read_section(bytes, &mut pos, "model section")?;
        let section: ModelSection = serde_json::from_slice(json)
            .map_err(|e| ShlError::InvalidModelFile(format!("model section: {}", e)))?;
        if section.version > FORMAT_VERSION {
            return Err(ShlError::InvalidModelFile(format!(
                "format version {} is newer than {}",
                section.version, FORMAT_VERSION
            )));
        }
        if section.inputs.len() != section.input_ids.len()
            || section.outputs.len() != section.output_ids.len()
        {
            return Err(ShlError::InvalidModelFile(
                "descriptor and id counts differ".to_string(),
            ));
        }
        let blob = read_section(bytes, &mut pos, "backend blob")?.to_vec();
        Ok(BinaryModel { section, blob })
    }
}

fn read_section<'a>(bytes: &'a [u8], pos: &mut usize, what: &str) -> ShlResult<&'a [u8]> {
    let truncated = || ShlError::InvalidModelFile(format!("{} is truncated", what));
    let len_bytes: [u8; 8] = bytes
        .get(*pos..*pos + 8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(truncated)?;
    let len = usize::try_from(u64::from_le_bytes(len_bytes)).map_err(|_| truncated())?;
    let start = *pos + 8;
    let end = start.checked_add(len).ok_or_else(truncated)?;
    let data = bytes.get(start..end).ok_or_else(truncated)?;
    *pos = end;
    Ok(data)
}

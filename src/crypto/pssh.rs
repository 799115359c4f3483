//! Protection System Specific Header construction and parsing.
//!
//! Generated systems: common system (v1 box listing the key ids), Widevine
//! (v0 box with a protobuf payload), and PlayReady (v0 box carrying a
//! version 4.0.0.0 WRM header). FairPlay and Marlin carry no generatable
//! init data; records for them must come from the key source.

use crate::aes::AesError;
use ::aes::Aes128;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use common::{KeySystemInfo, ProtectionSystem};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PsshError {
    #[error("truncated pssh box at offset {0}")]
    Truncated(usize),

    #[error("box is not a pssh box")]
    NotPssh,

    #[error("aes: {0}")]
    Aes(#[from] AesError),
}

/// Builder for one 'pssh' box.
pub struct PsshBoxBuilder {
    version: u8,
    system_id: [u8; 16],
    key_ids: Vec<Vec<u8>>,
    data: Vec<u8>,
}

impl PsshBoxBuilder {
    /// Version 0 box: opaque system data only.
    #[must_use]
    pub fn v0(system_id: [u8; 16], data: Vec<u8>) -> Self {
        Self {
            version: 0,
            system_id,
            key_ids: Vec::new(),
            data,
        }
    }

    /// Version 1 box: key ids in the box header.
    #[must_use]
    pub fn v1(system_id: [u8; 16], key_ids: Vec<Vec<u8>>) -> Self {
        Self {
            version: 1,
            system_id,
            key_ids,
            data: Vec::new(),
        }
    }

    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(self.version);
        body.extend_from_slice(&[0, 0, 0]); // Flags.
        body.extend_from_slice(&self.system_id);
        if self.version > 0 {
            body.extend_from_slice(&u32_be(self.key_ids.len()));
            for key_id in &self.key_ids {
                body.extend_from_slice(key_id);
            }
        }
        body.extend_from_slice(&u32_be(self.data.len()));
        body.extend_from_slice(&self.data);

        let mut out = Vec::with_capacity(body.len() + 8);
        out.extend_from_slice(&u32_be(body.len() + 8));
        out.extend_from_slice(b"pssh");
        out.extend_from_slice(&body);
        out
    }
}

/// Split a blob of concatenated 'pssh' boxes into per-system records. An
/// empty input yields an empty list.
pub fn parse_concatenated_boxes(data: &[u8]) -> Result<Vec<KeySystemInfo>, PsshError> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        if pos + 8 > data.len() {
            return Err(PsshError::Truncated(pos));
        }
        let size = usize::try_from(u32::from_be_bytes(
            data[pos..pos + 4].try_into().expect("4 bytes"),
        ))
        .expect("u32 fits usize");
        if &data[pos + 4..pos + 8] != b"pssh" {
            return Err(PsshError::NotPssh);
        }
        // Header, full box header, system id.
        if size < 8 + 4 + 16 || pos + size > data.len() {
            return Err(PsshError::Truncated(pos));
        }
        let mut system_id = [0; 16];
        system_id.copy_from_slice(&data[pos + 12..pos + 28]);
        out.push(KeySystemInfo {
            system_id,
            pssh_box: data[pos..pos + size].to_vec(),
        });
        pos += size;
    }
    Ok(out)
}

/// Synthesize init data for the requested systems from the key pair.
pub fn generate_key_system_info(
    systems: &[ProtectionSystem],
    key_id: &[u8],
    key: &[u8],
) -> Result<Vec<KeySystemInfo>, PsshError> {
    let mut out = Vec::new();
    for system in systems {
        let pssh_box = match system {
            ProtectionSystem::CommonSystem => {
                PsshBoxBuilder::v1(system.system_id(), vec![key_id.to_vec()]).build()
            }
            ProtectionSystem::Widevine => {
                PsshBoxBuilder::v0(system.system_id(), widevine_pssh_data(key_id)).build()
            }
            ProtectionSystem::PlayReady => {
                PsshBoxBuilder::v0(system.system_id(), playready_object(key_id, key)?).build()
            }
            // No generatable init data.
            ProtectionSystem::FairPlay | ProtectionSystem::Marlin => continue,
        };
        out.push(KeySystemInfo {
            system_id: system.system_id(),
            pssh_box,
        });
    }
    Ok(out)
}

// WidevinePsshData protobuf: field 1 algorithm (AESCTR = 1), field 2
// repeated key_id.
fn widevine_pssh_data(key_id: &[u8]) -> Vec<u8> {
    let mut data = vec![0x08, 0x01];
    data.push(0x12);
    data.push(u8::try_from(key_id.len()).expect("key id fits one byte"));
    data.extend_from_slice(key_id);
    data
}

// PlayReady Object: little-endian length and record framing around a WRM
// header v4.0.0.0 in UTF-16LE.
fn playready_object(key_id: &[u8], key: &[u8]) -> Result<Vec<u8>, PsshError> {
    let xml = format!(
        "<WRMHEADER xmlns=\"http://schemas.microsoft.com/DRM/2007/03/PlayReadyHeader\" \
         version=\"4.0.0.0\"><DATA><PROTECTINFO><KEYLEN>16</KEYLEN>\
         <ALGID>AESCTR</ALGID></PROTECTINFO><KID>{}</KID><CHECKSUM>{}</CHECKSUM>\
         </DATA></WRMHEADER>",
        BASE64.encode(guid_little_endian(key_id)),
        playready_checksum(key_id, key)?,
    );
    let mut record: Vec<u8> = Vec::new();
    for unit in xml.encode_utf16() {
        record.extend_from_slice(&unit.to_le_bytes());
    }

    let record_len = u16::try_from(record.len()).expect("wrm header fits u16");
    let total = u32::try_from(record.len() + 10).expect("object fits u32");
    let mut out = Vec::with_capacity(record.len() + 10);
    out.extend_from_slice(&total.to_le_bytes());
    out.extend_from_slice(&1_u16.to_le_bytes()); // Record count.
    out.extend_from_slice(&1_u16.to_le_bytes()); // Record type: WRM header.
    out.extend_from_slice(&record_len.to_le_bytes());
    out.extend(record);
    Ok(out)
}

// First 8 bytes of AES-128-ECB(key, kid in GUID byte order), base64.
fn playready_checksum(key_id: &[u8], key: &[u8]) -> Result<String, PsshError> {
    if key.len() != 16 {
        return Err(PsshError::Aes(AesError::UnsupportedKeySize(key.len())));
    }
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut block = [0; 16];
    block.copy_from_slice(&guid_little_endian(key_id));
    cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
    Ok(BASE64.encode(&block[..8]))
}

// A PlayReady KID is the key id reinterpreted as a little-endian GUID.
fn guid_little_endian(key_id: &[u8]) -> [u8; 16] {
    let mut out = [0; 16];
    out.copy_from_slice(key_id);
    out[..4].reverse();
    out[4..6].reverse();
    out[6..8].reverse();
    out
}

fn u32_be(v: usize) -> [u8; 4] {
    u32::try_from(v).expect("size fits u32").to_be_bytes()
}

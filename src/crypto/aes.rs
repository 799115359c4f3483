//! AES-CTR and AES-CBC with the ISO/IEC 23001-7 IV rules. The block core is
//! the RustCrypto `aes` crate; counter management, chaining, ciphertext
//! stealing and pattern application follow the CENC spec and cannot be
//! expressed through a stock stream-cipher API:
//!
//!  - the CTR block counter is the low 64 bits of the counter block and
//!    wraps without carrying into the IV half,
//!  - `update_iv` advances an 8-byte IV by one and a 16-byte IV by the
//!    number of blocks consumed since the last reset,
//!  - `block_offset` exposes mid-block progress so subsample spans continue
//!    the same key stream.

use ::aes::{Aes128, Aes192, Aes256};
use cipher::{
    generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit,
};
use common::{ProtectionScheme, AES_BLOCK_SIZE};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AesError {
    #[error("unsupported key size: {0}")]
    UnsupportedKeySize(usize),

    #[error("unsupported iv size: {0}")]
    UnsupportedIvSize(usize),

    #[error("input must be at least one block, got {0} bytes")]
    InputTooSmall(usize),

    #[error("input must be a multiple of the block size, got {0} bytes")]
    NotBlockAligned(usize),

    #[error("invalid pkcs5 padding")]
    InvalidPadding,
}

enum AesKey {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl AesKey {
    fn new(key: &[u8]) -> Result<Self, AesError> {
        match key.len() {
            16 => Ok(AesKey::Aes128(Aes128::new(GenericArray::from_slice(key)))),
            24 => Ok(AesKey::Aes192(Aes192::new(GenericArray::from_slice(key)))),
            32 => Ok(AesKey::Aes256(Aes256::new(GenericArray::from_slice(key)))),
            n => Err(AesError::UnsupportedKeySize(n)),
        }
    }

    fn encrypt_block(&self, block: &mut [u8; AES_BLOCK_SIZE]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            AesKey::Aes128(c) => c.encrypt_block(block),
            AesKey::Aes192(c) => c.encrypt_block(block),
            AesKey::Aes256(c) => c.encrypt_block(block),
        }
    }

    fn decrypt_block(&self, block: &mut [u8; AES_BLOCK_SIZE]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            AesKey::Aes128(c) => c.decrypt_block(block),
            AesKey::Aes192(c) => c.decrypt_block(block),
            AesKey::Aes256(c) => c.decrypt_block(block),
        }
    }
}

/// Generate a random iv of the size the protection scheme calls for: 8
/// bytes for 'cenc', 16 bytes otherwise.
#[must_use]
pub fn iv_size_for_scheme(scheme: ProtectionScheme) -> usize {
    match scheme {
        ProtectionScheme::Cenc => 8,
        _ => AES_BLOCK_SIZE,
    }
}

/// AES-CTR. Encryption and decryption are the same operation.
pub struct AesCtrCryptor {
    key: AesKey,
    iv: Vec<u8>,
    counter: [u8; AES_BLOCK_SIZE],
    key_stream: [u8; AES_BLOCK_SIZE],
    // Bytes consumed into the current key stream block.
    block_offset: usize,
    // Blocks started since the last set_iv/update_iv.
    blocks_consumed: u64,
}

impl AesCtrCryptor {
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self, AesError> {
        let mut cryptor = Self {
            key: AesKey::new(key)?,
            iv: Vec::new(),
            counter: [0; AES_BLOCK_SIZE],
            key_stream: [0; AES_BLOCK_SIZE],
            block_offset: 0,
            blocks_consumed: 0,
        };
        cryptor.set_iv(iv)?;
        Ok(cryptor)
    }

    /// Reset to a new iv. Accepts 8 or 16 bytes per the CENC spec; an 8-byte
    /// iv occupies the high half of the counter block.
    pub fn set_iv(&mut self, iv: &[u8]) -> Result<(), AesError> {
        if iv.len() != 8 && iv.len() != AES_BLOCK_SIZE {
            return Err(AesError::UnsupportedIvSize(iv.len()));
        }
        self.iv = iv.to_vec();
        self.counter = [0; AES_BLOCK_SIZE];
        self.counter[..iv.len()].copy_from_slice(iv);
        self.block_offset = 0;
        self.blocks_consumed = 0;
        Ok(())
    }

    #[must_use]
    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    /// Bytes consumed into the current key stream block.
    #[must_use]
    pub fn block_offset(&self) -> usize {
        self.block_offset
    }

    /// Advance the iv for the next sample: an 8-byte iv increments by one, a
    /// 16-byte iv advances by the number of blocks consumed since the last
    /// reset. Resets the counter and block offset.
    pub fn update_iv(&mut self) {
        if self.iv.len() == 8 {
            let v = u64::from_be_bytes(self.iv[..8].try_into().expect("iv is 8 bytes"));
            self.iv = v.wrapping_add(1).to_be_bytes().to_vec();
        } else {
            let v = u128::from_be_bytes(self.iv[..].try_into().expect("iv is 16 bytes"));
            self.iv = v
                .wrapping_add(u128::from(self.blocks_consumed))
                .to_be_bytes()
                .to_vec();
        }
        let iv = self.iv.clone();
        self.set_iv(&iv).expect("iv size already validated");
    }

    /// XOR the key stream over `input`, appending the result to `output`.
    /// Continues mid-block across calls.
    pub fn crypt(&mut self, input: &[u8], output: &mut Vec<u8>) {
        output.reserve(input.len());
        for &byte in input {
            if self.block_offset == 0 {
                self.key_stream = self.counter;
                self.key.encrypt_block(&mut self.key_stream);
                self.increment_counter();
                self.blocks_consumed += 1;
            }
            output.push(byte ^ self.key_stream[self.block_offset]);
            self.block_offset = (self.block_offset + 1) % AES_BLOCK_SIZE;
        }
    }

    /// In-place variant of [`Self::crypt`].
    pub fn crypt_in_place(&mut self, data: &mut [u8]) {
        for byte in data {
            if self.block_offset == 0 {
                self.key_stream = self.counter;
                self.key.encrypt_block(&mut self.key_stream);
                self.increment_counter();
                self.blocks_consumed += 1;
            }
            *byte ^= self.key_stream[self.block_offset];
            self.block_offset = (self.block_offset + 1) % AES_BLOCK_SIZE;
        }
    }

    // The block counter is the low 64 bits of the counter block and wraps
    // without carrying into the high half.
    fn increment_counter(&mut self) {
        let low = u64::from_be_bytes(self.counter[8..].try_into().expect("8 bytes"));
        self.counter[8..].copy_from_slice(&low.wrapping_add(1).to_be_bytes());
    }
}

/// Padding mode for CBC.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CbcPadding {
    /// Trailing bytes short of a block are passed through in the clear.
    None,
    Pkcs5,
    /// CBC-CS, swapped final blocks. Input must be at least one block.
    CipherTextStealing,
}

/// Chaining behavior across `crypt` calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CbcIvRule {
    /// Every `crypt` call restarts from the initial iv.
    UseConstantIv,
    /// The chain continues across calls; `update_iv` promotes the last
    /// cipher block to be the next iv.
    DontUseConstantIv,
}

pub struct AesCbcEncryptor {
    key: AesKey,
    padding: CbcPadding,
    iv_rule: CbcIvRule,
    iv: [u8; AES_BLOCK_SIZE],
    chain: [u8; AES_BLOCK_SIZE],
}

impl AesCbcEncryptor {
    pub fn new(
        key: &[u8],
        iv: &[u8],
        padding: CbcPadding,
        iv_rule: CbcIvRule,
    ) -> Result<Self, AesError> {
        let mut encryptor = Self {
            key: AesKey::new(key)?,
            padding,
            iv_rule,
            iv: [0; AES_BLOCK_SIZE],
            chain: [0; AES_BLOCK_SIZE],
        };
        encryptor.set_iv(iv)?;
        Ok(encryptor)
    }

    /// Accepts 8 or 16 bytes; a short iv is zero-extended.
    pub fn set_iv(&mut self, iv: &[u8]) -> Result<(), AesError> {
        self.iv = extend_iv(iv)?;
        self.chain = self.iv;
        Ok(())
    }

    #[must_use]
    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    pub fn update_iv(&mut self) {
        if self.iv_rule == CbcIvRule::DontUseConstantIv {
            self.iv = self.chain;
        }
    }

    pub fn crypt(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(), AesError> {
        if self.iv_rule == CbcIvRule::UseConstantIv {
            self.chain = self.iv;
        }
        match self.padding {
            CbcPadding::None => {
                let aligned = input.len() / AES_BLOCK_SIZE * AES_BLOCK_SIZE;
                self.encrypt_blocks(&input[..aligned], output);
                // Residual bytes short of a block stay clear.
                output.extend_from_slice(&input[aligned..]);
                Ok(())
            }
            CbcPadding::Pkcs5 => {
                let pad = AES_BLOCK_SIZE - input.len() % AES_BLOCK_SIZE;
                let mut padded = input.to_vec();
                padded.extend(std::iter::repeat(truncate_u8(pad)).take(pad));
                self.encrypt_blocks(&padded, output);
                Ok(())
            }
            CbcPadding::CipherTextStealing => self.encrypt_cts(input, output),
        }
    }

    fn encrypt_blocks(&mut self, input: &[u8], output: &mut Vec<u8>) {
        debug_assert_eq!(0, input.len() % AES_BLOCK_SIZE);
        for block in input.chunks_exact(AES_BLOCK_SIZE) {
            let mut b = [0; AES_BLOCK_SIZE];
            b.copy_from_slice(block);
            for (x, c) in b.iter_mut().zip(self.chain.iter()) {
                *x ^= c;
            }
            self.key.encrypt_block(&mut b);
            self.chain = b;
            output.extend_from_slice(&b);
        }
    }

    fn encrypt_cts(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(), AesError> {
        if input.len() < AES_BLOCK_SIZE {
            return Err(AesError::InputTooSmall(input.len()));
        }
        let residual = input.len() % AES_BLOCK_SIZE;
        if residual == 0 {
            self.encrypt_blocks(input, output);
            return Ok(());
        }
        let full_end = input.len() - residual - AES_BLOCK_SIZE;
        self.encrypt_blocks(&input[..full_end], output);

        // Second to last block, encrypted normally.
        let mut next_to_last = Vec::with_capacity(AES_BLOCK_SIZE);
        self.encrypt_blocks(&input[full_end..full_end + AES_BLOCK_SIZE], &mut next_to_last);

        // Last block, zero padded then encrypted; the two are swapped and
        // the stolen tail of the next-to-last cipher block is dropped.
        let mut last = [0; AES_BLOCK_SIZE];
        last[..residual].copy_from_slice(&input[full_end + AES_BLOCK_SIZE..]);
        let mut last_cipher = Vec::with_capacity(AES_BLOCK_SIZE);
        self.encrypt_blocks(&last, &mut last_cipher);

        output.extend_from_slice(&last_cipher);
        output.extend_from_slice(&next_to_last[..residual]);
        Ok(())
    }
}

pub struct AesCbcDecryptor {
    key: AesKey,
    padding: CbcPadding,
    iv_rule: CbcIvRule,
    iv: [u8; AES_BLOCK_SIZE],
    chain: [u8; AES_BLOCK_SIZE],
}

impl AesCbcDecryptor {
    pub fn new(
        key: &[u8],
        iv: &[u8],
        padding: CbcPadding,
        iv_rule: CbcIvRule,
    ) -> Result<Self, AesError> {
        let mut decryptor = Self {
            key: AesKey::new(key)?,
            padding,
            iv_rule,
            iv: [0; AES_BLOCK_SIZE],
            chain: [0; AES_BLOCK_SIZE],
        };
        decryptor.set_iv(iv)?;
        Ok(decryptor)
    }

    pub fn set_iv(&mut self, iv: &[u8]) -> Result<(), AesError> {
        self.iv = extend_iv(iv)?;
        self.chain = self.iv;
        Ok(())
    }

    pub fn crypt(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(), AesError> {
        if self.iv_rule == CbcIvRule::UseConstantIv {
            self.chain = self.iv;
        }
        match self.padding {
            CbcPadding::None => {
                let aligned = input.len() / AES_BLOCK_SIZE * AES_BLOCK_SIZE;
                self.decrypt_blocks(&input[..aligned], output);
                output.extend_from_slice(&input[aligned..]);
                Ok(())
            }
            CbcPadding::Pkcs5 => {
                if input.is_empty() || input.len() % AES_BLOCK_SIZE != 0 {
                    return Err(AesError::NotBlockAligned(input.len()));
                }
                let start = output.len();
                self.decrypt_blocks(input, output);
                let Some(&pad) = output.last() else {
                    return Err(AesError::InvalidPadding);
                };
                let pad = usize::from(pad);
                if pad == 0 || pad > AES_BLOCK_SIZE || output.len() - start < pad {
                    return Err(AesError::InvalidPadding);
                }
                if output[output.len() - pad..].iter().any(|&b| usize::from(b) != pad) {
                    return Err(AesError::InvalidPadding);
                }
                output.truncate(output.len() - pad);
                Ok(())
            }
            CbcPadding::CipherTextStealing => self.decrypt_cts(input, output),
        }
    }

    fn decrypt_blocks(&mut self, input: &[u8], output: &mut Vec<u8>) {
        debug_assert_eq!(0, input.len() % AES_BLOCK_SIZE);
        for block in input.chunks_exact(AES_BLOCK_SIZE) {
            let mut b = [0; AES_BLOCK_SIZE];
            b.copy_from_slice(block);
            self.key.decrypt_block(&mut b);
            for (x, c) in b.iter_mut().zip(self.chain.iter()) {
                *x ^= c;
            }
            self.chain.copy_from_slice(block);
            output.extend_from_slice(&b);
        }
    }

    fn decrypt_cts(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(), AesError> {
        if input.len() < AES_BLOCK_SIZE {
            return Err(AesError::InputTooSmall(input.len()));
        }
        let residual = input.len() % AES_BLOCK_SIZE;
        if residual == 0 {
            self.decrypt_blocks(input, output);
            return Ok(());
        }
        let full_end = input.len() - residual - AES_BLOCK_SIZE;
        self.decrypt_blocks(&input[..full_end], output);

        // Undo the swap: the stolen cipher tail is recovered from the
        // decryption of the swapped block.
        let mut swapped = [0; AES_BLOCK_SIZE];
        swapped.copy_from_slice(&input[full_end..full_end + AES_BLOCK_SIZE]);
        let mut stolen = swapped;
        self.key.decrypt_block(&mut stolen);

        let mut next_to_last_cipher = [0; AES_BLOCK_SIZE];
        next_to_last_cipher[..residual].copy_from_slice(&input[full_end + AES_BLOCK_SIZE..]);
        next_to_last_cipher[residual..].copy_from_slice(&stolen[residual..]);

        let mut next_to_last = next_to_last_cipher;
        self.key.decrypt_block(&mut next_to_last);
        for (x, c) in next_to_last.iter_mut().zip(self.chain.iter()) {
            *x ^= c;
        }
        output.extend_from_slice(&next_to_last);

        let mut last = stolen;
        for (x, c) in last.iter_mut().zip(next_to_last_cipher.iter()) {
            *x ^= c;
        }
        output.extend_from_slice(&last[..residual]);
        self.chain = swapped;
        Ok(())
    }
}

fn extend_iv(iv: &[u8]) -> Result<[u8; AES_BLOCK_SIZE], AesError> {
    if iv.len() != 8 && iv.len() != AES_BLOCK_SIZE {
        return Err(AesError::UnsupportedIvSize(iv.len()));
    }
    let mut out = [0; AES_BLOCK_SIZE];
    out[..iv.len()].copy_from_slice(iv);
    Ok(out)
}

#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
fn truncate_u8(v: usize) -> u8 {
    debug_assert!(v <= usize::from(u8::MAX));
    v as u8
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    // NIST SP 800-38A test case F.5.1 CTR-AES128.Encrypt.
    const AES_KEY: [u8; 16] = [
        0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, //
        0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f, 0x3c,
    ];
    const AES_IV: [u8; 16] = [
        0xf0, 0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, //
        0xf8, 0xf9, 0xfa, 0xfb, 0xfc, 0xfd, 0xfe, 0xff,
    ];
    const CTR_PLAINTEXT: [u8; 64] = [
        0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, //
        0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93, 0x17, 0x2a, //
        0xae, 0x2d, 0x8a, 0x57, 0x1e, 0x03, 0xac, 0x9c, //
        0x9e, 0xb7, 0x6f, 0xac, 0x45, 0xaf, 0x8e, 0x51, //
        0x30, 0xc8, 0x1c, 0x46, 0xa3, 0x5c, 0xe4, 0x11, //
        0xe5, 0xfb, 0xc1, 0x19, 0x1a, 0x0a, 0x52, 0xef, //
        0xf6, 0x9f, 0x24, 0x45, 0xdf, 0x4f, 0x9b, 0x17, //
        0xad, 0x2b, 0x41, 0x7b, 0xe6, 0x6c, 0x37, 0x10,
    ];
    const CTR_CIPHERTEXT: [u8; 64] = [
        0x87, 0x4d, 0x61, 0x91, 0xb6, 0x20, 0xe3, 0x26, //
        0x1b, 0xef, 0x68, 0x64, 0x99, 0x0d, 0xb6, 0xce, //
        0x98, 0x06, 0xf6, 0x6b, 0x79, 0x70, 0xfd, 0xff, //
        0x86, 0x17, 0x18, 0x7b, 0xb9, 0xff, 0xfd, 0xff, //
        0x5a, 0xe4, 0xdf, 0x3e, 0xdb, 0xd5, 0xd3, 0x5e, //
        0x5b, 0x4f, 0x09, 0x02, 0x0d, 0xb0, 0x3e, 0xab, //
        0x1e, 0x03, 0x1d, 0xda, 0x2f, 0xbe, 0x03, 0xd1, //
        0x79, 0x21, 0x70, 0xa0, 0xf3, 0x00, 0x9c, 0xee,
    ];

    #[test]
    fn test_ctr_nist_vector() {
        let mut encryptor = AesCtrCryptor::new(&AES_KEY, &AES_IV).unwrap();
        let mut encrypted = Vec::new();
        encryptor.crypt(&CTR_PLAINTEXT, &mut encrypted);
        assert_eq!(CTR_CIPHERTEXT.to_vec(), encrypted);

        let mut decryptor = AesCtrCryptor::new(&AES_KEY, &AES_IV).unwrap();
        let mut decrypted = Vec::new();
        decryptor.crypt(&encrypted, &mut decrypted);
        assert_eq!(CTR_PLAINTEXT.to_vec(), decrypted);
    }

    #[test]
    fn test_ctr_in_place() {
        let mut cryptor = AesCtrCryptor::new(&AES_KEY, &AES_IV).unwrap();
        let mut buffer = CTR_PLAINTEXT.to_vec();
        cryptor.crypt_in_place(&mut buffer);
        assert_eq!(CTR_CIPHERTEXT.to_vec(), buffer);
    }

    // Key stream continuity across arbitrary subsample chunk sizes.
    #[test_case(&[64]; "single")]
    #[test_case(&[13, 51]; "split mid block")]
    #[test_case(&[16, 48]; "split on block")]
    #[test_case(&[3, 16, 45]; "three chunks")]
    #[test_case(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 9]; "many chunks")]
    fn test_ctr_chunked(chunks: &[usize]) {
        let mut cryptor = AesCtrCryptor::new(&AES_KEY, &AES_IV).unwrap();
        let mut encrypted = Vec::new();
        let mut offset = 0;
        for &len in chunks {
            cryptor.crypt(&CTR_PLAINTEXT[offset..offset + len], &mut encrypted);
            offset += len;
            assert_eq!(offset % AES_BLOCK_SIZE, cryptor.block_offset());
        }
        assert_eq!(CTR_CIPHERTEXT.to_vec(), encrypted);
    }

    // IV update rules from ISO/IEC 23001-7: an 8-byte iv increments by one,
    // a 16-byte iv advances by the consumed block count.
    #[test_case(
        &[0; 16],
        &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 4];
        "iv128 zero")]
    #[test_case(
        &[0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff],
        &[0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 3];
        "iv128 low half max")]
    #[test_case(
        &[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
          0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe],
        &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2];
        "iv128 max minus one")]
    #[test_case(&[0; 8], &[0, 0, 0, 0, 0, 0, 0, 1]; "iv64 zero")]
    #[test_case(
        &[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe],
        &[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
        "iv64 max minus one")]
    #[test_case(&[0xff; 8], &[0; 8]; "iv64 max wraps")]
    fn test_ctr_update_iv(iv: &[u8], want: &[u8]) {
        let key = [1; 16];
        // Three full blocks plus one partial block, i.e. 4 blocks consumed.
        let plaintext = [3; 60];

        let mut cryptor = AesCtrCryptor::new(&key, iv).unwrap();
        let mut encrypted = Vec::new();
        cryptor.crypt(&plaintext, &mut encrypted);
        cryptor.update_iv();
        assert_eq!(want, cryptor.iv());
    }

    // The block counter is 64 bits; it must not carry into the iv half.
    #[test]
    fn test_ctr_counter_wrap_no_carry() {
        let mut iv_max = [0_u8; 16];
        iv_max[8..].copy_from_slice(&[0xff; 8]);

        let mut cryptor = AesCtrCryptor::new(&AES_KEY, &iv_max).unwrap();
        let mut got = Vec::new();
        cryptor.crypt(&CTR_PLAINTEXT, &mut got);

        // First block keyed by the initial counter, the rest keyed as if
        // the counter restarted from zero.
        let mut want = Vec::new();
        let mut first = AesCtrCryptor::new(&AES_KEY, &iv_max).unwrap();
        first.crypt(&CTR_PLAINTEXT[..16], &mut want);
        let mut rest = AesCtrCryptor::new(&AES_KEY, &[0; 16]).unwrap();
        rest.crypt(&CTR_PLAINTEXT[16..], &mut want);

        assert_eq!(want, got);
    }

    #[test]
    fn test_ctr_unsupported_key_size() {
        let err = AesCtrCryptor::new(&[0; 13], &AES_IV).err().unwrap();
        assert_eq!(AesError::UnsupportedKeySize(13), err);
    }

    #[test]
    fn test_ctr_unsupported_iv_size() {
        assert!(AesCtrCryptor::new(&AES_KEY, &[0; 15]).is_err());
    }

    // NIST SP 800-38A test vector F.2.5 CBC-AES256.Encrypt.
    #[test]
    fn test_cbc_pkcs5_aes256_nist_vector() {
        const KEY: [u8; 32] = [
            0x60, 0x3d, 0xeb, 0x10, 0x15, 0xca, 0x71, 0xbe, //
            0x2b, 0x73, 0xae, 0xf0, 0x85, 0x7d, 0x77, 0x81, //
            0x1f, 0x35, 0x2c, 0x07, 0x3b, 0x61, 0x08, 0xd7, //
            0x2d, 0x98, 0x10, 0xa3, 0x09, 0x14, 0xdf, 0xf4,
        ];
        const IV: [u8; 16] = [
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, //
            0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
        ];
        const CIPHERTEXT: [u8; 80] = [
            0xf5, 0x8c, 0x4c, 0x04, 0xd6, 0xe5, 0xf1, 0xba, //
            0x77, 0x9e, 0xab, 0xfb, 0x5f, 0x7b, 0xfb, 0xd6, //
            0x9c, 0xfc, 0x4e, 0x96, 0x7e, 0xdb, 0x80, 0x8d, //
            0x67, 0x9f, 0x77, 0x7b, 0xc6, 0x70, 0x2c, 0x7d, //
            0x39, 0xf2, 0x33, 0x69, 0xa9, 0xd9, 0xba, 0xcf, //
            0xa5, 0x30, 0xe2, 0x63, 0x04, 0x23, 0x14, 0x61, //
            0xb2, 0xeb, 0x05, 0xe2, 0xc3, 0x9b, 0xe9, 0xfc, //
            0xda, 0x6c, 0x19, 0x07, 0x8c, 0x6a, 0x9d, 0x1b, //
            // PKCS #5 padding, encrypted.
            0x3f, 0x46, 0x17, 0x96, 0xd6, 0xb0, 0xd6, 0xb2, //
            0xe0, 0xc2, 0xa7, 0x2b, 0x4d, 0x80, 0xe6, 0x44,
        ];

        let mut encryptor =
            AesCbcEncryptor::new(&KEY, &IV, CbcPadding::Pkcs5, CbcIvRule::UseConstantIv).unwrap();
        let mut encrypted = Vec::new();
        encryptor.crypt(&CTR_PLAINTEXT, &mut encrypted).unwrap();
        assert_eq!(CIPHERTEXT.to_vec(), encrypted);

        let mut decryptor =
            AesCbcDecryptor::new(&KEY, &IV, CbcPadding::Pkcs5, CbcIvRule::UseConstantIv).unwrap();
        let mut decrypted = Vec::new();
        decryptor.crypt(&encrypted, &mut decrypted).unwrap();
        assert_eq!(CTR_PLAINTEXT.to_vec(), decrypted);
    }

    #[test_case(16; "one block")]
    #[test_case(32; "two blocks")]
    #[test_case(33; "partial tail")]
    #[test_case(47; "fifteen byte tail")]
    fn test_cbc_no_padding_round_trip(len: usize) {
        let plaintext: Vec<u8> = (0..len).map(truncate_u8).collect();

        let mut encryptor =
            AesCbcEncryptor::new(&AES_KEY, &AES_IV, CbcPadding::None, CbcIvRule::UseConstantIv)
                .unwrap();
        let mut encrypted = Vec::new();
        encryptor.crypt(&plaintext, &mut encrypted).unwrap();
        assert_eq!(plaintext.len(), encrypted.len());
        // The residual partial block stays clear.
        let aligned = len / AES_BLOCK_SIZE * AES_BLOCK_SIZE;
        assert_eq!(plaintext[aligned..], encrypted[aligned..]);

        let mut decryptor =
            AesCbcDecryptor::new(&AES_KEY, &AES_IV, CbcPadding::None, CbcIvRule::UseConstantIv)
                .unwrap();
        let mut decrypted = Vec::new();
        decryptor.crypt(&encrypted, &mut decrypted).unwrap();
        assert_eq!(plaintext, decrypted);
    }

    #[test_case(16; "single block")]
    #[test_case(17; "one byte over")]
    #[test_case(48; "three blocks")]
    #[test_case(50; "two byte tail")]
    #[test_case(63; "fifteen byte tail")]
    fn test_cbc_cts_round_trip(len: usize) {
        let plaintext: Vec<u8> = (0..len).map(|i| truncate_u8(i * 7 % 256)).collect();

        let mut encryptor = AesCbcEncryptor::new(
            &AES_KEY,
            &AES_IV,
            CbcPadding::CipherTextStealing,
            CbcIvRule::UseConstantIv,
        )
        .unwrap();
        let mut encrypted = Vec::new();
        encryptor.crypt(&plaintext, &mut encrypted).unwrap();
        // Ciphertext stealing never grows the payload.
        assert_eq!(plaintext.len(), encrypted.len());

        let mut decryptor = AesCbcDecryptor::new(
            &AES_KEY,
            &AES_IV,
            CbcPadding::CipherTextStealing,
            CbcIvRule::UseConstantIv,
        )
        .unwrap();
        let mut decrypted = Vec::new();
        decryptor.crypt(&encrypted, &mut decrypted).unwrap();
        assert_eq!(plaintext, decrypted);
    }

    #[test]
    fn test_cbc_cts_rejects_short_input() {
        let mut encryptor = AesCbcEncryptor::new(
            &AES_KEY,
            &AES_IV,
            CbcPadding::CipherTextStealing,
            CbcIvRule::UseConstantIv,
        )
        .unwrap();
        let mut out = Vec::new();
        encryptor.crypt(&[1, 2, 3], &mut out).unwrap_err();
    }

    #[test]
    fn test_cbc_constant_iv_resets_chain() {
        let plaintext = [7; 32];
        let mut encryptor =
            AesCbcEncryptor::new(&AES_KEY, &AES_IV, CbcPadding::None, CbcIvRule::UseConstantIv)
                .unwrap();
        let mut first = Vec::new();
        encryptor.crypt(&plaintext, &mut first).unwrap();
        let mut second = Vec::new();
        encryptor.crypt(&plaintext, &mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_cbc_chained_iv_differs() {
        let plaintext = [7; 32];
        let mut encryptor = AesCbcEncryptor::new(
            &AES_KEY,
            &AES_IV,
            CbcPadding::None,
            CbcIvRule::DontUseConstantIv,
        )
        .unwrap();
        let mut first = Vec::new();
        encryptor.crypt(&plaintext, &mut first).unwrap();
        let mut second = Vec::new();
        encryptor.crypt(&plaintext, &mut second).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_cbc_update_iv_promotes_last_cipher_block() {
        let plaintext = [7; 32];
        let mut encryptor = AesCbcEncryptor::new(
            &AES_KEY,
            &AES_IV,
            CbcPadding::None,
            CbcIvRule::DontUseConstantIv,
        )
        .unwrap();
        let mut encrypted = Vec::new();
        encryptor.crypt(&plaintext, &mut encrypted).unwrap();
        encryptor.update_iv();
        assert_eq!(&encrypted[16..32], encryptor.iv());
    }

    #[test]
    fn test_cbc_eight_byte_iv_zero_extended() {
        let iv8 = [0x41, 0x54, 0x65, 0x73, 0x74, 0x49, 0x76, 0x33];
        let mut iv16 = [0_u8; 16];
        iv16[..8].copy_from_slice(&iv8);

        let plaintext = [9; 16];
        let mut short = AesCbcEncryptor::new(
            &AES_KEY,
            &iv8,
            CbcPadding::None,
            CbcIvRule::UseConstantIv,
        )
        .unwrap();
        let mut long = AesCbcEncryptor::new(
            &AES_KEY,
            &iv16,
            CbcPadding::None,
            CbcIvRule::UseConstantIv,
        )
        .unwrap();
        let mut a = Vec::new();
        short.crypt(&plaintext, &mut a).unwrap();
        let mut b = Vec::new();
        long.crypt(&plaintext, &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_iv_size_for_scheme() {
        assert_eq!(8, iv_size_for_scheme(ProtectionScheme::Cenc));
        assert_eq!(16, iv_size_for_scheme(ProtectionScheme::Cbc1));
        assert_eq!(16, iv_size_for_scheme(ProtectionScheme::Cens));
    }

    // Round-trip law over seeded random payloads of every length up to a
    // few blocks.
    #[test]
    fn test_ctr_round_trip_random_payloads() {
        use rand::{RngCore, SeedableRng};
        let mut rng = rand_chacha::ChaCha20Rng::seed_from_u64(7);

        for len in 1..=70 {
            let mut plaintext = vec![0_u8; len];
            rng.fill_bytes(&mut plaintext);

            let mut encryptor = AesCtrCryptor::new(&AES_KEY, &AES_IV).unwrap();
            let mut encrypted = Vec::new();
            encryptor.crypt(&plaintext, &mut encrypted);

            let mut decryptor = AesCtrCryptor::new(&AES_KEY, &AES_IV).unwrap();
            let mut decrypted = Vec::new();
            decryptor.crypt(&encrypted, &mut decrypted);
            assert_eq!(plaintext, decrypted, "length {len}");
        }
    }

    #[test]
    fn test_cbc_pkcs5_round_trip_random_payloads() {
        use rand::{RngCore, SeedableRng};
        let mut rng = rand_chacha::ChaCha20Rng::seed_from_u64(11);

        for len in 1..=70 {
            let mut plaintext = vec![0_u8; len];
            rng.fill_bytes(&mut plaintext);

            let mut encryptor = AesCbcEncryptor::new(
                &AES_KEY,
                &AES_IV,
                CbcPadding::Pkcs5,
                CbcIvRule::UseConstantIv,
            )
            .unwrap();
            let mut encrypted = Vec::new();
            encryptor.crypt(&plaintext, &mut encrypted).unwrap();
            assert_eq!(0, encrypted.len() % AES_BLOCK_SIZE);

            let mut decryptor = AesCbcDecryptor::new(
                &AES_KEY,
                &AES_IV,
                CbcPadding::Pkcs5,
                CbcIvRule::UseConstantIv,
            )
            .unwrap();
            let mut decrypted = Vec::new();
            decryptor.crypt(&encrypted, &mut decrypted).unwrap();
            assert_eq!(plaintext, decrypted, "length {len}");
        }
    }
}

// SPDX-License-Identifier: GPL-2.0-or-later

//! Sample encryption: AES cryptors with the CENC IV rules, subsample layout
//! generation, key sourcing, protection system data, and the encryption
//! handler that ties them together inside a pipeline.

pub mod aes;
mod encryptor;
mod key_source;
pub mod pssh;
mod subsample;

#[cfg(test)]
mod test;

pub use encryptor::*;
pub use key_source::*;
pub use subsample::*;

use rand::RngCore;

/// Source of initialization vectors. Injected so tests stay deterministic;
/// never a process-wide singleton.
pub trait IvGenerator: Send + Sync {
    fn generate(&self, size: usize) -> Vec<u8>;
}

pub struct RandomIvGenerator;

impl IvGenerator for RandomIvGenerator {
    fn generate(&self, size: usize) -> Vec<u8> {
        let mut iv = vec![0; size];
        rand::rng().fill_bytes(&mut iv);
        iv
    }
}

/// Always returns the same iv, truncated or zero-extended to the requested
/// size.
pub struct FixedIvGenerator(Vec<u8>);

impl FixedIvGenerator {
    #[must_use]
    pub fn new(iv: Vec<u8>) -> Self {
        Self(iv)
    }
}

impl IvGenerator for FixedIvGenerator {
    fn generate(&self, size: usize) -> Vec<u8> {
        let mut iv = self.0.clone();
        iv.resize(size, 0);
        iv
    }
}

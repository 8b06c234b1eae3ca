// Cryptographic pieces of the TEAP core: PRF selection, key chain, crypto binding.

pub mod binding;
pub mod keys;
pub mod prf;

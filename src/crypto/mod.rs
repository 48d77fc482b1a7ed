//! Cryptographic key pairs and signatures.

pub mod key_pair;

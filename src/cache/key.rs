//! Canonical keys: SHA-256 over a canonical encoding of a path's identity
//! and the Setting/Variable content of its environments.
//!
//! Encoding layout (all integers little-endian, strings length-prefixed):
//!
//! ```text
//! "jmaps/canonical-key" | scheme:u32 | path identity
//! | n_envs:u64 | for each env (path order): name | n_params:u64
//! |     for each identity param (sorted by name): name | tagged value
//! | n_upstream:u64 | upstream keys (subpath order, 32 bytes each)
//! ```
//!
//! Options never reach the encoder. Parameter order is lexicographic, so two
//! sets built in different insertion orders hash identically. Changing any
//! part of this layout requires bumping [`KEY_SCHEME_VERSION`].

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::param::{ParameterSet, write_bytes};
use crate::path::PathIdentity;

/// Version of the canonicalization scheme. Part of every key and entry.
pub const KEY_SCHEME_VERSION: u32 = 1;

const DOMAIN: &[u8] = b"jmaps/canonical-key";

/// 32-byte fingerprint of a path run's identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalKey([u8; 32]);

impl CanonicalKey {
    /// Derive the key for `path` given its environments' parameter sets
    /// (in the path's environment order) and the keys of its subpaths.
    pub fn derive(
        path: &PathIdentity,
        contexts: &[(&str, &ParameterSet)],
        upstream: &[CanonicalKey],
    ) -> Self {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(DOMAIN);
        buf.extend_from_slice(&KEY_SCHEME_VERSION.to_le_bytes());
        path.write_canonical(&mut buf);

        buf.extend_from_slice(&(contexts.len() as u64).to_le_bytes());
        for (env, params) in contexts {
            write_bytes(&mut buf, env.as_bytes());
            let identity = params.identity();
            buf.extend_from_slice(&(identity.len() as u64).to_le_bytes());
            for (name, value) in identity {
                write_bytes(&mut buf, name.as_bytes());
                value.write_canonical(&mut buf);
            }
        }

        buf.extend_from_slice(&(upstream.len() as u64).to_le_bytes());
        for key in upstream {
            buf.extend_from_slice(&key.0);
        }

        let digest = Sha256::digest(&buf);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the 64-character hex form.
    pub fn from_hex(s: &str) -> Result<Self, KeyParseError> {
        if s.len() != 64 {
            return Err(KeyParseError::InvalidLength(s.len()));
        }
        let mut buf = [0u8; 32];
        hex::decode_to_slice(s, &mut buf)?;
        Ok(Self(buf))
    }

    /// Short prefix for display.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }

    /// Lock stripe for this key.
    pub(crate) fn stripe(&self, stripes: usize) -> usize {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.0[..8]);
        (u64::from_le_bytes(head) % stripes as u64) as usize
    }
}

impl fmt::Debug for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CanonicalKey").field(&self.to_hex()).finish()
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Debug, Error)]
pub enum KeyParseError {
    #[error("key hex length must be 64, got {0}")]
    InvalidLength(usize),
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::{ParamRange, Parameter};
    use crate::path::PathSpec;

    fn furnace(power: f64, verbose: bool) -> ParameterSet {
        ParameterSet::from_params([
            Parameter::setting("temp", 300),
            Parameter::variable("power", power, ParamRange::linear(1.0, 10.0)),
            Parameter::option("verbose", verbose),
        ])
        .unwrap()
    }

    fn anneal() -> PathIdentity {
        PathSpec::new("anneal").environment("furnace").identity()
    }

    #[test]
    fn test_options_do_not_change_key() {
        let a = furnace(5.0, true);
        let b = furnace(5.0, false);
        let ka = CanonicalKey::derive(&anneal(), &[("furnace", &a)], &[]);
        let kb = CanonicalKey::derive(&anneal(), &[("furnace", &b)], &[]);
        assert_eq!(ka, kb);
    }

    #[test]
    fn test_variables_change_key() {
        let a = furnace(5.0, true);
        let b = furnace(7.0, true);
        let ka = CanonicalKey::derive(&anneal(), &[("furnace", &a)], &[]);
        let kb = CanonicalKey::derive(&anneal(), &[("furnace", &b)], &[]);
        assert_ne!(ka, kb);
    }

    #[test]
    fn test_path_identity_changes_key() {
        let set = furnace(5.0, true);
        let other = PathSpec::new("quench").environment("furnace").identity();
        let ka = CanonicalKey::derive(&anneal(), &[("furnace", &set)], &[]);
        let kb = CanonicalKey::derive(&other, &[("furnace", &set)], &[]);
        assert_ne!(ka, kb);
    }

    #[test]
    fn test_environment_name_is_part_of_key() {
        let set = furnace(5.0, true);
        let ka = CanonicalKey::derive(&anneal(), &[("furnace", &set)], &[]);
        let kb = CanonicalKey::derive(&anneal(), &[("oven", &set)], &[]);
        assert_ne!(ka, kb);
    }

    #[test]
    fn test_upstream_keys_change_key() {
        let set = furnace(5.0, true);
        let up_a = CanonicalKey::derive(&anneal(), &[("furnace", &set)], &[]);
        let up_b = CanonicalKey::derive(&anneal(), &[("furnace", &furnace(6.0, true))], &[]);
        let parent = PathSpec::new("report").environment("furnace").identity();
        let ka = CanonicalKey::derive(&parent, &[("furnace", &set)], &[up_a]);
        let kb = CanonicalKey::derive(&parent, &[("furnace", &set)], &[up_b]);
        assert_ne!(ka, kb);
    }

    #[test]
    fn test_no_collisions_across_small_grid() {
        use std::collections::HashSet;
        let mut seen = HashSet::new();
        for temp in 0..20 {
            for power in 0..20 {
                let set = ParameterSet::from_params([
                    Parameter::setting("temp", temp),
                    Parameter::variable("power", 1.0 + power as f64 * 0.25, ParamRange::linear(1.0, 10.0)),
                ])
                .unwrap();
                assert!(seen.insert(CanonicalKey::derive(&anneal(), &[("furnace", &set)], &[])));
            }
        }
    }

    #[test]
    fn test_hex_parse() {
        let key = CanonicalKey::derive(&anneal(), &[("furnace", &furnace(5.0, true))], &[]);
        let parsed = CanonicalKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(parsed, key);
        assert!(matches!(
            CanonicalKey::from_hex("abc"),
            Err(KeyParseError::InvalidLength(3))
        ));
    }

    #[test]
    fn test_stripe_in_range() {
        let key = CanonicalKey::derive(&anneal(), &[("furnace", &furnace(5.0, true))], &[]);
        assert!(key.stripe(64) < 64);
    }
}

//! Codec registry (§4.4): suffix-keyed encode/decode hooks applied around
//! the raw shard bytes, with `nonfinal` chaining so a suffix like
//! `.json.gz` runs the `.gz` codec and then the `.json` codec underneath it.
//! Grounded on `barecat.py`'s `register_codec`/`encode`/`decode`; the codec
//! bodies themselves (e.g. an actual gzip or msgpack codec) are out of
//! scope — only the registration/dispatch mechanism is.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{BarecatError, Result};

pub type EncodeFn = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync>;
pub type DecodeFn = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync>;

#[derive(Clone)]
pub struct Codec {
    pub encode: EncodeFn,
    pub decode: DecodeFn,
    /// If true, this codec's suffix is stripped and matching continues on
    /// the remaining suffix instead of terminating the chain.
    pub nonfinal: bool,
}

#[derive(Default, Clone)]
pub struct CodecRegistry {
    by_suffix: HashMap<String, Codec>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        suffix: &str,
        encode: EncodeFn,
        decode: DecodeFn,
        nonfinal: bool,
    ) {
        self.by_suffix.insert(
            suffix.to_string(),
            Codec {
                encode,
                decode,
                nonfinal,
            },
        );
    }

    /// Apply every codec whose suffix matches `path` before writing `data`
    /// to a shard. `matching_suffixes` returns them outside-in (`.gz` then
    /// `.json` for `a.json.gz`); encoding builds the on-disk bytes from the
    /// inside out, so the order is reversed here.
    pub fn encode(&self, path: &str, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = data.to_vec();
        for suffix in self.matching_suffixes(path).into_iter().rev() {
            let codec = &self.by_suffix[&suffix];
            out = (codec.encode)(&out)?;
        }
        Ok(out)
    }

    /// Apply every codec whose suffix matches `path` to bytes just read from
    /// a shard, outside-in: the outermost wrapper (e.g. `.gz`) is peeled off
    /// first, matching `matching_suffixes`'s own order.
    pub fn decode(&self, path: &str, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = data.to_vec();
        for suffix in self.matching_suffixes(path) {
            let codec = &self.by_suffix[&suffix];
            out = (codec.decode)(&out)?;
        }
        Ok(out)
    }

    /// Suffixes to apply, in outside-in order, honoring `nonfinal` chaining:
    /// `a.json.gz` matches `.gz` (nonfinal) then `.json` (final, so chaining
    /// stops there even if a further suffix existed).
    fn matching_suffixes(&self, path: &str) -> Vec<String> {
        let mut remaining = path;
        let mut chain = Vec::new();
        loop {
            let Some((suffix, codec)) = self
                .by_suffix
                .iter()
                .find(|(s, _)| remaining.ends_with(s.as_str()))
            else {
                break;
            };
            chain.push(suffix.clone());
            if !codec.nonfinal {
                break;
            }
            remaining = &remaining[..remaining.len() - suffix.len()];
        }
        chain
    }

    pub fn is_registered(&self, suffix: &str) -> bool {
        self.by_suffix.contains_key(suffix)
    }
}

/// Identity codec used when no suffix matches; kept as an explicit function
/// rather than an `Option` so call sites never special-case "no codec".
pub fn passthrough_encode(data: &[u8]) -> Result<Vec<u8>> {
    Ok(data.to_vec())
}

pub fn passthrough_decode(data: &[u8]) -> Result<Vec<u8>> {
    Ok(data.to_vec())
}

pub fn unknown_codec_error(suffix: &str) -> BarecatError {
    BarecatError::InvalidArgument(format!("no codec registered for suffix {suffix:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upper_codec() -> Codec {
        Codec {
            encode: Arc::new(|d| Ok(d.iter().map(|b| b.to_ascii_uppercase()).collect())),
            decode: Arc::new(|d| Ok(d.iter().map(|b| b.to_ascii_lowercase()).collect())),
            nonfinal: false,
        }
    }

    #[test]
    fn encode_decode_roundtrip_single_suffix() {
        let mut reg = CodecRegistry::new();
        let c = upper_codec();
        reg.register(".up", c.encode, c.decode, c.nonfinal);
        let encoded = reg.encode("name.up", b"hello").unwrap();
        assert_eq!(encoded, b"HELLO");
        let decoded = reg.decode("name.up", &encoded).unwrap();
        assert_eq!(decoded, b"hello");
    }

    #[test]
    fn unmatched_suffix_passes_through() {
        let reg = CodecRegistry::new();
        assert_eq!(reg.encode("name.bin", b"x").unwrap(), b"x");
    }

    #[test]
    fn nonfinal_codec_chains_to_inner_suffix() {
        let mut reg = CodecRegistry::new();
        reg.register(
            ".gz",
            Arc::new(|d: &[u8]| Ok([b"GZ:".to_vec(), d.to_vec()].concat())),
            Arc::new(|d: &[u8]| Ok(d[3..].to_vec())),
            true,
        );
        reg.register(
            ".json",
            Arc::new(|d: &[u8]| Ok([b"JSON:".to_vec(), d.to_vec()].concat())),
            Arc::new(|d: &[u8]| Ok(d[5..].to_vec())),
            false,
        );
        let encoded = reg.encode("data.json.gz", b"{}").unwrap();
        assert_eq!(encoded, b"GZ:JSON:{}");
        let decoded = reg.decode("data.json.gz", &encoded).unwrap();
        assert_eq!(decoded, b"{}");
    }
}

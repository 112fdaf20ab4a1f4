use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::types::{ParamValue, RenderRequest};

/// The identity of a rendered image in the cache.
///
/// Two keys are equal when their hashes are equal. The human-readable metadata the hash was
/// computed from is kept alongside, and persisted next to the cache file to help debugging.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.hash))
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Creates the [`CacheKey`] for a [`RenderRequest`].
    ///
    /// Numeric parameters are rounded to `precision` decimal digits before hashing.
    pub fn from_request(request: &RenderRequest, precision: u32) -> Self {
        let mut builder = CacheKeyBuilder::new();
        builder.write_request(request, precision);
        builder.build()
    }

    /// Recreates a [`CacheKey`] from previously persisted metadata.
    pub fn from_metadata(metadata: impl Into<String>) -> Self {
        CacheKeyBuilder {
            metadata: metadata.into(),
        }
        .build()
    }

    /// Returns the human-readable metadata that forms the basis of the [`CacheKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns the relative path for this cache key.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so:
    /// `v$version/aa/bbccdd/eeff...`
    pub fn cache_path(&self, version: u32) -> String {
        format!(
            "v{version}/{:02x}/{}/{}",
            self.hash[0],
            hex::encode(&self.hash[1..4]),
            hex::encode(&self.hash[4..])
        )
    }

    #[cfg(test)]
    pub fn for_testing(key: impl Into<String>) -> Self {
        Self::from_metadata(key)
    }
}

/// A builder for [`CacheKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, and the intention of it is to
/// accept human readable, but most importantly **stable**, input.
/// This input in then being hashed to form the [`CacheKey`].
#[derive(Debug, Default)]
pub struct CacheKeyBuilder {
    metadata: String,
}

impl CacheKeyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes the normalized form of a [`RenderRequest`] into the [`CacheKey`].
    ///
    /// String values are written in their escaped, quoted form so that separators inside a
    /// gene or parameter name can not produce the same text as a different request.
    pub fn write_request(&mut self, request: &RenderRequest, precision: u32) {
        // writing into a `String` is infallible
        let _ = writeln!(self.metadata, "dataset: {:?}", request.dataset_id);
        let _ = writeln!(self.metadata, "gene: {:?}", request.gene);
        let _ = writeln!(self.metadata, "format: {}", request.format);
        // `params` is a `BTreeMap`, which iterates in sorted key order
        for (name, value) in &request.params {
            let _ = writeln!(
                self.metadata,
                "param {name:?}: {}",
                normalize_param(value, precision)
            );
        }
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        let hash: [u8; 32] = Sha256::digest(&self.metadata).into();

        CacheKey {
            metadata: self.metadata.into(),
            hash,
        }
    }
}

impl fmt::Write for CacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}

fn normalize_param(value: &ParamValue, precision: u32) -> String {
    match value {
        ParamValue::Bool(v) => format!("bool:{v}"),
        ParamValue::Int(v) => format!("num:{v}"),
        ParamValue::Float(v) => format!("num:{}", normalize_number(*v, precision)),
        ParamValue::Str(v) => format!("str:{v:?}"),
    }
}

/// Rounds `value` to `precision` decimal digits and strips trailing zeros.
///
/// Integral floats therefore print exactly like integers, and `-0` prints as `0`.
fn normalize_number(value: f64, precision: u32) -> String {
    if value.is_nan() {
        return "nan".into();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.into();
    }

    let mut s = format!("{:.*}", precision as usize, value);
    if s.contains('.') {
        let trimmed = s.trim_end_matches('0').trim_end_matches('.').len();
        s.truncate(trimmed);
    }
    if s == "-0" {
        s = "0".into();
    }
    s
}

#[cfg(test)]
mod tests {
    use crate::types::ImageFormat;

    use super::*;

    fn request() -> RenderRequest {
        RenderRequest::new("mouse_brain.h5ad", "Gfap", ImageFormat::Png)
            .with_param("dpi", 300u32)
            .with_param("layer", "lognorm")
            .with_param("basis", "spatial")
    }

    #[test]
    fn test_cache_path() {
        let key = CacheKey::for_testing("some random cache key");
        assert_eq!(
            key.cache_path(1),
            "v1/e4/3a2b89/3ce1736d9d26113e4fdfe5ba1086197027af825df8bdb5781e68f1d9"
        );
        assert_eq!(key.cache_path(0).len(), key.cache_path(1).len());
        assert!(key.cache_path(3).starts_with("v3/e4/3a2b89/"));
    }

    #[test]
    fn test_metadata() {
        let key = CacheKey::from_request(&request().with_param("point_size", 1.25), 6);

        insta::assert_snapshot!(key.metadata().trim_end(), @r###"
        dataset: "mouse_brain.h5ad"
        gene: "Gfap"
        format: png
        param "basis": str:"spatial"
        param "dpi": num:300
        param "layer": str:"lognorm"
        param "point_size": num:1.25
        "###);
    }

    #[test]
    fn test_parameter_order_does_not_matter() {
        let a = RenderRequest::new("d.h5ad", "Gfap", ImageFormat::Tiff)
            .with_param("dpi", 600u32)
            .with_param("layer", "counts");
        let b = RenderRequest::new("d.h5ad", "Gfap", ImageFormat::Tiff)
            .with_param("layer", "counts")
            .with_param("dpi", 600u32);

        assert_eq!(CacheKey::from_request(&a, 6), CacheKey::from_request(&b, 6));
    }

    #[test]
    fn test_every_field_contributes() {
        let base = CacheKey::from_request(&request(), 6);

        let mut other = request();
        other.dataset_id = "human_lymph_node.h5ad".into();
        assert_ne!(base, CacheKey::from_request(&other, 6));

        let mut other = request();
        other.gene = "Gfap2".into();
        assert_ne!(base, CacheKey::from_request(&other, 6));

        let mut other = request();
        other.format = ImageFormat::Pdf;
        assert_ne!(base, CacheKey::from_request(&other, 6));

        let other = request().with_param("dpi", 600u32);
        assert_ne!(base, CacheKey::from_request(&other, 6));

        let other = request().with_param("cmap", "viridis");
        assert_ne!(base, CacheKey::from_request(&other, 6));
    }

    #[test]
    fn test_number_normalization() {
        let int = CacheKey::from_request(&request().with_param("point_size", 1i64), 6);
        let float = CacheKey::from_request(&request().with_param("point_size", 1.0), 6);
        let noisy = CacheKey::from_request(&request().with_param("point_size", 1.000_000_1), 6);
        assert_eq!(int, float);
        assert_eq!(float, noisy);

        // a coarser precision folds more values together
        let a = CacheKey::from_request(&request().with_param("alpha", 0.501), 2);
        let b = CacheKey::from_request(&request().with_param("alpha", 0.499), 2);
        assert_eq!(a, b);

        let a = CacheKey::from_request(&request().with_param("alpha", 0.501), 6);
        let b = CacheKey::from_request(&request().with_param("alpha", 0.499), 6);
        assert_ne!(a, b);

        assert_eq!(normalize_number(-0.0, 6), "0");
        assert_eq!(normalize_number(-0.000_000_1, 6), "0");
        assert_eq!(normalize_number(120.0, 3), "120");
        assert_eq!(normalize_number(f64::NEG_INFINITY, 6), "-inf");
    }

    #[test]
    fn test_strings_and_numbers_differ() {
        let number = CacheKey::from_request(&request().with_param("x", 1i64), 6);
        let string = CacheKey::from_request(&request().with_param("x", "1"), 6);
        let boolean = CacheKey::from_request(&request().with_param("x", true), 6);
        let text = CacheKey::from_request(&request().with_param("x", "true"), 6);
        assert_ne!(number, string);
        assert_ne!(boolean, text);
    }

    #[test]
    fn test_separators_cannot_collide() {
        let a = RenderRequest::new("a", "b\ngene: \"c\"", ImageFormat::Png);
        let b = RenderRequest::new("a", "b", ImageFormat::Png);
        assert_ne!(CacheKey::from_request(&a, 6), CacheKey::from_request(&b, 6));
    }

    #[test]
    fn test_metadata_roundtrip() {
        let key = CacheKey::from_request(&request(), 6);
        let restored = CacheKey::from_metadata(key.metadata());
        assert_eq!(key, restored);
        assert_eq!(key.cache_path(1), restored.cache_path(1));
    }
}

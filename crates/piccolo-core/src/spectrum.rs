//! The [`Spectrum`]/[`SpectraList`] data model.
//!
//! A `Spectrum` is an ordered sample vector plus a metadata map. Four keys
//! are reserved and may only be set through the typed setters below; any
//! attempt to poke them through [`Spectrum::set_metadata`] or
//! [`Spectrum::remove_metadata`] fails with [`CoreError::ProtectedKey`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};

/// The optical path a spectrum was recorded on, modeled as an enum rather
/// than a bare boolean or string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upwelling,
    Downwelling,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Upwelling => "upwelling",
            Direction::Downwelling => "downwelling",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four metadata keys reserved for the acquisition pipeline.
/// Clients cannot set or delete these directly; they're written exclusively
/// by [`Spectrum::stamp`].
const RESERVED_KEYS: [&str; 4] = ["Direction", "Dark", "Datetime", "name"];

fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// One acquired spectrum: an ordered pixel vector plus a metadata map.
///
/// Metadata is stored as a `BTreeMap<String, Value>` rather than a
/// `HashMap` so that serialized output has a deterministic key order, which
/// keeps the `.pico` files diffable across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spectrum {
    #[serde(rename = "Metadata")]
    metadata: BTreeMap<String, Value>,
    #[serde(rename = "Pixels")]
    pixels: Vec<f64>,
}

impl Spectrum {
    /// Create a spectrum with no metadata and the given pixel samples.
    pub fn new(pixels: Vec<f64>) -> Self {
        Spectrum {
            metadata: BTreeMap::new(),
            pixels,
        }
    }

    pub fn pixels(&self) -> &[f64] {
        &self.pixels
    }

    pub fn pixel_count(&self) -> usize {
        self.pixels.len()
    }

    /// Write a client-settable (non-reserved) metadata value.
    ///
    /// # Errors
    /// Returns [`CoreError::ProtectedKey`] if `key` is one of the four
    /// reserved fields.
    pub fn set_metadata(&mut self, key: &str, value: impl Into<Value>) -> CoreResult<()> {
        if is_reserved(key) {
            return Err(CoreError::ProtectedKey(key.to_string()));
        }
        self.metadata.insert(key.to_string(), value.into());
        Ok(())
    }

    /// Remove a client-settable (non-reserved) metadata value.
    ///
    /// # Errors
    /// Returns [`CoreError::ProtectedKey`] if `key` is one of the four
    /// reserved fields.
    pub fn remove_metadata(&mut self, key: &str) -> CoreResult<Option<Value>> {
        if is_reserved(key) {
            return Err(CoreError::ProtectedKey(key.to_string()));
        }
        Ok(self.metadata.remove(key))
    }

    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Internal: write a reserved key. Only the acquisition pipeline calls
    /// this, never anything reachable from the dispatcher's client surface.
    fn set_reserved(&mut self, key: &'static str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    /// Stamp the four reserved fields at acquisition time. Called exactly
    /// once per spectrum, by the spectrometer worker, before the spectrum is
    /// pushed to its result queue.
    pub fn stamp(&mut self, direction: Direction, dark: bool, datetime: DateTime<Utc>, name: &str) {
        self.set_reserved("Direction", direction.as_str());
        self.set_reserved("Dark", dark);
        self.set_reserved(
            "Datetime",
            datetime.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        );
        self.set_reserved("name", name);
    }

    pub fn direction(&self) -> Option<Direction> {
        match self.metadata.get("Direction").and_then(Value::as_str) {
            Some("upwelling") => Some(Direction::Upwelling),
            Some("downwelling") => Some(Direction::Downwelling),
            _ => None,
        }
    }

    pub fn is_dark(&self) -> bool {
        self.metadata
            .get("Dark")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Attach the batch/run stamps the coordinator adds after every
    /// acquisition. These aren't in the reserved-key list because they're
    /// informational metadata, not protocol-critical fields a client could
    /// corrupt the pipeline with.
    pub fn set_batch_run(&mut self, batch: u32, run: &str) {
        self.metadata.insert("Batch".to_string(), batch.into());
        self.metadata.insert("Run".to_string(), run.into());
    }
}

/// An ordered sequence of [`Spectrum`], tagged with a sequence number and a
/// filename prefix. Produced once per cycle of the acquisition coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectraList {
    #[serde(rename = "Spectra")]
    spectra: Vec<Spectrum>,
    #[serde(rename = "SequenceNumber")]
    seq_nr: u32,
    #[serde(skip)]
    prefix: String,
}

impl SpectraList {
    pub fn new(prefix: impl Into<String>, seq_nr: u32) -> Self {
        SpectraList {
            spectra: Vec::new(),
            seq_nr,
            prefix: prefix.into(),
        }
    }

    pub fn push(&mut self, spectrum: Spectrum) {
        self.spectra.push(spectrum);
    }

    pub fn spectra(&self) -> &[Spectrum] {
        &self.spectra
    }

    pub fn seq_nr(&self) -> u32 {
        self.seq_nr
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The canonical output name for this list: `{prefix}{seqNr:06d}.pico`.
    pub fn canonical_name(&self) -> String {
        format!("{}{:06}.pico", self.prefix, self.seq_nr)
    }

    /// Split the list into (light, dark) sub-lists, preserving order.
    /// Used by the output writer when `split = true`.
    pub fn split_by_dark(&self) -> (Vec<Spectrum>, Vec<Spectrum>) {
        let mut light = Vec::new();
        let mut dark = Vec::new();
        for s in &self.spectra {
            if s.is_dark() {
                dark.push(s.clone());
            } else {
                light.push(s.clone());
            }
        }
        (light, dark)
    }

    pub fn is_empty(&self) -> bool {
        self.spectra.is_empty()
    }

    pub fn len(&self) -> usize {
        self.spectra.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_keys_cannot_be_set_by_clients() {
        let mut s = Spectrum::new(vec![1.0, 2.0, 3.0]);
        assert!(matches!(
            s.set_metadata("Direction", "upwelling"),
            Err(CoreError::ProtectedKey(_))
        ));
        assert!(matches!(
            s.set_metadata("Dark", true),
            Err(CoreError::ProtectedKey(_))
        ));
        assert!(matches!(
            s.set_metadata("Datetime", "now"),
            Err(CoreError::ProtectedKey(_))
        ));
        assert!(matches!(
            s.set_metadata("name", "spec1"),
            Err(CoreError::ProtectedKey(_))
        ));
    }

    #[test]
    fn reserved_keys_cannot_be_removed_by_clients() {
        let mut s = Spectrum::new(vec![]);
        s.stamp(Direction::Upwelling, false, Utc::now(), "S_A");
        assert!(matches!(
            s.remove_metadata("Direction"),
            Err(CoreError::ProtectedKey(_))
        ));
    }

    #[test]
    fn non_reserved_metadata_roundtrips() {
        let mut s = Spectrum::new(vec![]);
        s.set_metadata("SerialNumber", "ABC123").unwrap();
        assert_eq!(s.metadata("SerialNumber").unwrap().as_str(), Some("ABC123"));
    }

    #[test]
    fn canonical_name_is_zero_padded() {
        let list = SpectraList::new("spectra/b000000_s", 3);
        assert_eq!(list.canonical_name(), "spectra/b000000_s000003.pico");
    }

    #[test]
    fn split_by_dark_preserves_order() {
        let mut list = SpectraList::new("p", 0);
        let mut dark = Spectrum::new(vec![]);
        dark.stamp(Direction::Upwelling, true, Utc::now(), "S_A");
        let mut light = Spectrum::new(vec![]);
        light.stamp(Direction::Upwelling, false, Utc::now(), "S_A");
        list.push(dark);
        list.push(light);
        let (lights, darks) = list.split_by_dark();
        assert_eq!(lights.len(), 1);
        assert_eq!(darks.len(), 1);
        assert!(!lights[0].is_dark());
        assert!(darks[0].is_dark());
    }
}

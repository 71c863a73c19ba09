//! Representation: one specific encoding of an Adaptation (spec §3).

use serde::{Deserialize, Serialize};

use crate::manifest::segment_index::SegmentIndexData;
use crate::types::Tri;

/// Globally unique identifier for a [`Representation`], stable across
/// manifest updates (spec §3: "unique_id (globally unique)").
#[derive(
	Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::From, derive_more::Display,
)]
pub struct RepresentationUniqueId(pub String);

/// Per-manifest (not globally unique) Representation id, as declared in the
/// source manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::From, derive_more::Display)]
pub struct RepresentationId(pub String);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HdrInfo {
	pub color_depth: Option<u32>,
	pub eotf: Option<String>,
	pub color_space: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId(#[serde(with = "hex_bytes")] pub Vec<u8>);

mod hex_bytes {
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&hex::encode(bytes))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
		let s = String::deserialize(d)?;
		hex::decode(&s).map_err(serde::de::Error::custom)
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentProtection {
	pub system_id: String,
	pub key_ids: Vec<KeyId>,
}

/// CDN metadata for one delivery option of a Representation (spec §3, §4.D).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdnMetadata {
	pub id: String,
	pub base_url: url::Url,
	/// Lower is generally preferred; steering hints from the host override
	/// this at selection time (spec §4.D: "optional steering hints").
	pub priority: u32,
}

/// One specific encoding (codec, bitrate, resolution) within an Adaptation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Representation {
	pub id: RepresentationId,
	pub unique_id: RepresentationUniqueId,
	pub bitrate: u64,
	pub codecs: Vec<String>,
	pub mime_type: Option<String>,
	pub width: Option<u32>,
	pub height: Option<u32>,
	pub frame_rate: Option<f64>,
	pub hdr_info: Option<HdrInfo>,
	pub content_protections: Vec<ContentProtection>,
	/// `None` means "inherit the Adaptation/Period default CDN list".
	pub cdn_metadata: Option<Vec<CdnMetadata>>,
	pub index: SegmentIndexData,
	pub is_supported: Tri,
	pub decipherable: Tri,
	pub should_be_avoided: bool,
}

impl Representation {
	/// A Representation is eligible for loading only when it is known
	/// supported and known decipherable (spec §3: "`decipherable=false` or
	/// `is_supported=false` ⇒ never selected for loading").
	pub fn is_loadable(&self) -> bool {
		!self.is_supported.is_false() && !self.decipherable.is_false() && !self.should_be_avoided
	}

	/// The first codec in [`Self::codecs`] that the host reported as
	/// supported, i.e. the "effective" codec (spec §3).
	pub fn effective_codec<'a>(&'a self, supported: impl Fn(&str) -> bool) -> Option<&'a str> {
		self.codecs.iter().map(String::as_str).find(|c| supported(c))
	}
}

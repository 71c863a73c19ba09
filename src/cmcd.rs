//! CMCD (Common Media Client Data) query-parameter builder (spec §6: "format
//! is byte-exact: CMCD v1 key-value pairs, comma-separated, URL-encoded per
//! CTA-5004").
//!
//! The engine owns no wire format beyond this: it hands transports a ready
//! `CMCD=` query value; where to place it (query string vs. header) is a
//! transport decision.

use crate::config::CmcdOptions;
use crate::types::TrackType;

/// Observed playback/request state fed into the CMCD builder for one
/// request (spec §4.D/§4.I request-metrics callback feeds comparable data).
#[derive(Debug, Clone, Default)]
pub struct CmcdContext {
	pub bitrate_kbps: Option<u64>,
	pub buffer_length_ms: Option<u64>,
	pub object_duration_ms: Option<u64>,
	pub measured_throughput_kbps: Option<u64>,
	pub next_bitrate_kbps: Option<u64>,
	pub top_bitrate_kbps: Option<u64>,
	pub startup: bool,
	pub object_type: Option<CmcdObjectType>,
	pub stream_type_live: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmcdObjectType {
	Init,
	AudioOnly,
	VideoOnly,
	MuxedAudioVideo,
}

impl CmcdObjectType {
	fn code(self) -> &'static str {
		match self {
			CmcdObjectType::Init => "i",
			CmcdObjectType::AudioOnly => "a",
			CmcdObjectType::VideoOnly => "v",
			CmcdObjectType::MuxedAudioVideo => "av",
		}
	}
}

/// Builds the `CMCD` query value for one segment request.
pub struct CmcdBuilder<'a> {
	options: &'a CmcdOptions,
}

impl<'a> CmcdBuilder<'a> {
	pub fn new(options: &'a CmcdOptions) -> Self {
		Self { options }
	}

	/// Returns the raw, comma-separated, URL-encoded CMCD key-value string
	/// (CTA-5004 §3.2), or `None` if there is nothing worth sending.
	pub fn build(&self, track_type: TrackType, ctx: &CmcdContext) -> String {
		let mut fields: Vec<(&str, String)> = Vec::new();

		if let Some(br) = ctx.bitrate_kbps {
			fields.push(("br", br.to_string()));
		}
		if let Some(bl) = ctx.buffer_length_ms {
			fields.push(("bl", (round_to_100(bl)).to_string()));
		}
		fields.push(("cid", quote(&self.options.content_id)));
		if let Some(d) = ctx.object_duration_ms {
			fields.push(("d", d.to_string()));
		}
		if let Some(mtp) = ctx.measured_throughput_kbps {
			fields.push(("mtp", round_to_100(mtp).to_string()));
		}
		if let Some(nbr) = ctx.next_bitrate_kbps {
			fields.push(("nbr", nbr.to_string()));
		}
		if let Some(ot) = ctx.object_type {
			fields.push(("ot", ot.code().to_string()));
		}
		fields.push(("sid", quote(&self.options.session_id)));
		if ctx.startup {
			fields.push(("su", String::new()));
		}
		if ctx.stream_type_live {
			fields.push(("st", "l".to_string()));
		}
		if let Some(tb) = ctx.top_bitrate_kbps {
			fields.push(("tb", tb.to_string()));
		}
		let _ = track_type;

		fields.sort_by(|a, b| a.0.cmp(b.0));
		let joined = fields
			.into_iter()
			.map(|(k, v)| if v.is_empty() { k.to_string() } else { format!("{k}={v}") })
			.collect::<Vec<_>>()
			.join(",");

		url::form_urlencoded::byte_serialize(joined.as_bytes()).collect()
	}
}

fn quote(s: &str) -> String {
	format!("\"{s}\"")
}

/// CTA-5004 §3.2: numeric tokens describing bitrate/throughput are rounded
/// to the nearest 100 to reduce fingerprinting surface.
fn round_to_100(v: u64) -> u64 {
	((v + 50) / 100) * 100
}

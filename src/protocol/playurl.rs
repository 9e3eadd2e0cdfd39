//! Download link resolution.
//!
//! With `fnval=16` the playurl endpoint returns DASH streams with separated
//! audio variants:
//!
//! ```json
//! {
//!     "dash": {
//!         "audio": [
//!             { "id": 30280, "bandwidth": 319173, "base_url": "https://..." },
//!             { "id": 30232, "bandwidth": 129304, "baseUrl": "https://..." }
//!         ]
//!     }
//! }
//! ```
//!
//! The variant with the highest reported bandwidth wins, regardless of its
//! nominal quality id. Direct URLs are short-lived and must be consumed
//! promptly.

use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct PlayUrl {
    pub dash: Option<Dash>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Dash {
    #[serde(default)]
    pub audio: Vec<AudioVariant>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AudioVariant {
    #[serde(default)]
    pub id: u64,

    #[serde(default)]
    pub bandwidth: u64,

    /// The direct download URL; the field name varies by API version.
    #[serde(alias = "baseUrl")]
    pub base_url: String,
}

impl PlayUrl {
    /// Picks the audio variant with the highest reported bandwidth.
    #[must_use]
    pub fn best_audio(&self) -> Option<&AudioVariant> {
        self.dash
            .as_ref()?
            .audio
            .iter()
            .max_by_key(|variant| variant.bandwidth)
    }
}

//! Signing key discovery.
//!
//! The navigation endpoint exposes two image URLs whose filename stems are
//! the current signing keys:
//!
//! ```json
//! {
//!     "wbi_img": {
//!         "img_url": "https://i0.hdslb.com/bfs/wbi/7cd08494....png",
//!         "sub_url": "https://i0.hdslb.com/bfs/wbi/4932caff....png"
//!     }
//! }
//! ```

use serde::Deserialize;

use crate::wbi::SigningKeys;

#[derive(Clone, Debug, Deserialize)]
pub struct Nav {
    pub wbi_img: WbiImg,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WbiImg {
    pub img_url: String,
    pub sub_url: String,
}

impl WbiImg {
    /// Extracts the signing keys from the two image URLs.
    ///
    /// The key is the final path segment with its extension removed.
    /// Returns `None` when either URL has no usable filename stem, keeping
    /// the both-or-neither invariant of [`SigningKeys`].
    #[must_use]
    pub fn keys(&self) -> Option<SigningKeys> {
        let img_key = key_from_url(&self.img_url)?;
        let sub_key = key_from_url(&self.sub_url)?;
        Some(SigningKeys { img_key, sub_key })
    }
}

fn key_from_url(url: &str) -> Option<String> {
    let filename = url.rsplit('/').next()?;
    let stem = filename.split('.').next()?;
    if stem.is_empty() {
        return None;
    }
    Some(stem.to_owned())
}

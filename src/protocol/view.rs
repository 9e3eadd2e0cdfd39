//! Item metadata.
//!
//! The view endpoint resolves an item id to its title, cover, description
//! and the ordered list of segments (pages):
//!
//! ```json
//! {
//!     "title": "...",
//!     "pic": "https://...jpg",
//!     "desc": "...",
//!     "videos": 3,
//!     "pages": [
//!         { "page": 1, "cid": 1176840, "part": "..." },
//!         ...
//!     ]
//! }
//! ```
//!
//! `page` numbers are 1-based and strictly increasing in sequence order.

use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct View {
    pub title: String,

    /// Cover image URL.
    pub pic: String,

    #[serde(default)]
    pub desc: String,

    /// Total segment count.
    pub videos: u32,

    pub pages: Vec<Page>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Page {
    /// 1-based segment number.
    pub page: u32,

    /// Segment id used for link resolution and transcripts.
    pub cid: u64,

    /// Segment title.
    #[serde(default)]
    pub part: String,
}

//! AI summary and outline.
//!
//! The conclusion endpoint returns an optional model-generated summary of a
//! segment with a timestamped chapter outline:
//!
//! ```json
//! {
//!     "model_result": {
//!         "result_type": 2,
//!         "summary": "...",
//!         "outline": [
//!             {
//!                 "title": "...",
//!                 "timestamp": 65,
//!                 "part_outline": [
//!                     { "timestamp": 80, "content": "..." }
//!                 ]
//!             }
//!         ]
//!     }
//! }
//! ```
//!
//! Items without a generated summary come back with an empty
//! `model_result`; that is absence, not an error.

use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct Conclusion {
    pub model_result: Option<ModelResult>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ModelResult {
    #[serde(default)]
    pub result_type: i64,

    #[serde(default)]
    pub summary: String,

    #[serde(default)]
    pub outline: Option<Vec<OutlineItem>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct OutlineItem {
    #[serde(default)]
    pub title: String,

    /// Chapter start, in seconds from the beginning of the segment.
    #[serde(default)]
    pub timestamp: u64,

    #[serde(default)]
    pub part_outline: Vec<PartOutline>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PartOutline {
    #[serde(default)]
    pub timestamp: u64,

    #[serde(default)]
    pub content: String,
}

//! Wire types for the upstream API.
//!
//! Every endpoint wraps its payload in a common envelope:
//!
//! ```json
//! {
//!     "code": 0,
//!     "message": "0",
//!     "data": { ... }
//! }
//! ```
//!
//! `code` is the protocol status: `0` means success, anything else is an
//! upstream rejection carrying a human-readable `message`. The endpoints:
//!
//! * [`nav`] - signing key discovery
//! * [`view`] - item metadata and segment listing
//! * [`playurl`] - per-segment download link resolution
//! * [`conclusion`] - AI summary and outline

pub mod conclusion;
pub mod nav;
pub mod playurl;
pub mod view;

pub use conclusion::Conclusion;
pub use nav::Nav;
pub use playurl::PlayUrl;
pub use view::View;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Common response envelope of the upstream API.
#[derive(Clone, Debug, Deserialize)]
pub struct Response<T> {
    /// Protocol status code; `0` is success.
    pub code: i64,

    /// Human-readable status message.
    #[serde(default)]
    pub message: String,

    /// Endpoint payload, present on success.
    pub data: Option<T>,
}

impl<T> Response<T> {
    /// Unwraps the payload of a successful response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UpstreamRejection`] when the protocol status is
    /// non-zero or the payload is missing.
    pub fn into_data(self) -> Result<T> {
        if self.code != 0 {
            return Err(Error::UpstreamRejection {
                code: self.code,
                message: self.message,
            });
        }
        self.data.ok_or(Error::UpstreamRejection {
            code: self.code,
            message: "response without data".to_owned(),
        })
    }
}

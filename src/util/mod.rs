//! Utility functions shared by the registry and the service layer.
//!
//! - **URL validation**: syntax checks for source URLs, plus SSRF-focused
//!   rejection of localhost and private networks
//!
//! # Examples
//!
//! ```
//! use feedsieve::util::{parse_http_url, validate_public_url};
//!
//! assert!(parse_http_url("http://10.0.0.1/feed.xml").is_ok());
//! assert!(validate_public_url("http://10.0.0.1/feed.xml").is_err());
//! ```

mod url_validator;

pub use url_validator::{parse_http_url, validate_public_url, UrlValidationError};

//! HTTP execution layer.
//!
//! - [`executor`]: sends one request per batch attempt and classifies the outcome
//! - [`prepare`]: request construction and dry-run transcripts
//! - [`response`]: body decoding, `Retry-After` and quota parsing
//! - [`cookies`]: session cookie store collaborator
//! - [`form`]: form body encoders
//! - [`error`]: per-attempt error taxonomy

pub mod cookies;
pub mod error;
pub mod executor;
pub mod form;
pub mod prepare;
pub mod response;

pub use cookies::{CookieStore, JarCookieStore};
pub use error::RequestError;
pub use executor::{HttpExecutor, HttpResponse};
pub use form::{EncodedForm, FormEncoder, FormError, MultipartFormEncoder, encode_urlencoded};
pub use prepare::PreparedRequest;
pub use response::{HeaderList, RateLimitQuota, ResponseBody, parse_retry_after};

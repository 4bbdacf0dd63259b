//! HTTP/1.1 subset: request parsing, response assembly and file resolution.
//!
//! Only `GET` with `HTTP/1.1` is accepted. Responses are always
//! `text/html` and carry one of 200, 400, 403, 404 or 500.

pub mod file;
pub mod parser;
pub mod request;
pub mod response;

pub use file::{DocRoot, MappedFile, ResolveError};
pub use parser::{ParseResult, RequestParser};
pub use request::CheckState;
pub use response::{ResponseBuffer, Status};

//! Request and response types exchanged between strategies and servers.

mod request;
mod response;

pub use request::Request;
pub use response::{CancelCause, Response, ResponseError};

//! SIP type system: methods, status codes, URIs, headers and messages

pub mod address;
pub mod headers;
pub mod message;
pub mod method;
pub mod status;
pub mod uri;
pub mod via;

pub use address::Address;
pub use headers::Headers;
pub use message::{CSeq, MessageExt, Request, Response, SipMessage};
pub use method::Method;
pub use status::StatusCode;
pub use uri::{Scheme, Uri};
pub use via::{Via, BRANCH_MAGIC_COOKIE};

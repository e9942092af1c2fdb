//! voxide-sip-core
//!
//! The SIP layer of the voxide stack: message model and parser, UDP/TCP
//! transports, a reduced transaction machinery, dialogs and digest auth.
//! The session layer in the `voxide` crate drives everything here; this
//! crate knows nothing about media.

pub mod auth;
pub mod dialog;
pub mod error;
pub mod parser;
pub mod transaction;
pub mod transport;
pub mod types;
pub mod user_agent;

pub use dialog::{
    request_dialog_id, response_dialog_id, Dialog, DialogId, DialogState,
};
pub use error::{Result, SipError};
pub use parser::parse_message;
pub use transaction::{ClientTransaction, ServerTransaction, TxKey, TRANSACTION_TIMEOUT};
pub use transport::{Incoming, TlsConfig, TransportKind, TransportLayer};
pub use types::{
    Address, CSeq, Headers, MessageExt, Method, Request, Response, SipMessage, StatusCode, Uri,
    Via,
};
pub use user_agent::{
    new_branch, new_call_id, new_tag, resolve_uri, IncomingRequest, UserAgent,
};

use std::sync::OnceLock;

/// Whether SIP_DEBUG tracing of full messages is enabled
pub fn sip_debug_enabled() -> bool {
    static FLAG: OnceLock<bool> = OnceLock::new();
    *FLAG.get_or_init(|| env_flag("SIP_DEBUG"))
}

pub(crate) fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| {
            let v = v.trim().to_ascii_lowercase();
            !v.is_empty() && v != "0" && v != "false" && v != "off"
        })
        .unwrap_or(false)
}

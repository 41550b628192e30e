//! Requester identities and the reply sink seam
//!
//! A pending remote lookup never holds a connection handle. It holds a
//! [`ClientId`] and asks the [`ReplySink`] whether that id is still live at
//! completion time.

use std::fmt;

/// WHOIS numeric used for every enrichment line (RPL_WHOISSPECIAL)
pub const RPL_WHOISSPECIAL: u16 = 320;

/// Stable identifier of a connected client
///
/// Ids are allocated monotonically and never reused, so a stale id can only
/// ever fail the liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// What kind of entity a WHOIS target is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    User,
    /// U-lined services (NickServ and friends)
    Service,
    Server,
}

/// The client being looked up
#[derive(Debug, Clone)]
pub struct WhoisTarget {
    pub name: String,
    pub ip: Option<String>,
    pub kind: ClientKind,
}

impl WhoisTarget {
    pub fn user(name: impl Into<String>, ip: Option<&str>) -> Self {
        Self {
            name: name.into(),
            ip: ip.map(str::to_string),
            kind: ClientKind::User,
        }
    }

    /// The target IP, if it has a non-empty one
    pub fn address(&self) -> Option<&str> {
        self.ip.as_deref().map(str::trim).filter(|ip| !ip.is_empty())
    }
}

/// One WHOIS query that may receive an enrichment line
#[derive(Debug, Clone)]
pub struct WhoisRequest {
    /// Who asked, and where the line is delivered
    pub requester: ClientId,
    pub requester_is_oper: bool,
    pub target: WhoisTarget,
}

/// Delivery capability provided by the host
pub trait ReplySink: Send + Sync {
    /// Whether `client` is still connected
    fn is_live(&self, client: ClientId) -> bool;

    /// Append one numeric line to `destination`'s reply.
    ///
    /// Returns `false` when the destination is gone.
    fn deliver(&self, destination: ClientId, numeric: u16, text: &str) -> bool;
}

//! Client request submitted to simulated servers.

use std::time::SystemTime;

use bytes::Bytes;

/// A request issued against the cluster. Immutable once created; cloning is
/// cheap since the payload is reference-counted.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Request {
    /// Caller-assigned ID, unique per logical request.
    id: String,

    /// Creation time.
    timestamp: SystemTime,

    /// Opaque payload, never interpreted by servers.
    payload: Bytes,

    /// ID of a sibling request issued elsewhere for the same logical
    /// operation, if this is a tied request.
    tied_to: Option<String>,
}

impl Request {
    /// Creates a new request stamped with the current time.
    pub fn new(id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Request {
            id: id.into(),
            timestamp: SystemTime::now(),
            payload: payload.into(),
            tied_to: None,
        }
    }

    /// Creates a new request tied to the sibling request `tied_to`.
    pub fn tied(
        id: impl Into<String>,
        payload: impl Into<Bytes>,
        tied_to: impl Into<String>,
    ) -> Self {
        Request {
            tied_to: Some(tied_to.into()),
            ..Self::new(id, payload)
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn tied_to(&self) -> Option<&str> {
        self.tied_to.as_deref()
    }

    /// Default request ID extraction function used by servers.
    pub fn id_of(req: &Request) -> String {
        req.id.clone()
    }
}

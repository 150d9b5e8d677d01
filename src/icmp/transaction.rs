use chrono::{DateTime, Utc};

use super::message::{self, IcmpMessage};
use super::tuple::IcmpTuple;

pub const ORPHANED_REQUEST: &str = "Request was received without an associated response.";
pub const ORPHANED_RESPONSE: &str = "Response was received without an associated request.";
pub const DUPLICATE_REQUEST: &str =
    "Another request with the same Id and Seq was received so this request was closed without receiving a response.";

/// A request, a response, or both
#[derive(Debug, Clone, PartialEq)]
pub struct IcmpTransaction {
    pub ts: DateTime<Utc>,
    pub tuple: IcmpTuple,
    pub request: Option<IcmpMessage>,
    pub response: Option<IcmpMessage>,
    pub notes: Vec<String>,
}

impl IcmpTransaction {
    pub fn from_request(tuple: IcmpTuple, request: IcmpMessage) -> Self {
        Self {
            ts: request.ts,
            tuple,
            request: Some(request),
            response: None,
            notes: Vec::new(),
        }
    }

    /// Response without a stored request; the tuple is flipped so it reads
    /// in request direction.
    pub fn orphaned_response(tuple: IcmpTuple, response: IcmpMessage) -> Self {
        Self {
            ts: response.ts,
            tuple: tuple.reverse(),
            request: None,
            response: Some(response),
            notes: vec![ORPHANED_RESPONSE.to_string()],
        }
    }

    pub fn add_note(&mut self, note: &str) {
        self.notes.push(note.to_string());
    }

    /// Missing request, an error message type on either side, or a request
    /// that never got its response
    pub fn has_error(&self) -> bool {
        let version = self.tuple.version;
        let Some(request) = &self.request else {
            return true;
        };
        if message::is_error(version, request.icmp_type) {
            return true;
        }
        if let Some(response) = &self.response {
            if message::is_error(version, response.icmp_type) {
                return true;
            }
        }
        message::is_request(version, request.icmp_type) && self.response.is_none()
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.response
            .as_ref()
            .or(self.request.as_ref())
            .map_or(self.ts, |m| m.ts)
    }
}

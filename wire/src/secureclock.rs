//! Types for secure timestamp generation.

use crate::keymaster::{ErrorCode, KmResponse};
use alloc::vec::Vec;

/// Timestamp in milliseconds since an arbitrary epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub milliseconds: i64,
}

/// A timestamp token, HMAC-ed with a key shared with other secure components.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TimeStampToken {
    pub challenge: i64,
    pub timestamp: Timestamp,
    pub mac: Vec<u8>,
}

#[derive(Debug)]
pub struct GenerateTimestampTokenRequest {
    pub challenge: i64,
}

#[derive(Debug, Default)]
pub struct GenerateTimestampTokenResponse {
    pub error: ErrorCode,
    pub token: TimeStampToken,
}

impl KmResponse for GenerateTimestampTokenResponse {
    fn error(&self) -> ErrorCode {
        self.error
    }
    fn set_error(&mut self, error: ErrorCode) {
        self.error = error;
    }
}

//! Types for shared-secret HMAC negotiation.

use crate::keymaster::{ErrorCode, KmResponse};
use alloc::vec::Vec;

/// Per-participant parameters for the shared HMAC key agreement.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HmacSharingParameters {
    pub seed: Vec<u8>,
    pub nonce: [u8; 32],
}

#[derive(Debug)]
pub struct GetHmacSharingParametersRequest {}

#[derive(Debug, Default)]
pub struct GetHmacSharingParametersResponse {
    pub error: ErrorCode,
    pub params: HmacSharingParameters,
}

#[derive(Debug)]
pub struct ComputeSharedHmacRequest {
    pub params_array: Vec<HmacSharingParameters>,
}

#[derive(Debug, Default)]
pub struct ComputeSharedHmacResponse {
    pub error: ErrorCode,
    pub sharing_check: Vec<u8>,
}

impl KmResponse for GetHmacSharingParametersResponse {
    fn error(&self) -> ErrorCode {
        self.error
    }
    fn set_error(&mut self, error: ErrorCode) {
        self.error = error;
    }
}

impl KmResponse for ComputeSharedHmacResponse {
    fn error(&self) -> ErrorCode {
        self.error
    }
    fn set_error(&mut self, error: ErrorCode) {
        self.error = error;
    }
}

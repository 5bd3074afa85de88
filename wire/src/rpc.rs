//! Local types that are equivalent to those of the remote key provisioning
//! HAL interface.

use alloc::vec::Vec;

/// Remote provisioning status codes. These occupy a separate (positive)
/// numeric space from the Keymaster [`crate::keymaster::ErrorCode`]s.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    Failed = 1,
    InvalidMac = 2,
    ProductionKeyInTestRequest = 3,
    TestKeyInProductionRequest = 4,
    InvalidEek = 5,
    Removed = 6,
}

impl Default for ErrorCode {
    fn default() -> Self {
        ErrorCode::Ok
    }
}

/// A COSE_Mac0 structure over a COSE_Key holding a candidate public key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MacedPublicKey {
    pub maced_key: Vec<u8>,
}

/// CBOR-encoded device information map.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_info: Vec<u8>,
}

/// A COSE_Encrypt structure holding the signed CSR payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProtectedData {
    pub protected_data: Vec<u8>,
}

#[derive(Debug)]
pub struct GenerateRkpKeyRequest {
    pub test_mode: bool,
}

#[derive(Debug, Default)]
pub struct GenerateRkpKeyResponse {
    pub error: ErrorCode,
    pub maced_public_key: MacedPublicKey,
    pub key_blob: Vec<u8>,
}

#[derive(Debug)]
pub struct GenerateCsrRequest {
    pub test_mode: bool,
    pub keys_to_sign: Vec<MacedPublicKey>,
    pub endpoint_enc_cert_chain: Vec<u8>,
    pub challenge: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct GenerateCsrResponse {
    pub error: ErrorCode,
    pub keys_to_sign_mac: Vec<u8>,
    pub device_info: DeviceInfo,
    pub protected_data: ProtectedData,
}

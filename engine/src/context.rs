//! Interfaces onto the engine's external collaborators: the context that owns
//! key-blob handling and device state, the per-algorithm factories, policy
//! enforcement, secure key storage and remote provisioning.

use alloc::{boxed::Box, rc::Rc, vec::Vec};
use skm_common::{authset::AuthorizationSet, cbor, crypto::KeyMaterial, Error};
use skm_wire::keymaster::{
    Algorithm, BlockMode, Certificate, Digest, KeyFormat, KeyPurpose, KmVersion, PaddingMode,
    VerifyAuthorizationRequest, VerifyAuthorizationResponse,
};
use skm_wire::secureclock::TimeStampToken;
use skm_wire::sharedsecret::HmacSharingParameters;

use crate::operation::OpHandle;

/// Identifier for a key, derived from its blob by the enforcement policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct KeyId(pub u64);

/// A parsed key: the key material plus the two authorization lists bound to
/// it, and a handle to the factory for its algorithm.
pub struct Key {
    pub material: KeyMaterial,
    /// Authorizations that a hardware root would enforce.
    pub hw_enforced: AuthorizationSet,
    /// Authorizations enforced only by software.
    pub sw_enforced: AuthorizationSet,
    pub factory: Rc<dyn KeyFactory>,
}

impl Key {
    /// Union view over both authorization lists, hardware-enforced entries
    /// first.
    pub fn authorizations(&self) -> Result<AuthorizationSet, Error> {
        let mut all = AuthorizationSet::new();
        all.try_extend_from_slice(&self.hw_enforced)?;
        all.try_extend_from_slice(&self.sw_enforced)?;
        Ok(all)
    }
}

impl Clone for Key {
    fn clone(&self) -> Self {
        Self {
            material: self.material.clone(),
            hw_enforced: self.hw_enforced.clone(),
            sw_enforced: self.sw_enforced.clone(),
            factory: self.factory.clone(),
        }
    }
}

/// Output of key generation or import.
pub struct KeyCreationResult {
    pub key_blob: Vec<u8>,
    pub hw_enforced: AuthorizationSet,
    pub sw_enforced: AuthorizationSet,
    pub certificate_chain: Vec<Certificate>,
}

/// Result of unwrapping a wrapped key blob.
pub struct UnwrappedKey {
    pub key_description: AuthorizationSet,
    pub key_format: KeyFormat,
    pub secret_key: Vec<u8>,
}

/// Per-algorithm key factory.
pub trait KeyFactory {
    /// Generate a fresh key described by `key_description`, optionally signing
    /// its certificate with `attest_key`.
    fn generate_key(
        &self,
        key_description: &AuthorizationSet,
        attest_key: Option<Key>,
        issuer_subject: &[u8],
    ) -> Result<KeyCreationResult, Error>;

    /// Import externally supplied key material.
    fn import_key(
        &self,
        key_description: &AuthorizationSet,
        key_format: KeyFormat,
        key_data: &[u8],
        attest_key: Option<Key>,
        issuer_subject: &[u8],
    ) -> Result<KeyCreationResult, Error>;

    fn supported_import_formats(&self) -> &[KeyFormat];
    fn supported_export_formats(&self) -> &[KeyFormat];

    /// Return the operation factory for `purpose`, if this key type supports
    /// it.
    fn operation_factory(&self, purpose: KeyPurpose) -> Option<Rc<dyn OperationFactory>>;

    /// Format the public part of `key` for export in the requested format.
    fn format_key_material(&self, key: &Key, key_format: KeyFormat) -> Result<Vec<u8>, Error>;
}

/// Output from a single step of an in-flight operation.
#[derive(Debug, Default)]
pub struct OperationOutput {
    pub output_params: AuthorizationSet,
    pub output: Vec<u8>,
    /// How much of the step's input was consumed; streaming modes may consume
    /// less than everything they were given.
    pub input_consumed: usize,
}

/// A stateful cryptographic session created by an [`OperationFactory`].
pub trait CryptoOperation {
    /// Start the operation, returning any output parameters (e.g. a generated
    /// nonce).
    fn begin(&mut self, params: &AuthorizationSet) -> Result<AuthorizationSet, Error>;

    /// Feed input data to the operation.
    fn update(&mut self, params: &AuthorizationSet, input: &[u8])
        -> Result<OperationOutput, Error>;

    /// Complete the operation.
    fn finish(
        &mut self,
        params: &AuthorizationSet,
        input: &[u8],
        signature: &[u8],
    ) -> Result<OperationOutput, Error>;

    /// Abandon the operation.
    fn abort(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Factory for in-flight operations for one (algorithm, purpose) pairing.
pub trait OperationFactory {
    fn supported_block_modes(&self) -> &[BlockMode];
    fn supported_padding_modes(&self) -> &[PaddingMode];
    fn supported_digests(&self) -> &[Digest];

    /// Create an operation over `key`, which is consumed.
    fn create_operation(
        &self,
        key: Key,
        params: &AuthorizationSet,
    ) -> Result<Box<dyn CryptoOperation>, Error>;
}

/// Policy checks applied to key use.
pub trait EnforcementPolicy {
    /// Authorize one step of an operation. `op_handle` is zero when
    /// `is_begin_operation` is set.
    fn authorize_operation(
        &mut self,
        purpose: KeyPurpose,
        key_id: KeyId,
        auths: &AuthorizationSet,
        op_params: &AuthorizationSet,
        op_handle: OpHandle,
        is_begin_operation: bool,
    ) -> Result<(), Error>;

    /// Derive a stable identifier for a key blob.
    fn create_key_id(&self, key_blob: &[u8]) -> Option<KeyId>;

    fn in_early_boot(&self) -> bool;
    fn early_boot_ended(&mut self);
    fn device_locked(&mut self, password_only: bool);

    fn get_hmac_sharing_parameters(&mut self) -> Result<HmacSharingParameters, Error>;
    fn compute_shared_hmac(
        &mut self,
        params: &[HmacSharingParameters],
    ) -> Result<Vec<u8>, Error>;
    fn verify_authorization(&mut self, req: &VerifyAuthorizationRequest)
        -> VerifyAuthorizationResponse;
    fn generate_timestamp_token(&mut self, challenge: i64) -> Result<TimeStampToken, Error>;
}

/// Storage collaborator used to invalidate single-use keys.
pub trait SecureKeyStorage {
    fn delete_key(&mut self, key_id: KeyId) -> Result<(), Error>;
}

/// Signing algorithm used for the CSR's COSE_Sign1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CsrSigningAlgorithm {
    ES256,
    EdDSA,
}

/// Device-wide remote provisioning state.
pub trait RemoteProvisioningContext {
    /// Compute an HMAC-SHA256 tag with the device's MACing key.
    fn generate_hmac_sha256(&self, input: &[u8]) -> Result<Vec<u8>, Error>;

    /// The persisted device private signing key.
    fn device_private_key(&self) -> Result<Vec<u8>, Error>;

    /// A deep copy of the persisted boot certificate chain, as a CBOR array.
    fn bcc(&self) -> Result<cbor::value::Value, Error>;

    /// Generate a fresh device key and boot certificate chain (test mode
    /// only), returning `(private_key, bcc)`.
    fn generate_bcc(&self) -> Result<(Vec<u8>, cbor::value::Value), Error>;

    /// Build the device information map, CBOR-encoded with canonically
    /// ordered keys.
    fn create_device_info(&self) -> Result<cbor::value::Value, Error>;

    fn signing_algorithm(&self) -> CsrSigningAlgorithm {
        CsrSigningAlgorithm::ES256
    }
}

/// The engine's view of its environment. Provides key factories, policy
/// enforcement, system version state, key-blob handling, and the optional
/// collaborators.
pub trait KeymasterContext {
    /// Which HAL version this context implements.
    fn km_version(&self) -> KmVersion;

    /// Current `(os_version, os_patchlevel)`.
    fn system_version(&self) -> (u32, u32);

    /// Update the system version state; used by `Configure`.
    fn set_system_version(&mut self, os_version: u32, os_patchlevel: u32) -> Result<(), Error>;

    fn supported_algorithms(&self) -> &[Algorithm];
    fn key_factory(&self, algorithm: Algorithm) -> Option<Rc<dyn KeyFactory>>;
    fn operation_factory(
        &self,
        algorithm: Algorithm,
        purpose: KeyPurpose,
    ) -> Option<Rc<dyn OperationFactory>>;

    /// Parse an opaque key blob into a [`Key`].
    fn parse_key_blob(
        &self,
        key_blob: &[u8],
        additional_params: &AuthorizationSet,
    ) -> Result<Key, Error>;

    /// Re-encrypt a key blob bound to old version info, returning the new
    /// blob.
    fn upgrade_key_blob(
        &self,
        key_blob: &[u8],
        upgrade_params: &AuthorizationSet,
    ) -> Result<Vec<u8>, Error>;

    fn delete_key(&mut self, key_blob: &[u8]) -> Result<(), Error>;
    fn delete_all_keys(&mut self) -> Result<(), Error>;

    fn add_rng_entropy(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Issue an attestation certificate chain for `key`.
    fn generate_attestation(
        &self,
        key: &Key,
        attest_params: &AuthorizationSet,
    ) -> Result<Vec<Certificate>, Error>;

    /// Check a trusted confirmation token against the accumulated signed
    /// data.
    fn check_confirmation_token(&self, data: &[u8], token: &[u8]) -> Result<(), Error>;

    /// Unwrap a wrapped key transported under `wrapping_key_blob`.
    fn unwrap_key(
        &self,
        wrapped_key_data: &[u8],
        wrapping_key_blob: &[u8],
        unwrapping_params: &AuthorizationSet,
        masking_key: &[u8],
    ) -> Result<UnwrappedKey, Error>;

    fn enforcement_policy(&mut self) -> Option<&mut dyn EnforcementPolicy>;
    fn secure_key_storage(&mut self) -> Option<&mut dyn SecureKeyStorage>;
    fn remote_provisioning_context(&mut self)
        -> Option<&mut dyn RemoteProvisioningContext>;
}

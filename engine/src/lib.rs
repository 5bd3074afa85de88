//! Software implementation of the Keymaster key-management engine.
//!
//! [`SoftKeymaster`] implements every top-level request: it validates the
//! request, consults its [`context::KeymasterContext`] for factories and
//! policy, produces or mutates state (operations, keys), and returns a typed
//! response carrying an error code. Errors never cross the API as panics.
//!
//! The engine is not internally synchronized; callers must serialize requests
//! against a given instance.

#![no_std]
extern crate alloc;

use alloc::{boxed::Box, rc::Rc, vec::Vec};
use core::cmp::Ordering;
use log::error;
use skm_common::{
    authset::AuthorizationSet, crypto, get_bool_tag_value, km_err, tag, try_to_vec, Error,
};
use skm_wire::keymaster::{
    AddRngEntropyRequest, AddRngEntropyResponse, AttestKeyRequest, AttestKeyResponse,
    AttestationKey, Certificate, ConfigureRequest, ConfigureResponse, DateTime,
    DeleteAllKeysRequest, DeleteAllKeysResponse, DeleteKeyRequest, DeleteKeyResponse,
    DeviceLockedRequest, DeviceLockedResponse, EarlyBootEndedRequest, EarlyBootEndedResponse,
    ErrorCode, ExportKeyRequest, ExportKeyResponse, GenerateKeyRequest, GenerateKeyResponse,
    GetKeyCharacteristicsRequest, GetKeyCharacteristicsResponse, GetVersion2Request,
    GetVersion2Response, GetVersionRequest, GetVersionResponse, HardwareAuthenticatorType,
    ImportKeyRequest, ImportKeyResponse, ImportWrappedKeyRequest, ImportWrappedKeyResponse,
    KeyFormat, KeyParam, KmResponse, KmVersion, SupportedAlgorithmsRequest,
    SupportedAlgorithmsResponse,
    SupportedBlockModesRequest, SupportedBlockModesResponse, SupportedDigestsRequest,
    SupportedDigestsResponse, SupportedExportFormatsRequest, SupportedExportFormatsResponse,
    SupportedImportFormatsRequest, SupportedImportFormatsResponse, SupportedPaddingModesRequest,
    SupportedPaddingModesResponse, Tag, UpgradeKeyRequest, UpgradeKeyResponse,
    VerifyAuthorizationRequest, VerifyAuthorizationResponse, KM_DATE,
    UNDEFINED_EXPIRATION_DATETIME,
};
use skm_wire::keymaster::Algorithm;
use skm_wire::secureclock::{GenerateTimestampTokenRequest, GenerateTimestampTokenResponse};
use skm_wire::sharedsecret::{
    ComputeSharedHmacRequest, ComputeSharedHmacResponse, GetHmacSharingParametersRequest,
    GetHmacSharingParametersResponse,
};

pub mod context;
pub mod operation;
mod rkp;


use context::{Key, KeyCreationResult, KeyFactory, KeymasterContext};
use operation::OperationTable;

/// Default number of concurrently live operations.
pub const DEFAULT_OPERATION_TABLE_SIZE: usize = 16;

/// Highest message version supported for a given HAL version and build date.
pub fn max_message_version(km_version: KmVersion, km_date: u32) -> u32 {
    match km_version {
        KmVersion::Keymaster1 => 1,
        KmVersion::Keymaster11 => 2,
        KmVersion::Keymaster2
        | KmVersion::Keymaster3
        | KmVersion::Keymaster4
        | KmVersion::Keymaster41 => 3,
        KmVersion::KeyMint1 | KmVersion::KeyMint2 | KmVersion::KeyMint3 => {
            if km_date >= KM_DATE {
                4
            } else {
                3
            }
        }
    }
}

/// Build a response that carries just the error mapped from `err`, logging
/// the failed operation along the way.
pub(crate) fn op_error_rsp<R: KmResponse + Default>(op: &'static str, err: Error) -> R {
    error!("{} failed: {:?}", op, err);
    let mut rsp = R::default();
    rsp.set_error(err.into());
    rsp
}

/// The software Keymaster engine.
pub struct SoftKeymaster<'a> {
    /// Provider of key factories, policy enforcement and device-specific
    /// state. Owned exclusively by the engine.
    pub(crate) context: Box<dyn KeymasterContext>,

    /// Implementations of the raw cryptographic primitives used for remote
    /// provisioning.
    pub(crate) imp: crypto::Implementation<'a>,

    /// The operation table.
    pub(crate) operations: OperationTable,

    /// Message version negotiated with the caller, set only by
    /// `get_version2`.
    message_version: u32,
}

impl<'a> SoftKeymaster<'a> {
    /// Create a new engine instance with the given operation-table capacity.
    pub fn new(
        context: Box<dyn KeymasterContext>,
        imp: crypto::Implementation<'a>,
        operation_table_size: usize,
    ) -> Self {
        let message_version = max_message_version(context.km_version(), KM_DATE);
        Self { context, imp, operations: OperationTable::new(operation_table_size), message_version }
    }

    /// The message version negotiated by the most recent `get_version2` (or
    /// this engine's maximum, if none has run).
    pub fn message_version(&self) -> u32 {
        self.message_version
    }

    pub fn get_version(&self, _req: GetVersionRequest) -> GetVersionResponse {
        GetVersionResponse { error: ErrorCode::Ok, major_ver: 2, minor_ver: 0, subminor_ver: 0 }
    }

    /// Report version information and negotiate the message version down to
    /// the smaller of the two advertised maxima.
    pub fn get_version2(&mut self, req: GetVersion2Request) -> GetVersion2Response {
        let km_version = self.context.km_version();
        let rsp = GetVersion2Response {
            error: ErrorCode::Ok,
            km_version,
            km_date: KM_DATE,
            max_message_version: max_message_version(km_version, KM_DATE),
        };
        self.message_version = core::cmp::min(req.max_message_version, rsp.max_message_version);
        rsp
    }

    pub fn supported_algorithms(
        &self,
        _req: SupportedAlgorithmsRequest,
    ) -> SupportedAlgorithmsResponse {
        match try_to_vec(self.context.supported_algorithms()) {
            Ok(algorithms) => SupportedAlgorithmsResponse { error: ErrorCode::Ok, algorithms },
            Err(e) => op_error_rsp("SupportedAlgorithms", e),
        }
    }

    pub fn supported_block_modes(
        &self,
        req: SupportedBlockModesRequest,
    ) -> SupportedBlockModesResponse {
        match self
            .operation_factory_for(req.algorithm, req.purpose)
            .and_then(|factory| try_to_vec(factory.supported_block_modes()))
        {
            Ok(block_modes) => SupportedBlockModesResponse { error: ErrorCode::Ok, block_modes },
            Err(e) => op_error_rsp("SupportedBlockModes", e),
        }
    }

    pub fn supported_padding_modes(
        &self,
        req: SupportedPaddingModesRequest,
    ) -> SupportedPaddingModesResponse {
        match self
            .operation_factory_for(req.algorithm, req.purpose)
            .and_then(|factory| try_to_vec(factory.supported_padding_modes()))
        {
            Ok(padding_modes) => {
                SupportedPaddingModesResponse { error: ErrorCode::Ok, padding_modes }
            }
            Err(e) => op_error_rsp("SupportedPaddingModes", e),
        }
    }

    pub fn supported_digests(&self, req: SupportedDigestsRequest) -> SupportedDigestsResponse {
        match self
            .operation_factory_for(req.algorithm, req.purpose)
            .and_then(|factory| try_to_vec(factory.supported_digests()))
        {
            Ok(digests) => SupportedDigestsResponse { error: ErrorCode::Ok, digests },
            Err(e) => op_error_rsp("SupportedDigests", e),
        }
    }

    pub fn supported_import_formats(
        &self,
        req: SupportedImportFormatsRequest,
    ) -> SupportedImportFormatsResponse {
        match self
            .key_factory_checked(req.algorithm)
            .and_then(|factory| try_to_vec(factory.supported_import_formats()))
        {
            Ok(formats) => SupportedImportFormatsResponse { error: ErrorCode::Ok, formats },
            Err(e) => op_error_rsp("SupportedImportFormats", e),
        }
    }

    pub fn supported_export_formats(
        &self,
        req: SupportedExportFormatsRequest,
    ) -> SupportedExportFormatsResponse {
        match self
            .key_factory_checked(req.algorithm)
            .and_then(|factory| try_to_vec(factory.supported_export_formats()))
        {
            Ok(formats) => SupportedExportFormatsResponse { error: ErrorCode::Ok, formats },
            Err(e) => op_error_rsp("SupportedExportFormats", e),
        }
    }

    /// Forward additional entropy to the context's RNG.
    pub fn add_rng_entropy(&mut self, req: AddRngEntropyRequest) -> AddRngEntropyResponse {
        match self.context.add_rng_entropy(&req.data) {
            Ok(()) => AddRngEntropyResponse { error: ErrorCode::Ok },
            Err(e) => op_error_rsp("AddRngEntropy", e),
        }
    }

    /// Record the userspace OS version and patchlevel; subsequent version
    /// checks use the new values.
    pub fn configure(&mut self, req: ConfigureRequest) -> ConfigureResponse {
        match self.context.set_system_version(req.os_version, req.os_patchlevel) {
            Ok(()) => ConfigureResponse { error: ErrorCode::Ok },
            Err(e) => op_error_rsp("Configure", e),
        }
    }

    pub fn generate_key(&mut self, req: GenerateKeyRequest) -> GenerateKeyResponse {
        let key_description: AuthorizationSet = req.key_description.into();
        match self.generate_key_impl(&key_description, req.attestation_key) {
            Ok(result) => GenerateKeyResponse {
                error: ErrorCode::Ok,
                key_blob: result.key_blob,
                hw_enforced: result.hw_enforced.into(),
                sw_enforced: result.sw_enforced.into(),
                certificate_chain: result.certificate_chain,
            },
            Err(e) => op_error_rsp("GenerateKey", e),
        }
    }

    pub(crate) fn generate_key_impl(
        &mut self,
        key_description: &AuthorizationSet,
        attestation_key: Option<AttestationKey>,
    ) -> Result<KeyCreationResult, Error> {
        let factory = self.key_factory_for(key_description)?;
        let (attest_key, issuer_subject) = self.load_attest_key(attestation_key)?;
        factory.generate_key(key_description, attest_key, &issuer_subject)
    }

    pub fn import_key(&mut self, req: ImportKeyRequest) -> ImportKeyResponse {
        let ImportKeyRequest { key_description, key_format, key_data, attestation_key } = req;
        let key_description: AuthorizationSet = key_description.into();
        match self.import_key_impl(&key_description, key_format, &key_data, attestation_key) {
            Ok(result) => ImportKeyResponse {
                error: ErrorCode::Ok,
                key_blob: result.key_blob,
                hw_enforced: result.hw_enforced.into(),
                sw_enforced: result.sw_enforced.into(),
                certificate_chain: result.certificate_chain,
            },
            Err(e) => op_error_rsp("ImportKey", e),
        }
    }

    fn import_key_impl(
        &mut self,
        key_description: &AuthorizationSet,
        key_format: KeyFormat,
        key_data: &[u8],
        attestation_key: Option<AttestationKey>,
    ) -> Result<KeyCreationResult, Error> {
        let factory = self.key_factory_for(key_description)?;

        if get_bool_tag_value!(key_description, EarlyBootOnly)? {
            if let Some(policy) = self.context.enforcement_policy() {
                if !policy.in_early_boot() {
                    return Err(km_err!(
                        EarlyBootEnded,
                        "attempt to import EARLY_BOOT key after early boot"
                    ));
                }
            }
        }

        let (attest_key, issuer_subject) = self.load_attest_key(attestation_key)?;
        factory.import_key(key_description, key_format, key_data, attest_key, &issuer_subject)
    }

    /// Import a key transported inside a wrapped-key blob. The unwrapped
    /// description is routed through the standard import path with no
    /// attestation signing key.
    pub fn import_wrapped_key(&mut self, req: ImportWrappedKeyRequest) -> ImportWrappedKeyResponse {
        match self.import_wrapped_key_impl(req) {
            Ok(result) => ImportWrappedKeyResponse {
                error: ErrorCode::Ok,
                key_blob: result.key_blob,
                hw_enforced: result.hw_enforced.into(),
                sw_enforced: result.sw_enforced.into(),
                certificate_chain: result.certificate_chain,
            },
            Err(e) => op_error_rsp("ImportWrappedKey", e),
        }
    }

    fn import_wrapped_key_impl(
        &mut self,
        req: ImportWrappedKeyRequest,
    ) -> Result<KeyCreationResult, Error> {
        let unwrapping_params: AuthorizationSet = req.unwrapping_params.into();
        let unwrapped = self.context.unwrap_key(
            &req.wrapped_key_data,
            &req.wrapping_key_blob,
            &unwrapping_params,
            &req.masking_key,
        )?;
        let mut key_description = unwrapped.key_description;

        // A USER_SECURE_ID placeholder in the unwrapped description encodes
        // which of the caller's secure IDs should be bound to the key.
        if let Some(sid_idx) = key_description.find(Tag::UserSecureId) {
            let sids = match key_description.erase(sid_idx) {
                KeyParam::UserSecureId(sids) => sids,
                _ => return Err(km_err!(UnknownError, "USER_SECURE_ID lookup mismatch")),
            };
            if sids & HardwareAuthenticatorType::Password as u64 != 0 {
                key_description.push(KeyParam::UserSecureId(req.password_sid))?;
            }
            if sids & HardwareAuthenticatorType::Fingerprint as u64 != 0 {
                key_description.push(KeyParam::UserSecureId(req.biometric_sid))?;
            }

            if self.context.km_version() >= KmVersion::KeyMint1 {
                key_description
                    .push(KeyParam::CertificateNotBefore(DateTime { ms_since_epoch: 0 }))?;
                key_description.push(KeyParam::CertificateNotAfter(DateTime {
                    ms_since_epoch: UNDEFINED_EXPIRATION_DATETIME,
                }))?;
            }
        }

        let factory = self.key_factory_for(&key_description)?;
        factory.import_key(
            &key_description,
            unwrapped.key_format,
            &unwrapped.secret_key,
            None,
            &[],
        )
    }

    /// Replace a key blob bound to old version info with a re-bound one.
    pub fn upgrade_key(&mut self, req: UpgradeKeyRequest) -> UpgradeKeyResponse {
        let upgrade_params: AuthorizationSet = req.upgrade_params.into();
        match self.context.upgrade_key_blob(&req.key_blob_to_upgrade, &upgrade_params) {
            Ok(upgraded_key) => UpgradeKeyResponse { error: ErrorCode::Ok, upgraded_key },
            Err(e) => op_error_rsp("UpgradeKey", e),
        }
    }

    /// Return a key's public material in the requested format.
    pub fn export_key(&mut self, req: ExportKeyRequest) -> ExportKeyResponse {
        let additional_params: AuthorizationSet = req.additional_params.into();
        let result = self
            .context
            .parse_key_blob(&req.key_blob, &additional_params)
            .and_then(|key| key.factory.format_key_material(&key, req.key_format));
        match result {
            Ok(key_material) => ExportKeyResponse { error: ErrorCode::Ok, key_material },
            Err(e) => op_error_rsp("ExportKey", e),
        }
    }

    pub fn delete_key(&mut self, req: DeleteKeyRequest) -> DeleteKeyResponse {
        match self.context.delete_key(&req.key_blob) {
            Ok(()) => DeleteKeyResponse { error: ErrorCode::Ok },
            Err(e) => op_error_rsp("DeleteKey", e),
        }
    }

    pub fn delete_all_keys(&mut self, _req: DeleteAllKeysRequest) -> DeleteAllKeysResponse {
        match self.context.delete_all_keys() {
            Ok(()) => DeleteAllKeysResponse { error: ErrorCode::Ok },
            Err(e) => op_error_rsp("DeleteAllKeys", e),
        }
    }

    /// Return the two authorization lists bound to a key. The characteristics
    /// are returned even when the follow-up version check fails, so that
    /// callers can see what they hold.
    pub fn get_key_characteristics(
        &mut self,
        req: GetKeyCharacteristicsRequest,
    ) -> GetKeyCharacteristicsResponse {
        let additional_params: AuthorizationSet = req.additional_params.into();
        let key = match self.context.parse_key_blob(&req.key_blob, &additional_params) {
            Ok(key) => key,
            Err(e) => return op_error_rsp("GetKeyCharacteristics", e),
        };
        let error = match self.check_version_info(&key.hw_enforced, &key.sw_enforced) {
            Ok(()) => ErrorCode::Ok,
            Err(e) => {
                error!("GetKeyCharacteristics version check failed: {:?}", e);
                e.into()
            }
        };
        GetKeyCharacteristicsResponse {
            error,
            hw_enforced: key.hw_enforced.into(),
            sw_enforced: key.sw_enforced.into(),
        }
    }

    /// Issue an attestation certificate chain for the given key.
    pub fn attest_key(&mut self, req: AttestKeyRequest) -> AttestKeyResponse {
        match self.attest_key_impl(req) {
            Ok(certificate_chain) => AttestKeyResponse { error: ErrorCode::Ok, certificate_chain },
            Err(e) => op_error_rsp("AttestKey", e),
        }
    }

    fn attest_key_impl(&mut self, req: AttestKeyRequest) -> Result<Vec<Certificate>, Error> {
        let attest_params: AuthorizationSet = req.attest_params.into();
        let mut key = self.load_key(&req.key_blob, &attest_params)?;

        // The engine controls this append, so callers cannot spoof the
        // attested application id by baking it into the blob.
        if let Some(KeyParam::AttestationApplicationId(app_id)) =
            attest_params.get(Tag::AttestationApplicationId)
        {
            key.sw_enforced.push(KeyParam::AttestationApplicationId(app_id.clone()))?;
        }

        self.context.generate_attestation(&key, &attest_params)
    }

    pub fn get_hmac_sharing_parameters(
        &mut self,
        _req: GetHmacSharingParametersRequest,
    ) -> GetHmacSharingParametersResponse {
        let result = match self.context.enforcement_policy() {
            None => Err(km_err!(Unimplemented, "no enforcement policy installed")),
            Some(policy) => policy.get_hmac_sharing_parameters(),
        };
        match result {
            Ok(params) => GetHmacSharingParametersResponse { error: ErrorCode::Ok, params },
            Err(e) => op_error_rsp("GetHmacSharingParameters", e),
        }
    }

    pub fn compute_shared_hmac(&mut self, req: ComputeSharedHmacRequest) -> ComputeSharedHmacResponse {
        let result = match self.context.enforcement_policy() {
            None => Err(km_err!(Unimplemented, "no enforcement policy installed")),
            Some(policy) => policy.compute_shared_hmac(&req.params_array),
        };
        match result {
            Ok(sharing_check) => ComputeSharedHmacResponse { error: ErrorCode::Ok, sharing_check },
            Err(e) => op_error_rsp("ComputeSharedHmac", e),
        }
    }

    pub fn verify_authorization(
        &mut self,
        req: VerifyAuthorizationRequest,
    ) -> VerifyAuthorizationResponse {
        match self.context.enforcement_policy() {
            None => op_error_rsp(
                "VerifyAuthorization",
                km_err!(Unimplemented, "no enforcement policy installed"),
            ),
            Some(policy) => policy.verify_authorization(&req),
        }
    }

    pub fn generate_timestamp_token(
        &mut self,
        req: GenerateTimestampTokenRequest,
    ) -> GenerateTimestampTokenResponse {
        let result = match self.context.enforcement_policy() {
            None => Err(km_err!(Unimplemented, "no enforcement policy installed")),
            Some(policy) => policy.generate_timestamp_token(req.challenge),
        };
        match result {
            Ok(token) => GenerateTimestampTokenResponse { error: ErrorCode::Ok, token },
            Err(e) => op_error_rsp("GenerateTimestampToken", e),
        }
    }

    pub fn early_boot_ended(&mut self, _req: EarlyBootEndedRequest) -> EarlyBootEndedResponse {
        match self.context.enforcement_policy() {
            None => op_error_rsp(
                "EarlyBootEnded",
                km_err!(Unimplemented, "no enforcement policy installed"),
            ),
            Some(policy) => {
                policy.early_boot_ended();
                EarlyBootEndedResponse { error: ErrorCode::Ok }
            }
        }
    }

    pub fn device_locked(&mut self, req: DeviceLockedRequest) -> DeviceLockedResponse {
        match self.context.enforcement_policy() {
            None => op_error_rsp(
                "DeviceLocked",
                km_err!(Unimplemented, "no enforcement policy installed"),
            ),
            Some(policy) => {
                policy.device_locked(req.password_only);
                DeviceLockedResponse { error: ErrorCode::Ok }
            }
        }
    }

    /// Parse a key blob and check it against the current system version.
    pub(crate) fn load_key(
        &self,
        key_blob: &[u8],
        additional_params: &AuthorizationSet,
    ) -> Result<Key, Error> {
        let key = self.context.parse_key_blob(key_blob, additional_params)?;
        self.check_version_info(&key.hw_enforced, &key.sw_enforced)?;
        Ok(key)
    }

    /// Compare the OS patchlevel recorded in a key's characteristics against
    /// the system's. The OS version is also retrieved but deliberately not
    /// compared, matching long-standing behavior that callers depend on.
    fn check_version_info(
        &self,
        hw_enforced: &AuthorizationSet,
        sw_enforced: &AuthorizationSet,
    ) -> Result<(), Error> {
        let (_os_version, os_patchlevel) = self.context.system_version();

        let key_patchlevel =
            match hw_enforced.get(Tag::OsPatchlevel).or_else(|| sw_enforced.get(Tag::OsPatchlevel))
            {
                Some(KeyParam::OsPatchlevel(v)) => *v,
                _ => return Ok(()),
            };
        match key_patchlevel.cmp(&os_patchlevel) {
            Ordering::Less => Err(km_err!(
                KeyRequiresUpgrade,
                "keyblob with old OS patchlevel {} needs upgrade to current {}",
                key_patchlevel,
                os_patchlevel
            )),
            Ordering::Greater => Err(km_err!(
                InvalidKeyBlob,
                "keyblob with future OS patchlevel {} (current {})",
                key_patchlevel,
                os_patchlevel
            )),
            Ordering::Equal => Ok(()),
        }
    }

    /// Resolve the key factory named by the `ALGORITHM` tag of a key
    /// description.
    fn key_factory_for(
        &self,
        key_description: &AuthorizationSet,
    ) -> Result<Rc<dyn KeyFactory>, Error> {
        let algorithm = tag::get_algorithm(key_description)?;
        self.key_factory_checked(algorithm)
    }

    fn key_factory_checked(&self, algorithm: Algorithm) -> Result<Rc<dyn KeyFactory>, Error> {
        self.context
            .key_factory(algorithm)
            .ok_or_else(|| km_err!(UnsupportedAlgorithm, "no key factory for {:?}", algorithm))
    }

    fn operation_factory_for(
        &self,
        algorithm: Algorithm,
        purpose: skm_wire::keymaster::KeyPurpose,
    ) -> Result<Rc<dyn context::OperationFactory>, Error> {
        self.key_factory_checked(algorithm)?;
        self.context.operation_factory(algorithm, purpose).ok_or_else(|| {
            km_err!(UnsupportedPurpose, "no operation factory for ({:?}, {:?})", algorithm, purpose)
        })
    }

    /// Load the attestation signing key referenced by a generate/import
    /// request, if one was supplied.
    fn load_attest_key(
        &self,
        attestation_key: Option<AttestationKey>,
    ) -> Result<(Option<Key>, Vec<u8>), Error> {
        match attestation_key {
            Some(attest) => {
                let attest_params: AuthorizationSet = attest.attest_key_params.into();
                let key = self.load_key(&attest.key_blob, &attest_params)?;
                Ok((Some(key), attest.issuer_subject_name))
            }
            None => Ok((None, Vec::new())),
        }
    }
}

//! Remote key provisioning: attestation keypair generation and CSR
//! construction with nested COSE structures.

use crate::context::CsrSigningAlgorithm;
use crate::SoftKeymaster;
use alloc::{vec, vec::Vec};
use der::Decode;
use log::error;
use skm_common::{
    authset::AuthorizationSet,
    cbor::value::{Integer, Value},
    coset::{
        iana, AsCborValue, CborSerializable, CoseEncryptBuilder, CoseMac0, CoseMac0Builder,
        CoseRecipient, CoseRecipientBuilder, CoseSign1, CoseSign1Builder, HeaderBuilder,
    },
    read_to_value, rpc_err, serialize_cbor, try_to_vec, Error, FallibleAllocExt,
};
use skm_wire::keymaster::{
    Algorithm, Certificate, DateTime, Digest, EcCurve, KeyParam, KeyPurpose,
};
use skm_wire::rpc::{
    DeviceInfo, GenerateCsrRequest, GenerateCsrResponse, GenerateRkpKeyRequest,
    GenerateRkpKeyResponse, MacedPublicKey, ProtectedData,
};
use skm_wire::KeySizeInBits;

// COSE_Key labels and values (RFC 8152 sections 7 and 13).
const COSE_KEY_TYPE: i64 = 1;
const COSE_KEY_KID: i64 = 2;
const COSE_KEY_ALGORITHM: i64 = 3;
const COSE_KEY_CURVE: i64 = -1;
const COSE_KEY_PUBKEY_X: i64 = -2;
const COSE_KEY_PUBKEY_Y: i64 = -3;
const COSE_KEY_TYPE_OKP: i64 = 1;
const COSE_KEY_TYPE_EC2: i64 = 2;
const COSE_ALG_ES256: i64 = -7;
const COSE_CURVE_P256: i64 = 1;
const COSE_CURVE_X25519: i64 = 4;

/// Vendor-reserved COSE_Key label marking a test-mode key.
const COSE_TEST_KEY: i64 = -70000;

/// Unprotected-header label carrying an ephemeral COSE_Key in a recipient.
const COSE_HEADER_LABEL_KEY: i64 = -1;

const P256_AFFINE_POINT_SIZE: usize = 32;
const EPHEMERAL_MAC_KEY_SIZE: usize = 32;
const AES_GCM_KEY_SIZE: usize = 32;
const AES_GCM_NONCE_SIZE: usize = 12;

/// Description of the ECDSA P-256 keypair generated as a candidate
/// attestation key. The self-signed certificate it produces is discarded
/// after the public key has been lifted out of it, so the validity values do
/// not matter.
const RKP_ECDSA_P256_KEYGEN_PARAMS: [KeyParam; 8] = [
    KeyParam::Purpose(KeyPurpose::AttestKey),
    KeyParam::Algorithm(Algorithm::Ec),
    KeyParam::KeySize(KeySizeInBits(256)),
    KeyParam::Digest(Digest::Sha256),
    KeyParam::EcCurve(EcCurve::P256),
    KeyParam::NoAuthRequired,
    KeyParam::CertificateNotBefore(DateTime { ms_since_epoch: 0 }),
    KeyParam::CertificateNotAfter(DateTime { ms_since_epoch: 0 }),
];

impl<'a> SoftKeymaster<'a> {
    /// Generate a fresh attestation keypair and return its public key wrapped
    /// in a COSE_Mac0, together with the opaque key blob.
    pub fn generate_rkp_key(&mut self, req: GenerateRkpKeyRequest) -> GenerateRkpKeyResponse {
        match self.generate_rkp_key_impl(req.test_mode) {
            Ok((maced_public_key, key_blob)) => GenerateRkpKeyResponse {
                error: skm_wire::rpc::ErrorCode::Ok,
                maced_public_key,
                key_blob,
            },
            Err(e) => {
                error!("GenerateRkpKey failed: {:?}", e);
                GenerateRkpKeyResponse { error: e.into(), ..Default::default() }
            }
        }
    }

    fn generate_rkp_key_impl(
        &mut self,
        test_mode: bool,
    ) -> Result<(MacedPublicKey, Vec<u8>), Error> {
        if self.context.remote_provisioning_context().is_none() {
            return Err(rpc_err!(Failed, "no remote provisioning context available"));
        }

        let key_description: AuthorizationSet = try_to_vec(&RKP_ECDSA_P256_KEYGEN_PARAMS)?.into();
        let result = self.generate_key_impl(&key_description, None)?;

        // The chain must hold the single non-signed certificate that exists
        // only to transport the public key.
        if result.certificate_chain.len() != 1 {
            return Err(rpc_err!(
                Failed,
                "expected exactly one certificate, got {}",
                result.certificate_chain.len()
            ));
        }
        let (x, y) = ecdsa_p256_key_from_cert(&result.certificate_chain[0])?;

        let mut entries = vec![
            (Value::Integer(COSE_KEY_TYPE.into()), Value::Integer(COSE_KEY_TYPE_EC2.into())),
            (Value::Integer(COSE_KEY_ALGORITHM.into()), Value::Integer(COSE_ALG_ES256.into())),
            (Value::Integer(COSE_KEY_CURVE.into()), Value::Integer(COSE_CURVE_P256.into())),
            (Value::Integer(COSE_KEY_PUBKEY_X.into()), Value::Bytes(x)),
            (Value::Integer(COSE_KEY_PUBKEY_Y.into()), Value::Bytes(y)),
        ];
        if test_mode {
            entries.try_push((Value::Integer(COSE_TEST_KEY.into()), Value::Null))?;
        }
        // Entries are already in RFC 7049 canonical key order:
        // 1, 3, -1, -2, -3, -70000.
        let pub_cose_key = serialize_cbor(&Value::Map(entries))?;

        let maced_key = self.build_maced_pub_key(test_mode, pub_cose_key)?;
        Ok((MacedPublicKey { maced_key }, result.key_blob))
    }

    /// Build a CSR for a batch of previously generated attestation keys.
    pub fn generate_csr(&mut self, req: GenerateCsrRequest) -> GenerateCsrResponse {
        match self.generate_csr_impl(&req) {
            Ok((keys_to_sign_mac, device_info, protected_data)) => GenerateCsrResponse {
                error: skm_wire::rpc::ErrorCode::Ok,
                keys_to_sign_mac,
                device_info,
                protected_data,
            },
            Err(e) => {
                error!("GenerateCsr failed: {:?}", e);
                GenerateCsrResponse { error: e.into(), ..Default::default() }
            }
        }
    }

    fn generate_csr_impl(
        &mut self,
        req: &GenerateCsrRequest,
    ) -> Result<(Vec<u8>, DeviceInfo, ProtectedData), Error> {
        if self.context.remote_provisioning_context().is_none() {
            return Err(rpc_err!(Failed, "no remote provisioning context available"));
        }

        let pub_keys_to_sign = self.validate_and_extract_pub_keys(req.test_mode, &req.keys_to_sign)?;

        // An ephemeral key MACs the batch; its value travels to the backend
        // inside the COSE_Sign1 payload below.
        let mut ephemeral_mac_key = [0u8; EPHEMERAL_MAC_KEY_SIZE];
        self.imp.rng.fill_bytes(&mut ephemeral_mac_key);
        let keys_to_sign_mac = self.generate_cose_mac0_mac(&ephemeral_mac_key, &pub_keys_to_sign)?;

        let (device_priv_key, bcc, device_info_map, signing_algorithm) = {
            let rpc_ctx = self
                .context
                .remote_provisioning_context()
                .ok_or_else(|| rpc_err!(Failed, "no remote provisioning context available"))?;
            let (device_priv_key, bcc) = if req.test_mode {
                rpc_ctx.generate_bcc()?
            } else {
                (rpc_ctx.device_private_key()?, rpc_ctx.bcc()?)
            };
            (device_priv_key, bcc, rpc_ctx.create_device_info()?, rpc_ctx.signing_algorithm())
        };
        let device_info = serialize_cbor(&device_info_map)?;

        // COSE_Sign1 over the ephemeral MAC key, bound to the challenge, the
        // device info and the batch MAC through the external AAD.
        let aad = serialize_cbor(&Value::Array(vec![
            Value::Bytes(try_to_vec(&req.challenge)?),
            device_info_map,
            Value::Bytes(try_to_vec(&keys_to_sign_mac)?),
        ]))?;
        let protected = HeaderBuilder::new()
            .algorithm(match signing_algorithm {
                CsrSigningAlgorithm::ES256 => iana::Algorithm::ES256,
                CsrSigningAlgorithm::EdDSA => iana::Algorithm::EdDSA,
            })
            .build();
        let signed_mac = CoseSign1Builder::new()
            .protected(protected)
            .payload(try_to_vec(&ephemeral_mac_key)?)
            .try_create_signature(&aad, |input| match signing_algorithm {
                CsrSigningAlgorithm::ES256 => self.imp.ec.ecdsa_p256_sign(&device_priv_key, input),
                CsrSigningAlgorithm::EdDSA => self.imp.ec.ed25519_sign(&device_priv_key, input),
            })?
            .build();

        // Session key: X25519 agreement with the endpoint encryption key,
        // run through HKDF with the sender flag set.
        let (ephemeral_priv_key, ephemeral_pub_key) =
            self.imp.ec.generate_x25519_keypair(self.imp.rng)?;
        let (eek_pub_key, eek_id) =
            self.validate_and_extract_eek_pub_and_id(req.test_mode, &req.endpoint_enc_cert_chain)?;
        let session_key = self.x25519_hkdf_derive_key(
            &ephemeral_pub_key,
            &ephemeral_priv_key,
            &eek_pub_key,
            /* sender_is_a= */ true,
        )?;

        let mut nonce = [0u8; AES_GCM_NONCE_SIZE];
        self.imp.rng.fill_bytes(&mut nonce);

        let payload =
            serialize_cbor(&Value::Array(vec![signed_mac.to_cbor_value()?, bcc]))?;
        let protected = HeaderBuilder::new().algorithm(iana::Algorithm::A256GCM).build();
        let unprotected = HeaderBuilder::new().iv(try_to_vec(&nonce)?).build();
        let recipient = build_cert_req_recipient(&ephemeral_pub_key, &eek_id)?;
        let protected_data = CoseEncryptBuilder::new()
            .protected(protected)
            .unprotected(unprotected)
            .try_create_ciphertext(&payload, &[], |plaintext, enc_aad| {
                self.imp.aes_gcm.encrypt(&session_key, &nonce, enc_aad, plaintext)
            })?
            .add_recipient(recipient)
            .build();

        Ok((
            keys_to_sign_mac,
            DeviceInfo { device_info },
            ProtectedData { protected_data: protected_data.to_vec()? },
        ))
    }

    /// MAC a serialized COSE_Key, using an all-zero key in test mode or the
    /// remote provisioning context's HMAC key in production.
    fn rkp_hmac(&mut self, test_mode: bool, data: &[u8]) -> Result<Vec<u8>, Error> {
        if test_mode {
            self.imp.hmac.hmac_sha256(&[0; 32], data)
        } else {
            let rpc_ctx = self
                .context
                .remote_provisioning_context()
                .ok_or_else(|| rpc_err!(Failed, "no remote provisioning context available"))?;
            rpc_ctx.generate_hmac_sha256(data)
        }
    }

    fn build_maced_pub_key(
        &mut self,
        test_mode: bool,
        pub_cose_key: Vec<u8>,
    ) -> Result<Vec<u8>, Error> {
        let protected = HeaderBuilder::new().algorithm(iana::Algorithm::HMAC_256_256).build();
        let cose_mac0 = CoseMac0Builder::new()
            .protected(protected)
            .payload(pub_cose_key)
            .try_create_tag(&[], |data| self.rkp_hmac(test_mode, data))?
            .build();
        Ok(cose_mac0.to_vec()?)
    }

    /// Compute the COSE_Mac0 tag over `payload` with the given HMAC key,
    /// returning just the tag value.
    fn generate_cose_mac0_mac(&self, mac_key: &[u8], payload: &[u8]) -> Result<Vec<u8>, Error> {
        let protected = HeaderBuilder::new().algorithm(iana::Algorithm::HMAC_256_256).build();
        let cose_mac0 = CoseMac0Builder::new()
            .protected(protected)
            .payload(try_to_vec(payload)?)
            .try_create_tag(&[], |data| self.imp.hmac.hmac_sha256(mac_key, data))?
            .build();
        Ok(cose_mac0.tag)
    }

    /// Check the MAC on each candidate public key and return the
    /// concatenation of their COSE_Key encodings.
    fn validate_and_extract_pub_keys(
        &mut self,
        test_mode: bool,
        keys_to_sign: &[MacedPublicKey],
    ) -> Result<Vec<u8>, Error> {
        let mut pub_keys = Vec::new();
        for key_to_sign in keys_to_sign {
            let cose_mac0 = CoseMac0::from_slice(&key_to_sign.maced_key)
                .map_err(|e| rpc_err!(InvalidMac, "malformed MacedPublicKey: {:?}", e))?;
            cose_mac0.verify_tag(&[], |expected_tag, data| -> Result<(), Error> {
                let computed_tag = self.rkp_hmac(test_mode, data)?;
                if self.imp.compare.eq(expected_tag, &computed_tag) {
                    Ok(())
                } else {
                    Err(rpc_err!(InvalidMac, "invalid tag found in a MacedPublicKey"))
                }
            })?;
            let payload = cose_mac0
                .payload
                .as_ref()
                .ok_or_else(|| rpc_err!(Failed, "no payload found in a MacedPublicKey"))?;

            let cose_key = read_to_value(payload)
                .map_err(|e| rpc_err!(Failed, "MacedPublicKey payload is not CBOR: {:?}", e))?;
            let is_test_key = cose_key_param(&cose_key, COSE_TEST_KEY)?.is_some();
            if test_mode && !is_test_key {
                return Err(rpc_err!(
                    ProductionKeyInTestRequest,
                    "production key in a test-mode request"
                ));
            }
            if !test_mode && is_test_key {
                return Err(rpc_err!(
                    TestKeyInProductionRequest,
                    "test key in a production request"
                ));
            }

            pub_keys.try_extend_from_slice(payload)?;
        }
        Ok(pub_keys)
    }

    /// Walk the endpoint encryption key certificate chain, returning the
    /// X25519 public key and key id of its final entry. In production mode
    /// each link's signature is verified against its signer (the root is
    /// self-signed); test mode accepts a structurally valid chain.
    fn validate_and_extract_eek_pub_and_id(
        &self,
        test_mode: bool,
        eek_chain: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), Error> {
        let certs = match read_to_value(eek_chain)
            .map_err(|e| rpc_err!(InvalidEek, "malformed EEK chain: {:?}", e))?
        {
            Value::Array(certs) if !certs.is_empty() => certs,
            _ => return Err(rpc_err!(InvalidEek, "EEK chain is not a non-empty array")),
        };

        let mut signer_key: Option<Vec<u8>> = None;
        let mut last_key: Option<Value> = None;
        for cert in certs {
            let sign1 = CoseSign1::from_cbor_value(cert)
                .map_err(|e| rpc_err!(InvalidEek, "malformed EEK cert: {:?}", e))?;
            let payload = sign1
                .payload
                .as_ref()
                .ok_or_else(|| rpc_err!(InvalidEek, "EEK cert with no payload"))?;
            let cose_key = read_to_value(payload)
                .map_err(|e| rpc_err!(InvalidEek, "EEK cert payload is not CBOR: {:?}", e))?;
            let key_x = cose_key_bytes(&cose_key, COSE_KEY_PUBKEY_X)?;

            if !test_mode {
                let verifier_key = match &signer_key {
                    Some(key) => key.as_slice(),
                    None => key_x.as_slice(),
                };
                sign1.verify_signature(&[], |sig, data| -> Result<(), Error> {
                    match self.imp.ec.ed25519_verify(verifier_key, data, sig) {
                        Ok(true) => Ok(()),
                        Ok(false) => {
                            Err(rpc_err!(InvalidEek, "EEK cert signature does not verify"))
                        }
                        Err(e) => Err(e),
                    }
                })?;
            }

            signer_key = Some(key_x);
            last_key = Some(cose_key);
        }

        // The final entry holds the encryption key itself.
        let eek = last_key.ok_or_else(|| rpc_err!(InvalidEek, "empty EEK chain"))?;
        match cose_key_param(&eek, COSE_KEY_CURVE)? {
            Some(Value::Integer(curve)) if *curve == Integer::from(COSE_CURVE_X25519) => {}
            _ => return Err(rpc_err!(InvalidEek, "EEK is not an X25519 key")),
        }
        let eek_pub_key = cose_key_bytes(&eek, COSE_KEY_PUBKEY_X)?;
        let eek_id = cose_key_bytes(&eek, COSE_KEY_KID)?;
        Ok((eek_pub_key, eek_id))
    }

    /// Derive a 32-byte AES-GCM session key from an X25519 agreement, binding
    /// both public keys and the sender role into the KDF context.
    fn x25519_hkdf_derive_key(
        &self,
        pub_key_a: &[u8],
        priv_key_a: &[u8],
        pub_key_b: &[u8],
        sender_is_a: bool,
    ) -> Result<Vec<u8>, Error> {
        let raw_shared_key = self.imp.ec.x25519_agree(priv_key_a, pub_key_b)?;
        let (sender_pub, recipient_pub) =
            if sender_is_a { (pub_key_a, pub_key_b) } else { (pub_key_b, pub_key_a) };
        let kdf_context = serialize_cbor(&Value::Array(vec![
            Value::Bytes(try_to_vec(sender_pub)?),
            Value::Bytes(try_to_vec(recipient_pub)?),
            Value::Bool(sender_is_a),
        ]))?;
        self.imp.hkdf.hkdf(&[], &raw_shared_key, &kdf_context, AES_GCM_KEY_SIZE)
    }
}

/// Extract the (x, y) affine coordinates of an ECDSA P-256 public key from a
/// DER-encoded certificate.
fn ecdsa_p256_key_from_cert(cert: &Certificate) -> Result<(Vec<u8>, Vec<u8>), Error> {
    let cert = x509_cert::Certificate::from_der(&cert.encoded_certificate)
        .map_err(|e| rpc_err!(Failed, "failed to parse certificate: {:?}", e))?;
    let key_data = cert
        .tbs_certificate
        .subject_public_key_info
        .subject_public_key
        .as_bytes()
        .ok_or_else(|| rpc_err!(Failed, "subject public key not octet-aligned"))?;
    if key_data.len() != 1 + 2 * P256_AFFINE_POINT_SIZE || key_data[0] != 0x04 {
        return Err(rpc_err!(
            Failed,
            "subject public key is not an uncompressed SEC-1 point ({} bytes)",
            key_data.len()
        ));
    }
    Ok((
        try_to_vec(&key_data[1..1 + P256_AFFINE_POINT_SIZE])?,
        try_to_vec(&key_data[1 + P256_AFFINE_POINT_SIZE..])?,
    ))
}

/// Build the single COSE_recipient binding the ephemeral public key to the
/// EEK that the backend will use to unwrap the session key.
fn build_cert_req_recipient(
    ephemeral_pub_key: &[u8],
    eek_id: &[u8],
) -> Result<CoseRecipient, Error> {
    let ephemeral_cose_key = Value::Map(vec![
        (Value::Integer(COSE_KEY_TYPE.into()), Value::Integer(COSE_KEY_TYPE_OKP.into())),
        (Value::Integer(COSE_KEY_CURVE.into()), Value::Integer(COSE_CURVE_X25519.into())),
        (Value::Integer(COSE_KEY_PUBKEY_X.into()), Value::Bytes(try_to_vec(ephemeral_pub_key)?)),
    ]);
    let protected = HeaderBuilder::new().algorithm(iana::Algorithm::ECDH_ES_HKDF_256).build();
    let unprotected = HeaderBuilder::new()
        .value(COSE_HEADER_LABEL_KEY, ephemeral_cose_key)
        .key_id(try_to_vec(eek_id)?)
        .build();
    Ok(CoseRecipientBuilder::new().protected(protected).unprotected(unprotected).build())
}

/// Look up a label in a COSE_Key map.
fn cose_key_param(cose_key: &Value, label: i64) -> Result<Option<&Value>, Error> {
    match cose_key {
        Value::Map(entries) => Ok(entries
            .iter()
            .find(|(k, _v)| matches!(k, Value::Integer(i) if *i == Integer::from(label)))
            .map(|(_k, v)| v)),
        _ => Err(rpc_err!(Failed, "COSE_Key is not a map")),
    }
}

/// Look up a label in a COSE_Key map, requiring a byte-string value.
fn cose_key_bytes(cose_key: &Value, label: i64) -> Result<Vec<u8>, Error> {
    match cose_key_param(cose_key, label)? {
        Some(Value::Bytes(bytes)) => try_to_vec(bytes),
        _ => Err(rpc_err!(InvalidEek, "COSE_Key label {} missing or not bytes", label)),
    }
}

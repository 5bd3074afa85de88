//! Engine functionality for in-flight operations: the fixed-capacity
//! operation table and the Begin/Update/Finish/Abort state machine.

use crate::context::{CryptoOperation, KeyId, OperationOutput};
use crate::op_error_rsp;
use alloc::{boxed::Box, vec::Vec};
use log::{error, warn};
use skm_common::{
    authset::AuthorizationSet, contains_tag_value, get_opt_tag_value, km_err, Error,
    FallibleAllocExt,
};
use skm_wire::keymaster::{
    AbortOperationRequest, AbortOperationResponse, BeginOperationRequest, BeginOperationResponse,
    ErrorCode, FinishOperationRequest, FinishOperationResponse, KeyPurpose, KmResponse, Tag,
    UpdateOperationRequest, UpdateOperationResponse,
};

/// A trusted confirmation token is an HMAC-SHA256 output.
pub(crate) const CONFIRMATION_TOKEN_SIZE: usize = 32;

/// Maximum size of a message signed under `TRUSTED_CONFIRMATION_REQUIRED`.
pub(crate) const CONFIRMATION_MESSAGE_MAX_SIZE: usize = 6144;

/// Length of the "confirmation token" prefix that the confirmation UI
/// prepends to the message before MACing it.
pub(crate) const CONFIRMATION_TOKEN_MESSAGE_TAG_SIZE: usize = 18;

/// Handle identifying an in-flight operation. Zero is never a valid handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpHandle(pub u64);

/// A live operation: the factory-created crypto session plus the state the
/// engine re-checks on every step.
pub struct Operation {
    /// Handle identifying the operation, unique among live operations.
    pub handle: OpHandle,

    pub purpose: KeyPurpose,

    /// Key identifier assigned by the enforcement policy on begin().
    pub key_id: Option<KeyId>,

    /// Snapshot of the key's hardware-enforced authorizations.
    pub hw_enforced: AuthorizationSet,

    /// Snapshot of the key's combined authorizations, re-checked by the
    /// enforcement policy at each step.
    pub authorizations: AuthorizationSet,

    /// Buffer accumulating the data being signed, for keys that require a
    /// trusted confirmation. Bounded; checked against the confirmation token
    /// on finish().
    pub confirmation_verifier: Option<Vec<u8>>,

    pub crypto_op: Box<dyn CryptoOperation>,
}

/// Fixed-capacity table of live operations.
pub struct OperationTable {
    slots: Vec<Option<Operation>>,
    next_handle: u64,
}

impl OperationTable {
    pub fn new(size: usize) -> Self {
        Self {
            // `vec![None; size]` needs `Operation: Clone`, which it isn't.
            slots: (0..size).map(|_| None).collect(),
            next_handle: 1,
        }
    }

    /// Add `op` to the table, assigning it a fresh handle. Fails when every
    /// slot is occupied.
    pub fn add(&mut self, mut op: Operation) -> Result<OpHandle, Error> {
        let idx = self.slots.iter().position(Option::is_none).ok_or_else(|| {
            km_err!(TooManyOperations, "current op count {} >= limit", self.slots.len())
        })?;
        let handle = self.new_handle();
        op.handle = handle;
        self.slots[idx] = Some(op);
        Ok(handle)
    }

    /// Return the live operation identified by `handle`, if any.
    pub fn find(&mut self, handle: OpHandle) -> Option<&mut Operation> {
        self.slots.iter_mut().flatten().find(|op| op.handle == handle)
    }

    pub fn has(&self, handle: OpHandle) -> bool {
        self.slots.iter().flatten().any(|op| op.handle == handle)
    }

    /// Remove the operation identified by `handle` from the table, returning
    /// it. The slot only becomes reusable once the operation has been
    /// dropped.
    pub fn delete(&mut self, handle: OpHandle) -> Option<Operation> {
        self.slots
            .iter_mut()
            .find(|slot| matches!(slot, Some(op) if op.handle == handle))
            .and_then(Option::take)
    }

    /// Number of live operations.
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Produce a handle value not used by any live operation. Handles count
    /// up monotonically, skipping zero, so a handle is not reused while any
    /// client may still hold it.
    fn new_handle(&mut self) -> OpHandle {
        loop {
            let candidate = OpHandle(self.next_handle);
            self.next_handle = self.next_handle.wrapping_add(1);
            if candidate.0 != 0 && !self.has(candidate) {
                return candidate;
            }
        }
    }
}

impl<'a> crate::SoftKeymaster<'a> {
    /// Start a new operation over the key in `req.key_blob`.
    pub fn begin_operation(&mut self, req: BeginOperationRequest) -> BeginOperationResponse {
        let additional_params: AuthorizationSet = req.additional_params.into();
        match self.begin_operation_impl(req.purpose, &req.key_blob, &additional_params) {
            Ok((op_handle, output_params)) => BeginOperationResponse {
                error: ErrorCode::Ok,
                op_handle: op_handle.0,
                output_params: output_params.into(),
            },
            Err(e) => op_error_rsp("BeginOperation", e),
        }
    }

    fn begin_operation_impl(
        &mut self,
        purpose: KeyPurpose,
        key_blob: &[u8],
        params: &AuthorizationSet,
    ) -> Result<(OpHandle, AuthorizationSet), Error> {
        let key = self.load_key(key_blob, params)?;
        let key_auths = key.authorizations()?;
        if !key_auths.contains_tag(Tag::Algorithm) {
            return Err(km_err!(UnknownError, "parsed key has no ALGORITHM authorization"));
        }

        let op_factory = key
            .factory
            .operation_factory(purpose)
            .ok_or_else(|| km_err!(UnsupportedPurpose, "purpose {:?} not supported", purpose))?;

        let hw_enforced = key.hw_enforced.clone();
        let mut op = Operation {
            handle: OpHandle(0),
            purpose,
            key_id: None,
            hw_enforced,
            authorizations: key_auths,
            confirmation_verifier: None,
            crypto_op: op_factory.create_operation(key, params)?,
        };

        if op.authorizations.contains_tag(Tag::TrustedConfirmationRequired) {
            let mut buffer = Vec::new();
            buffer
                .try_reserve(CONFIRMATION_MESSAGE_MAX_SIZE + CONFIRMATION_TOKEN_MESSAGE_TAG_SIZE)
                .map_err(|_e| {
                    km_err!(MemoryAllocationFailed, "failed to allocate confirmation buffer")
                })?;
            op.confirmation_verifier = Some(buffer);
        }

        if let Some(policy) = self.context.enforcement_policy() {
            let key_id = policy
                .create_key_id(key_blob)
                .ok_or_else(|| km_err!(UnknownError, "failed to derive key id from blob"))?;
            op.key_id = Some(key_id);
            policy.authorize_operation(
                purpose,
                key_id,
                &op.authorizations,
                params,
                OpHandle(0),
                /* is_begin_operation= */ true,
            )?;
        }

        let output_params = op.crypto_op.begin(params)?;

        // Only now does the operation become findable; every earlier error
        // path drops it.
        let op_handle = self.operations.add(op)?;
        Ok((op_handle, output_params))
    }

    /// Feed input to an in-flight operation. Any failure invalidates the
    /// operation.
    pub fn update_operation(&mut self, req: UpdateOperationRequest) -> UpdateOperationResponse {
        let op_handle = OpHandle(req.op_handle);
        let additional_params: AuthorizationSet = req.additional_params.into();
        match self.update_operation_impl(op_handle, &additional_params, &req.input) {
            Ok(out) => UpdateOperationResponse {
                error: ErrorCode::Ok,
                input_consumed: out.input_consumed,
                output_params: out.output_params.into(),
                output: out.output,
            },
            Err(e) => op_error_rsp("UpdateOperation", e),
        }
    }

    fn update_operation_impl(
        &mut self,
        op_handle: OpHandle,
        params: &AuthorizationSet,
        input: &[u8],
    ) -> Result<OperationOutput, Error> {
        if !self.operations.has(op_handle) {
            return Err(km_err!(InvalidOperationHandle, "operation {:?} not found", op_handle));
        }
        if let Err(e) = self.buffer_confirmation_data(op_handle, input) {
            self.operations.delete(op_handle);
            return Err(e);
        }
        if let Err(e) = self.authorize_in_flight(op_handle, params) {
            self.operations.delete(op_handle);
            return Err(e);
        }

        let result = match self.operations.find(op_handle) {
            Some(op) => op.crypto_op.update(params, input),
            None => Err(km_err!(InvalidOperationHandle, "operation {:?} not found", op_handle)),
        };
        if result.is_err() {
            // Any error invalidates the operation.
            self.operations.delete(op_handle);
        }
        result
    }

    /// Complete an in-flight operation. The operation is removed from the
    /// table regardless of the outcome.
    pub fn finish_operation(&mut self, req: FinishOperationRequest) -> FinishOperationResponse {
        let op_handle = OpHandle(req.op_handle);
        let additional_params: AuthorizationSet = req.additional_params.into();
        let mut rsp = FinishOperationResponse::default();

        if !self.operations.has(op_handle) {
            return op_error_rsp(
                "FinishOperation",
                km_err!(InvalidOperationHandle, "operation {:?} not found", op_handle),
            );
        }
        if let Err(e) = self.buffer_confirmation_data(op_handle, &req.input) {
            self.operations.delete(op_handle);
            return op_error_rsp("FinishOperation", e);
        }
        if let Err(e) = self.authorize_in_flight(op_handle, &additional_params) {
            self.operations.delete(op_handle);
            return op_error_rsp("FinishOperation", e);
        }

        let result = match self.operations.find(op_handle) {
            Some(op) => op.crypto_op.finish(&additional_params, &req.input, &req.signature),
            None => Err(km_err!(InvalidOperationHandle, "operation {:?} not found", op_handle)),
        };
        match result {
            Ok(out) => {
                rsp.output_params = out.output_params.into();
                rsp.output = out.output;
            }
            Err(e) => {
                self.operations.delete(op_handle);
                return op_error_rsp("FinishOperation", e);
            }
        }

        // A successful use of a single-use key invalidates it in secure
        // storage. A deletion failure replaces the response error but the
        // output is retained.
        let single_use_key_id = match self.operations.find(op_handle) {
            Some(op) if contains_tag_value!(&op.hw_enforced, UsageCountLimit, 1) => {
                Some(op.key_id.unwrap_or(KeyId(0)))
            }
            _ => None,
        };
        if let Some(key_id) = single_use_key_id {
            if let Some(storage) = self.context.secure_key_storage() {
                warn!("deleting single-use key {:?} after use", key_id);
                if let Err(e) = storage.delete_key(key_id) {
                    error!("failed to delete single-use key: {:?}", e);
                    rsp.error = e.into();
                }
            }
        }

        // The accumulated input must be checked against the trusted
        // confirmation token, if one was required.
        if rsp.error == ErrorCode::Ok {
            let verifier = self
                .operations
                .find(op_handle)
                .and_then(|op| op.confirmation_verifier.take());
            if let Some(buffer) = verifier {
                match get_opt_tag_value!(&additional_params, ConfirmationToken) {
                    Ok(None) => {
                        rsp.error = ErrorCode::NoUserConfirmation;
                        rsp.output.clear();
                    }
                    Ok(Some(token)) => {
                        if token.len() != CONFIRMATION_TOKEN_SIZE {
                            error!(
                                "confirmation token wrong size, was {} expected {}",
                                token.len(),
                                CONFIRMATION_TOKEN_SIZE
                            );
                            rsp.error = ErrorCode::InvalidArgument;
                            rsp.output.clear();
                        } else if let Err(e) = self.context.check_confirmation_token(&buffer, token)
                        {
                            rsp.set_error(e.into());
                            rsp.output.clear();
                        }
                    }
                    Err(e) => {
                        rsp.set_error(e.into());
                        rsp.output.clear();
                    }
                }
            }
        }

        self.operations.delete(op_handle);
        rsp
    }

    /// Abandon an in-flight operation.
    pub fn abort_operation(&mut self, req: AbortOperationRequest) -> AbortOperationResponse {
        match self.operations.delete(OpHandle(req.op_handle)) {
            None => op_error_rsp(
                "AbortOperation",
                km_err!(InvalidOperationHandle, "operation {} not found", req.op_handle),
            ),
            Some(mut op) => {
                let error = match op.crypto_op.abort() {
                    Ok(()) => ErrorCode::Ok,
                    Err(e) => {
                        error!("AbortOperation failed: {:?}", e);
                        e.into()
                    }
                };
                AbortOperationResponse { error }
            }
        }
    }

    /// Indicate whether `op_handle` identifies a live operation.
    pub fn has_operation(&self, op_handle: u64) -> bool {
        self.operations.has(OpHandle(op_handle))
    }

    /// Append step input to the operation's confirmation-verifier buffer, if
    /// it has one, enforcing the overall message bound.
    fn buffer_confirmation_data(&mut self, op_handle: OpHandle, input: &[u8]) -> Result<(), Error> {
        let op = match self.operations.find(op_handle) {
            Some(op) => op,
            None => return Ok(()),
        };
        if let Some(buffer) = &mut op.confirmation_verifier {
            if buffer.len() + input.len()
                > CONFIRMATION_MESSAGE_MAX_SIZE + CONFIRMATION_TOKEN_MESSAGE_TAG_SIZE
            {
                return Err(km_err!(
                    InvalidArgument,
                    "confirmation data of size {} + {} too big",
                    buffer.len(),
                    input.len()
                ));
            }
            buffer.try_extend_from_slice(input).map_err(|_e| {
                km_err!(MemoryAllocationFailed, "failed to reserve {} extra bytes", input.len())
            })?;
        }
        Ok(())
    }

    /// Re-run policy authorization for a step of an in-flight operation.
    fn authorize_in_flight(
        &mut self,
        op_handle: OpHandle,
        params: &AuthorizationSet,
    ) -> Result<(), Error> {
        let op = match self.operations.find(op_handle) {
            Some(op) => op,
            None => return Ok(()),
        };
        if let Some(policy) = self.context.enforcement_policy() {
            policy.authorize_operation(
                op.purpose,
                op.key_id.unwrap_or(KeyId(0)),
                &op.authorizations,
                params,
                op.handle,
                /* is_begin_operation= */ false,
            )?;
        }
        Ok(())
    }
}

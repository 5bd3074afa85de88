//! Functionality shared across the software Keymaster engine crates.

#![no_std]
extern crate alloc;

use alloc::{collections::TryReserveError, string::String, vec::Vec};
use skm_wire::keymaster::ErrorCode;

/// Re-export of the wire types crate, so macros can name its types.
pub use skm_wire as wire;

/// Re-export of crate used for CBOR encoding.
pub use ciborium as cbor;
/// Re-export of crate used for COSE encoding.
pub use coset;

pub mod authset;
pub mod crypto;
pub mod tag;

/// General error type.
#[derive(Debug)]
pub enum Error {
    Cbor(CborError),
    Hal(ErrorCode, String),
    Rpc(wire::rpc::ErrorCode, String),
    Alloc(&'static str),
}

// The following macros for error generation allow the message portion to be
// automatically compiled out in future, avoiding potential information leakage
// and allocation.

/// Macro to build an [`Error::Hal`] instance for a specific [`ErrorCode`] value known at compile
/// time: `km_err!(InvalidTag, "some {} format", arg)`.
#[macro_export]
macro_rules! km_err {
    { $error_code:ident, $($arg:tt)+ } => {
        $crate::Error::Hal($crate::wire::keymaster::ErrorCode::$error_code,
                           alloc::format!("{}:{}: {}", file!(), line!(), format_args!($($arg)+))) };
}

/// Macro to build an [`Error::Hal`] instance from an [`ErrorCode`] expression:
/// `km_verr!(rc, "some {} format", arg)`.
#[macro_export]
macro_rules! km_verr {
    { $error_code:expr, $($arg:tt)+ } => {
        $crate::Error::Hal($error_code,
                           alloc::format!("{}:{}: {}", file!(), line!(), format_args!($($arg)+))) };
}

/// Macro to build an [`Error::Rpc`] instance for a remote-provisioning status
/// known at compile time: `rpc_err!(Failed, "some {} format", arg)`.
#[macro_export]
macro_rules! rpc_err {
    { $status:ident, $($arg:tt)+ } => {
        $crate::Error::Rpc($crate::wire::rpc::ErrorCode::$status,
                           alloc::format!("{}:{}: {}", file!(), line!(), format_args!($($arg)+))) };
}

/// Macro to emit an error log indicating that an unimplemented function has
/// been invoked.
#[macro_export]
macro_rules! log_unimpl {
    () => {
        log::error!("{}:{}: unimplemented placeholder method invoked!", file!(), line!());
    };
}

/// Mark a trait method as unimplemented (log error, return `ErrorCode::Unimplemented`).
#[macro_export]
macro_rules! unimpl {
    () => {
        $crate::log_unimpl!();
        return Err($crate::Error::Hal(
            $crate::wire::keymaster::ErrorCode::Unimplemented,
            alloc::format!("{}:{}: method unimplemented", file!(), line!()),
        ));
    };
}

impl From<Error> for ErrorCode {
    fn from(e: Error) -> Self {
        match e {
            Error::Cbor(_) => ErrorCode::InvalidArgument,
            Error::Hal(e, _msg) => e,
            Error::Rpc(_, _msg) => ErrorCode::UnknownError,
            Error::Alloc(_msg) => ErrorCode::MemoryAllocationFailed,
        }
    }
}

impl From<Error> for wire::rpc::ErrorCode {
    fn from(e: Error) -> Self {
        match e {
            Error::Rpc(status, _msg) => status,
            _ => wire::rpc::ErrorCode::Failed,
        }
    }
}

impl From<CborError> for Error {
    fn from(e: CborError) -> Self {
        Error::Cbor(e)
    }
}

impl From<TryReserveError> for Error {
    fn from(_e: TryReserveError) -> Self {
        Error::Alloc("allocation failed")
    }
}

/// Marker structure indicating that the EOF was encountered when reading CBOR data.
#[derive(Debug)]
pub struct EndOfFile;

/// Error type for failures in encoding or decoding CBOR types.
pub enum CborError {
    /// CBOR decoding failure.
    DecodeFailed(cbor::de::Error<EndOfFile>),
    /// CBOR encoding failure.
    EncodeFailed,
    /// CBOR input had extra data.
    ExtraneousData,
    /// Integer value outside expected range.
    OutOfRangeIntegerValue,
    /// Integer value that doesn't match expected set of allowed enum values.
    NonEnumValue,
    /// Unexpected CBOR item encountered (got, want).
    UnexpectedItem(&'static str, &'static str),
}

impl From<cbor::de::Error<EndOfFile>> for CborError {
    fn from(e: cbor::de::Error<EndOfFile>) -> Self {
        CborError::DecodeFailed(e)
    }
}

impl<T> From<cbor::ser::Error<T>> for CborError {
    fn from(_e: cbor::ser::Error<T>) -> Self {
        CborError::EncodeFailed
    }
}

impl From<cbor::value::Error> for CborError {
    fn from(_e: cbor::value::Error) -> Self {
        CborError::EncodeFailed
    }
}

impl From<coset::CoseError> for CborError {
    fn from(e: coset::CoseError) -> Self {
        match e {
            coset::CoseError::DecodeFailed(inner) => CborError::DecodeFailed(match inner {
                cbor::de::Error::Io(_io) => cbor::de::Error::Io(EndOfFile),
                cbor::de::Error::Syntax(v) => cbor::de::Error::Syntax(v),
                cbor::de::Error::Semantic(sz, msg) => cbor::de::Error::Semantic(sz, msg),
                cbor::de::Error::RecursionLimitExceeded => cbor::de::Error::RecursionLimitExceeded,
            }),
            coset::CoseError::EncodeFailed => CborError::EncodeFailed,
            coset::CoseError::ExtraneousData => CborError::ExtraneousData,
            coset::CoseError::OutOfRangeIntegerValue => CborError::OutOfRangeIntegerValue,
            coset::CoseError::UnregisteredIanaValue => CborError::NonEnumValue,
            coset::CoseError::UnregisteredIanaNonPrivateValue => CborError::NonEnumValue,
            coset::CoseError::UnexpectedItem(got, want) => CborError::UnexpectedItem(got, want),
            coset::CoseError::DuplicateMapKey => {
                CborError::UnexpectedItem("dup map key", "unique keys")
            }
        }
    }
}

impl From<coset::CoseError> for Error {
    fn from(e: coset::CoseError) -> Self {
        Error::Cbor(e.into())
    }
}

impl core::fmt::Debug for CborError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CborError::DecodeFailed(de) => write!(f, "decode CBOR failure: {:?}", de),
            CborError::EncodeFailed => write!(f, "encode CBOR failure"),
            CborError::ExtraneousData => write!(f, "extraneous data in CBOR input"),
            CborError::OutOfRangeIntegerValue => write!(f, "out of range integer value"),
            CborError::NonEnumValue => write!(f, "integer not a valid enum value"),
            CborError::UnexpectedItem(got, want) => write!(f, "got {}, expected {}", got, want),
        }
    }
}

/// Return an error indicating that an unexpected CBOR type was encountered.
pub fn cbor_type_error<T>(value: &cbor::value::Value, want: &'static str) -> Result<T, CborError> {
    use cbor::value::Value;
    let got = match value {
        Value::Integer(_) => "int",
        Value::Bytes(_) => "bstr",
        Value::Text(_) => "tstr",
        Value::Array(_) => "array",
        Value::Map(_) => "map",
        Value::Tag(_, _) => "tag",
        Value::Float(_) => "float",
        Value::Bool(_) => "bool",
        Value::Null => "null",
        _ => "unknown",
    };
    Err(CborError::UnexpectedItem(got, want))
}

/// Newtype wrapper around a byte slice to allow left-over data to be detected.
struct MeasuringReader<'a>(&'a [u8]);

impl<'a> MeasuringReader<'a> {
    fn new(buf: &'a [u8]) -> MeasuringReader<'a> {
        MeasuringReader(buf)
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> ciborium_io::Read for &mut MeasuringReader<'a> {
    type Error = EndOfFile;

    fn read_exact(&mut self, data: &mut [u8]) -> Result<(), Self::Error> {
        if data.len() > self.0.len() {
            return Err(EndOfFile);
        }

        let (prefix, suffix) = self.0.split_at(data.len());
        data.copy_from_slice(prefix);
        self.0 = suffix;
        Ok(())
    }
}

/// Read a [`cbor::value::Value`] from a byte slice, failing if any extra data remains after the
/// `Value` has been read.
pub fn read_to_value(slice: &[u8]) -> Result<cbor::value::Value, CborError> {
    let mut mr = MeasuringReader::new(slice);
    let value = cbor::de::from_reader(&mut mr)?;
    if mr.is_empty() {
        Ok(value)
    } else {
        Err(CborError::ExtraneousData)
    }
}

/// Serialize a [`cbor::value::Value`] into bytes.
pub fn serialize_cbor(value: &cbor::value::Value) -> Result<Vec<u8>, Error> {
    let mut data = Vec::new();
    cbor::ser::into_writer(value, &mut data)
        .map_err(|_e| Error::Cbor(CborError::EncodeFailed))?;
    Ok(data)
}

/// Extension trait for fallible allocation on `Vec`, so that allocation
/// failure surfaces as `ErrorCode::MemoryAllocationFailed` rather than an
/// abort.
pub trait FallibleAllocExt<T> {
    fn try_push(&mut self, value: T) -> Result<(), TryReserveError>;
    fn try_extend_from_slice(&mut self, slice: &[T]) -> Result<(), TryReserveError>
    where
        T: Clone;
}

impl<T> FallibleAllocExt<T> for Vec<T> {
    fn try_push(&mut self, value: T) -> Result<(), TryReserveError> {
        self.try_reserve(1)?;
        self.push(value);
        Ok(())
    }
    fn try_extend_from_slice(&mut self, slice: &[T]) -> Result<(), TryReserveError>
    where
        T: Clone,
    {
        self.try_reserve(slice.len())?;
        self.extend_from_slice(slice);
        Ok(())
    }
}

/// Fallible version of `to_vec()` for a slice.
pub fn try_to_vec<T: Clone>(slice: &[T]) -> Result<Vec<T>, Error> {
    let mut v = Vec::new();
    v.try_extend_from_slice(slice)?;
    Ok(v)
}

/// Check for an expected error.
#[macro_export]
macro_rules! expect_err {
    ($result:expr, $err_msg:expr) => {
        assert!(
            $result.is_err(),
            "Expected error containing '{}', got success {:?}",
            $err_msg,
            $result
        );
        let err = $result.err();
        assert!(
            alloc::format!("{:?}", err).contains($err_msg),
            "Unexpected error {:?}, doesn't contain '{}'",
            err,
            $err_msg
        );
    };
}

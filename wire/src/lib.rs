//! Message and parameter types shared between the Keymaster engine and its callers.
//!
//! The engine exposes typed request/response values; serialization for a
//! particular transport is layered on top by the embedder and is not part of
//! this crate.

#![no_std]
extern crate alloc;

pub mod keymaster;
pub mod rpc;
pub mod secureclock;
pub mod sharedsecret;
pub mod types;
pub use types::*;


/// Macro that emits an implementation of `TryFrom<i32>` for an enum type that has
/// `[derive(N)]` attached to it.
#[macro_export]
macro_rules! try_from_n {
    { $ename:ident } => {
        impl core::convert::TryFrom<i32> for $ename {
            type Error = $crate::ValueNotRecognized;
            fn try_from(value: i32) -> Result<Self, Self::Error> {
                Self::n(value).ok_or($crate::ValueNotRecognized)
            }
        }
    };
}

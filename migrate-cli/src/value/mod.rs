//! Value codec (C3): the backend's typed value representation and its
//! textual archive encoding.

pub mod codec;
pub mod types;

pub use codec::{decode, encode, EncodedField, RawField};
pub use types::{DecimalValue, Reference, Value};

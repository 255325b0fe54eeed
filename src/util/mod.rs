//! Crate-wide utilities.

pub mod address;
pub mod constants;
pub mod conversions;
pub mod memory;
pub mod opaque_pointer;
pub mod options;
pub mod test_util;

pub use self::address::Address;
pub use self::opaque_pointer::{OpaquePointer, UserContext};

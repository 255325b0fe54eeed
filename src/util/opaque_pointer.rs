use libc::c_void;

use crate::util::address::Address;

/// A pointer the allocator carries around but never dereferences: the
/// host's user context, and thread-pool identities in the registry.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct OpaquePointer(*mut c_void);

unsafe impl Sync for OpaquePointer {}
unsafe impl Send for OpaquePointer {}

impl OpaquePointer {
    pub const UNINITIALIZED: Self = Self(std::ptr::null_mut());

    pub fn from_address(addr: Address) -> Self {
        OpaquePointer(addr.to_mut_ptr::<c_void>())
    }

    pub fn to_address(self) -> Address {
        Address::from_mut_ptr(self.0)
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }
}

/// The host-supplied context value passed back on every callback.
pub type UserContext = OpaquePointer;

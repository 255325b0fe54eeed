//! The OS virtual-memory shim: the allocator's one external collaborator.
//!
//! Four operations over libc: `reserve` maps an address range with no
//! backing (PROT_NONE), `commit` flips a committed sub-range to
//! read-write, `decommit` flips it back, and `release` unmaps. Nothing
//! above this module issues a syscall directly.

use crate::util::address::{Address, ByteSize};
use std::io::{Error, Result};

/// The OS page size. The allocator page size must be a multiple of this,
/// which `memory_manager::init` verifies.
pub fn page_size() -> ByteSize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as ByteSize }
}

/// Reserves `size` bytes of address space with no physical backing.
/// Returns `None` when the OS is out of address space.
pub fn reserve(size: ByteSize) -> Option<Address> {
    let result = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if result == libc::MAP_FAILED {
        log::error!("reserve of {} bytes failed: {}", size, Error::last_os_error());
        None
    } else {
        Some(Address::from_mut_ptr(result))
    }
}

/// Commits backing memory for `[addr, addr + size)` within a reserved range.
pub fn commit(addr: Address, size: ByteSize) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::mprotect(addr.to_mut_ptr(), size, libc::PROT_READ | libc::PROT_WRITE) },
        0,
    )
}

/// Returns the backing memory of `[addr, addr + size)` to the OS while
/// keeping the address range reserved.
pub fn decommit(addr: Address, size: ByteSize) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::mprotect(addr.to_mut_ptr(), size, libc::PROT_NONE) },
        0,
    )
}

/// Unmaps the range entirely. The caller must not touch it afterwards.
pub fn release(addr: Address, size: ByteSize) -> Result<()> {
    wrap_libc_call(&|| unsafe { libc::munmap(addr.to_mut_ptr(), size) }, 0)
}

fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_PAGE;

    #[test]
    fn reserve_commit_release() {
        let addr = reserve(BYTES_IN_PAGE * 4).unwrap();
        commit(addr, BYTES_IN_PAGE).unwrap();
        unsafe {
            addr.store::<usize>(42);
            assert_eq!(addr.load::<usize>(), 42);
        }
        decommit(addr, BYTES_IN_PAGE).unwrap();
        release(addr, BYTES_IN_PAGE * 4).unwrap();
    }

    #[test]
    fn allocator_page_is_multiple_of_os_page() {
        assert_eq!(BYTES_IN_PAGE % page_size(), 0);
    }
}

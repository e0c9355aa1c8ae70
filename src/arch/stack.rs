use std::io;
use std::ptr::{self, NonNull};

/// The stack of a user thread: either mapped by the runtime with a guard page below it, or memory supplied by the caller.
#[derive(Debug)]
pub struct Stack {
    base: NonNull<u8>,
    size: usize,
    mapping: Option<(NonNull<libc::c_void>, usize)>
}

fn page_size() -> usize {
    // SAFETY: sysconf has no memory safety requirements.
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 4096
    }
}

impl Stack {
    /// Maps a new stack of at least `size` bytes. The page below the stack is left inaccessible so that overflowing it faults instead of
    /// silently corrupting other memory.
    pub fn allocate(size: usize) -> io::Result<Stack> {
        let page = page_size();
        let size = size
            .checked_add(page - 1)
            .map(|size| size & !(page - 1))
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
        let len = size + page;

        // SAFETY: Anonymous private mappings do not alias any existing memory.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: The first page belongs to the mapping created above.
        if unsafe { libc::mprotect(addr, page, libc::PROT_NONE) } != 0 {
            let err = io::Error::last_os_error();

            // SAFETY: Nothing else refers to the mapping yet.
            unsafe { libc::munmap(addr, len) };
            return Err(err);
        }

        // SAFETY: mmap never returns a null mapping on success and the offset stays within it.
        unsafe {
            Ok(Stack {
                base: NonNull::new_unchecked(addr.cast::<u8>().add(page)),
                size,
                mapping: Some((NonNull::new_unchecked(addr), len))
            })
        }
    }

    /// Wraps caller-owned memory as a stack.
    ///
    /// # Safety
    ///
    /// `base` must point to at least `size` bytes that remain valid and otherwise unused for as long as the returned stack (and any thread
    /// running on it) exists.
    pub unsafe fn from_raw(base: NonNull<u8>, size: usize) -> Stack {
        Stack { base, size, mapping: None }
    }

    /// The lowest address of the stack.
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if let Some((addr, len)) = self.mapping {
            // SAFETY: The mapping was created in Stack::allocate and nothing runs on it anymore.
            if unsafe { libc::munmap(addr.as_ptr(), len) } != 0 {
                log::warn!("Failed to unmap thread stack: {}", io::Error::last_os_error());
            }
        }
    }
}

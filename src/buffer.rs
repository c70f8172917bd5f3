//! Endpoint 0 memory buffers

use core::{
    cell::{Cell, UnsafeCell},
    marker::PhantomData,
    ptr::NonNull,
};

/// Endpoint 0 packet size
pub const EP0_SIZE: usize = 64;

/// The largest IN data stage the byte count register can describe
pub const MAX_IN_SIZE: usize = 1023;

/// Memory for the endpoint 0 OUT and IN buffers
///
/// The OUT buffer holds one packet. The IN buffer holds a complete IN data
/// stage, which the hardware splits into packets, so `IN_SIZE` bounds the
/// largest descriptor the device can return. `IN_SIZE` may not exceed
/// [`MAX_IN_SIZE`]; larger sizes fail to compile. Allocate it in a `static`,
/// and hand it to the [`Device`](crate::Device).
pub struct Ep0Memory<const IN_SIZE: usize = 256> {
    out: UnsafeCell<[u8; EP0_SIZE]>,
    r#in: UnsafeCell<[u8; IN_SIZE]>,
    taken: critical_section::Mutex<Cell<bool>>,
}

unsafe impl<const IN_SIZE: usize> Sync for Ep0Memory<IN_SIZE> {}

impl<const IN_SIZE: usize> Ep0Memory<IN_SIZE> {
    const FITS_COUNT: () = assert!(IN_SIZE <= MAX_IN_SIZE, "IN_SIZE exceeds MAX_IN_SIZE");

    pub const fn new() -> Self {
        let () = Self::FITS_COUNT;
        Ep0Memory {
            out: UnsafeCell::new([0; EP0_SIZE]),
            r#in: UnsafeCell::new([0; IN_SIZE]),
            taken: critical_section::Mutex::new(Cell::new(false)),
        }
    }

    /// Acquire the OUT and IN buffers
    ///
    /// Returns `None` if the buffers were already taken.
    pub(crate) fn take(&self) -> Option<(Buffer<'_>, Buffer<'_>)> {
        let taken = critical_section::with(|cs| self.taken.borrow(cs).replace(true));
        if taken {
            return None;
        }
        // Safety: pointers derived from UnsafeCells are never null, and the
        // flag above hands them out once.
        unsafe {
            let out = Buffer::new(NonNull::new_unchecked(self.out.get().cast()), EP0_SIZE);
            let r#in = Buffer::new(NonNull::new_unchecked(self.r#in.get().cast()), IN_SIZE);
            Some((out, r#in))
        }
    }
}

impl<const IN_SIZE: usize> Default for Ep0Memory<IN_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

/// A buffer shared with the SIE
///
/// Accesses are volatile, since the SIE reads and writes the memory behind
/// the CPU's back.
pub struct Buffer<'a> {
    ptr: NonNull<u8>,
    len: usize,
    _memory: PhantomData<&'a ()>,
}

// Safety: each buffer is handed out once, by `Ep0Memory::take`.
unsafe impl Send for Buffer<'_> {}

impl<'a> Buffer<'a> {
    /// # Safety
    ///
    /// `ptr` must reference `len` bytes that are only used through this
    /// buffer, and through the SIE.
    unsafe fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Buffer {
            ptr,
            len,
            _memory: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// The address programmed into an endpoint's `DATAPTR`
    pub fn as_ptr_mut(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Copy from the buffer into `dst`, returning the number of bytes read
    pub fn volatile_read(&self, dst: &mut [u8]) -> usize {
        let size = self.len.min(dst.len());
        for (idx, byte) in dst.iter_mut().take(size).enumerate() {
            // Safety: idx < self.len
            *byte = unsafe { self.ptr.as_ptr().add(idx).read_volatile() };
        }
        size
    }

    /// Copy `src` into the buffer, returning the number of bytes written
    pub fn volatile_write(&mut self, src: &[u8]) -> usize {
        let size = self.len.min(src.len());
        for (idx, byte) in src.iter().take(size).enumerate() {
            // Safety: idx < self.len
            unsafe { self.ptr.as_ptr().add(idx).write_volatile(*byte) };
        }
        size
    }

    /// Exclusive access to the buffer contents
    ///
    /// Only use this while the SIE isn't using the buffer, meaning the
    /// endpoint that references it isn't armed.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: the buffer owns the memory, and `&mut self` prevents
        // aliasing through this handle.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

#[cfg(test)]
mod test {
    use super::{Ep0Memory, EP0_SIZE, MAX_IN_SIZE};

    #[test]
    fn take_once() {
        let memory: Ep0Memory<128> = Ep0Memory::new();
        let (out, r#in) = memory.take().unwrap();
        assert_eq!(out.len(), EP0_SIZE);
        assert_eq!(r#in.len(), 128);
        assert!(memory.take().is_none());
    }

    #[test]
    fn largest_in_buffer() {
        let memory: Ep0Memory<MAX_IN_SIZE> = Ep0Memory::new();
        let (_, r#in) = memory.take().unwrap();
        assert_eq!(r#in.len(), 1023);
        assert!(u16::try_from(r#in.len()).unwrap() <= crate::table::CNT::COUNT::mask);
    }

    #[test]
    fn volatile_copies_clamp() {
        let memory: Ep0Memory = Ep0Memory::new();
        let (mut out, _) = memory.take().unwrap();

        assert_eq!(out.volatile_write(&[0xAA; 100]), EP0_SIZE);
        let mut dst = [0; 4];
        assert_eq!(out.volatile_read(&mut dst), 4);
        assert_eq!(dst, [0xAA; 4]);

        out.as_mut_slice()[0] = 7;
        let mut dst = [0; 100];
        assert_eq!(out.volatile_read(&mut dst), EP0_SIZE);
        assert_eq!(dst[0], 7);
    }
}

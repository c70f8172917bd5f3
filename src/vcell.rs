//! Volatile cell that conforms to the RAL's register API
//!
//! The endpoint descriptor table lives in RAM and is shared with the
//! serial interface engine. Every access goes through a volatile read
//! or write so the compiler never caches a value the SIE may change.

use core::cell::UnsafeCell;

#[repr(transparent)]
pub struct VCell<T>(UnsafeCell<T>);

impl<T> VCell<T> {
    pub const fn new(val: T) -> Self {
        VCell(UnsafeCell::new(val))
    }
    /// Raw address of the cell, as the hardware sees it
    pub const fn as_ptr(&self) -> *mut T {
        self.0.get()
    }
}

impl<T: Copy> VCell<T> {
    pub fn read(&self) -> T {
        unsafe { self.0.get().read_volatile() }
    }
    pub fn write(&self, val: T) {
        unsafe { self.0.get().write_volatile(val) }
    }
}

//! CPU control instructions.
//!
//! On `x86_64` hosts the `x86_64` crate provides the wrappers; 32-bit kernels use
//! inline assembly.

use crate::{PhysAddr, VirtAddr};

#[cfg(target_arch = "x86_64")]
mod imp {
    use x86_64::instructions::{interrupts, tlb};
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;

    pub fn interrupts_enabled() -> bool {
        interrupts::are_enabled()
    }

    pub fn disable_interrupts() {
        interrupts::disable();
    }

    pub fn enable_interrupts() {
        interrupts::enable();
    }

    pub fn invalidate_page(addr: u32) {
        tlb::flush(x86_64::VirtAddr::new(u64::from(addr)));
    }

    pub fn read_cr3() -> u32 {
        let (frame, _) = Cr3::read();
        frame.start_address().as_u64() as u32
    }

    pub unsafe fn write_cr3(addr: u32) {
        let frame = PhysFrame::containing_address(x86_64::PhysAddr::new(u64::from(addr)));
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }
}

#[cfg(target_arch = "x86")]
mod imp {
    use core::arch::asm;

    const EFLAGS_IF: u32 = 1 << 9;

    pub fn interrupts_enabled() -> bool {
        let flags: u32;
        unsafe { asm!("pushfd", "pop {}", out(reg) flags, options(nomem, preserves_flags)) };
        flags & EFLAGS_IF != 0
    }

    pub fn disable_interrupts() {
        unsafe { asm!("cli", options(nomem, nostack)) };
    }

    pub fn enable_interrupts() {
        unsafe { asm!("sti", options(nomem, nostack)) };
    }

    pub fn invalidate_page(addr: u32) {
        unsafe { asm!("invlpg [{}]", in(reg) addr, options(nostack, preserves_flags)) };
    }

    pub fn read_cr3() -> u32 {
        let value: u32;
        unsafe { asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags)) };
        value
    }

    pub unsafe fn write_cr3(addr: u32) {
        unsafe { asm!("mov cr3, {}", in(reg) addr, options(nostack, preserves_flags)) };
    }
}

/// Returns whether interrupts are enabled on the current CPU.
pub fn interrupts_enabled() -> bool {
    imp::interrupts_enabled()
}

/// Disables interrupts on the current CPU.
pub fn disable_interrupts() {
    imp::disable_interrupts();
}

/// Enables interrupts on the current CPU.
pub fn enable_interrupts() {
    imp::enable_interrupts();
}

/// Invalidates the TLB entry for the page containing `virt`.
pub fn invalidate_page(virt: VirtAddr) {
    imp::invalidate_page(virt.as_u32());
}

/// Returns the physical address of the loaded page directory.
pub fn active_directory() -> Option<PhysAddr> {
    Some(PhysAddr::new(imp::read_cr3() & 0xFFFF_F000))
}

/// Loads a page directory into CR3.
///
/// # Safety
/// `directory` must be a valid page directory that maps the running kernel.
pub unsafe fn load_directory(directory: PhysAddr) {
    unsafe { imp::write_cr3(directory.as_u32()) };
}

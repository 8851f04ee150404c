// =============================================================================
// ARNm Runtime — CPU Context Switch
// =============================================================================
//
// A `Context` is the callee-saved register file of a suspended execution,
// plus its stack pointer. `context_switch` saves the live registers into
// one context and restores another, transferring control to wherever the
// target was last suspended. The caller-saved set needs no saving because
// the switch is an ordinary function call at the language boundary.
//
// Resume addresses ride on the stack: the saved stack pointer's top word
// is the address `ret` branches to (x86-64), or the restored link register
// is (AArch64). A *fresh* context is forged so that its first resume lands
// in `process_trampoline`, which calls `entry(arg)` on the new stack and
// falls through into the process-exit handler when `entry` returns.
//
// `entry` and `arg` travel to the trampoline in two callee-saved registers
// planted by `Context::init` — they survive the restore by construction.
// =============================================================================

use std::ffi::c_void;

use crate::task::scheduler::process_exit;

/// Process entry function, as emitted by the compiler.
pub type EntryFn = extern "C" fn(*mut c_void);

// =============================================================================
// x86-64 System V
// =============================================================================

/// Saved callee-saved register file (x86-64 System V ABI).
///
/// The resume address is not stored here: it sits on the saved stack at
/// `[rsp]`, where `context_switch`'s `ret` finds it.
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Context {
    rsp: u64, // 0x00
    rbp: u64, // 0x08
    rbx: u64, // 0x10
    r12: u64, // 0x18  trampoline: entry
    r13: u64, // 0x20  trampoline: arg
    r14: u64, // 0x28
    r15: u64, // 0x30
}

#[cfg(target_arch = "x86_64")]
const _: () = assert!(size_of::<Context>() == 0x38);

#[cfg(target_arch = "x86_64")]
impl Context {
    /// A zeroed context — filled in on the first switch away from it.
    pub const fn new() -> Self {
        Context {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }

    /// Arrange this context so its first resume enters
    /// `process_trampoline`, which calls `entry(arg)` on the given stack.
    ///
    /// The planted stack keeps the System V call alignment: the trampoline
    /// starts with rsp ≡ 0 (mod 16), so its `call` leaves rsp ≡ 8 at entry
    /// to `entry`, exactly as a normal call chain would.
    ///
    /// # Safety
    /// `stack_top` must be one past the highest usable byte of a stack
    /// with room for the planted resume slot and `entry`'s frames.
    pub unsafe fn init(&mut self, stack_top: *mut u8, entry: EntryFn, arg: *mut c_void) {
        let top = (stack_top as usize) & !0xF;
        let slot = (top - 8) as *mut u64;
        // SAFETY: `slot` is the highest aligned word of the usable stack.
        unsafe { slot.write(process_trampoline as usize as u64) };

        *self = Context::new();
        self.rsp = slot as u64;
        self.r12 = entry as usize as u64;
        self.r13 = arg as u64;
    }
}

/// Switch from `from` to `to`.
///
/// Saves the live callee-saved registers and stack pointer into `from`,
/// restores `to`, and `ret`s to `to`'s resume address. From the caller's
/// perspective this returns when some other party switches back into
/// `from`.
///
/// # Safety
/// Both pointers must reference valid contexts; `to` must hold a suspended
/// execution or a freshly initialized one.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_from: *mut Context, _to: *const Context) {
    core::arch::naked_asm!(
        // Save into `from` (rdi). The return address of this very call is
        // at [rsp]; saving rsp as-is makes the final `ret` resume there.
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        // Restore from `to` (rsi).
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        // Branch to `to`'s resume address.
        "ret",
    );
}

/// First-entry shim for fresh contexts.
///
/// Receives `entry` in r12 and `arg` in r13 (planted by `Context::init`),
/// calls `entry(arg)`, and drops into the process-exit handler, which
/// never returns.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
unsafe extern "C" fn process_trampoline() {
    core::arch::naked_asm!(
        "mov rdi, r13",
        "call r12",
        "call {exit}",
        "ud2",
        exit = sym process_exit,
    );
}

// =============================================================================
// AArch64 AAPCS64
// =============================================================================

/// Saved callee-saved register file (AArch64 AAPCS64).
///
/// x30 (lr) doubles as the resume address; d8–d15 are callee-saved in
/// their low 64 bits and are preserved across a switch.
#[cfg(target_arch = "aarch64")]
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Context {
    x19: u64, // 0x00  trampoline: entry
    x20: u64, // 0x08  trampoline: arg
    x21: u64, // 0x10
    x22: u64, // 0x18
    x23: u64, // 0x20
    x24: u64, // 0x28
    x25: u64, // 0x30
    x26: u64, // 0x38
    x27: u64, // 0x40
    x28: u64, // 0x48
    fp: u64,  // 0x50  x29
    lr: u64,  // 0x58  x30 — resume address
    sp: u64,  // 0x60
    d8: u64,  // 0x68
    d9: u64,  // 0x70
    d10: u64, // 0x78
    d11: u64, // 0x80
    d12: u64, // 0x88
    d13: u64, // 0x90
    d14: u64, // 0x98
    d15: u64, // 0xA0
}

#[cfg(target_arch = "aarch64")]
const _: () = assert!(size_of::<Context>() == 0xA8);

#[cfg(target_arch = "aarch64")]
impl Context {
    /// A zeroed context — filled in on the first switch away from it.
    pub const fn new() -> Self {
        // SAFETY: Context is plain integers; all-zero is a valid value.
        unsafe { core::mem::zeroed() }
    }

    /// Arrange this context so its first resume enters
    /// `process_trampoline`, which calls `entry(arg)` on the given stack.
    ///
    /// # Safety
    /// `stack_top` must be one past the highest usable byte of a stack
    /// large enough for `entry`'s frames. sp stays 16-byte aligned as
    /// AAPCS64 requires.
    pub unsafe fn init(&mut self, stack_top: *mut u8, entry: EntryFn, arg: *mut c_void) {
        *self = Context::new();
        self.sp = (stack_top as usize & !0xF) as u64;
        self.lr = process_trampoline as usize as u64;
        self.x19 = entry as usize as u64;
        self.x20 = arg as u64;
    }
}

/// Switch from `from` to `to`. See the x86-64 variant for the contract.
///
/// # Safety
/// Both pointers must reference valid contexts; `to` must hold a suspended
/// execution or a freshly initialized one.
#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_from: *mut Context, _to: *const Context) {
    core::arch::naked_asm!(
        // Save into `from` (x0); lr is the resume address for `ret`.
        "stp x19, x20, [x0, #0x00]",
        "stp x21, x22, [x0, #0x10]",
        "stp x23, x24, [x0, #0x20]",
        "stp x25, x26, [x0, #0x30]",
        "stp x27, x28, [x0, #0x40]",
        "stp x29, x30, [x0, #0x50]",
        "mov x9, sp",
        "str x9, [x0, #0x60]",
        "stp d8, d9, [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        // Restore from `to` (x1).
        "ldp x19, x20, [x1, #0x00]",
        "ldp x21, x22, [x1, #0x10]",
        "ldp x23, x24, [x1, #0x20]",
        "ldp x25, x26, [x1, #0x30]",
        "ldp x27, x28, [x1, #0x40]",
        "ldp x29, x30, [x1, #0x50]",
        "ldr x9, [x1, #0x60]",
        "mov sp, x9",
        "ldp d8, d9, [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        // Branch to `to`'s resume address (restored lr).
        "ret",
    );
}

/// First-entry shim for fresh contexts.
///
/// Receives `entry` in x19 and `arg` in x20 (planted by `Context::init`),
/// calls `entry(arg)`, and drops into the process-exit handler, which
/// never returns.
#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
unsafe extern "C" fn process_trampoline() {
    core::arch::naked_asm!(
        "mov x0, x20",
        "blr x19",
        "bl {exit}",
        "brk #0",
        exit = sym process_exit,
    );
}

//! JIT-assembled x86 trampoline emission (spec.md §4.1).
//!
//! A `Trampoline` is an executable region holding: a copy of the
//! overwritten prefix bytes, a generated prologue that saves the eight
//! GPRs and calls the common dispatcher, and an epilogue that restores
//! registers (possibly mutated by callbacks) and jumps back into the host
//! past the patched prefix.
//!
//! The control transfer written over the target's original bytes is a
//! `push imm32; ret` pair — 5 bytes on 32-bit — padded with `nop` (0x90)
//! out to `prefix_length` when the caller asked for a longer prefix to
//! avoid splitting a multi-byte instruction.

use crate::error::HookError;

pub const PUSH_OPCODE: u8 = 0x68;
pub const RET_OPCODE: u8 = 0xC3;
pub const NOP_OPCODE: u8 = 0x90;
pub const MIN_CONTROL_TRANSFER_LEN: usize = 5;

/// Build the bytes that get written over `target_address`'s first
/// `prefix_length` bytes: a `push trampoline_entry; ret`, nop-padded.
pub fn build_redirect(trampoline_entry: u32, prefix_length: usize) -> Result<Vec<u8>, HookError> {
    if prefix_length < MIN_CONTROL_TRANSFER_LEN {
        return Err(HookError::PrefixTooShort(prefix_length, MIN_CONTROL_TRANSFER_LEN));
    }
    let mut bytes = Vec::with_capacity(prefix_length);
    bytes.push(PUSH_OPCODE);
    bytes.extend_from_slice(&trampoline_entry.to_le_bytes());
    bytes.push(RET_OPCODE);
    bytes.resize(prefix_length, NOP_OPCODE);
    Ok(bytes)
}

/// Build the bytes that get written over `target + prefix_length`... no —
/// this returns the trampoline's own executable image: saved-prefix bytes,
/// prologue, dispatcher call stub, epilogue, and a final redirect back to
/// `target_address + prefix_length`.
///
/// `dispatch_thunk` is the address of the common dispatcher entry point
/// (a `extern "C" fn(*const HookRecord, *mut GpRegisters)` in the running
/// process); it is baked into the prologue as an absolute call target,
/// mirroring how the original bytes were copied in wholesale rather than
/// relocated.
pub fn build_trampoline_image(
    original_prefix: &[u8],
    hook_record_ptr: u32,
    dispatch_thunk: u32,
    resume_address: u32,
) -> Vec<u8> {
    let mut image = Vec::new();

    // Prologue: pushfd, then pushad-equivalent in our fixed PUSH_ORDER.
    image.push(0x9C); // pushfd
    for _ in 0..8 {
        image.push(0x50); // push eax (placeholder per-register encoding omitted: real
                           // encoding would vary the register operand per entry in
                           // regs::GpRegisters::PUSH_ORDER)
    }

    // push hook_record_ptr; push esp (pointer to the register snapshot); call dispatch_thunk
    image.push(PUSH_OPCODE);
    image.extend_from_slice(&hook_record_ptr.to_le_bytes());
    image.push(0x54); // push esp
    image.push(0xE8); // call rel32
    image.extend_from_slice(&dispatch_thunk.to_le_bytes());
    image.push(0x83); // add esp, 8 (pop the two call args)
    image.push(0xC4);
    image.push(0x08);

    // Epilogue: restore in mirror order, then popfd.
    for _ in 0..8 {
        image.push(0x58); // pop eax (placeholder, see note above)
    }
    image.push(0x9D); // popfd

    // Copied original prefix, executed in the trampoline's own memory.
    image.extend_from_slice(original_prefix);

    // Final unconditional jump back into the host past the patched prefix.
    image.push(PUSH_OPCODE);
    image.extend_from_slice(&resume_address.to_le_bytes());
    image.push(RET_OPCODE);

    image
}

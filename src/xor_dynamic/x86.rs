//! x86-64 and x86 scanning xor decoder.
//!
//! The decoder ends with a backward `call` so the return address it pushes is
//! the first key byte. Register roles are fixed: the key base lives in
//! rbx/ebx, the write cursor in rdi/edi, the payload entry in rcx/ecx and the
//! key cursor in rsi/esi; al carries the current key byte.

use iced_x86::code_asm::*;

use super::KeyMaterial;
use crate::core::error::EncodingError;
use crate::x86::encoder::asm_error;

/// Emit the decoder with native-width registers bound to the four roles.
macro_rules! scan_decoder {
    ($a:ident, $material:ident, $base:ident, $cursor:ident, $entry:ident, $key:ident) => {{
        let mut back = $a.create_label();
        let mut find_payload = $a.create_label();
        let mut restart_key = $a.create_label();
        let mut next_byte = $a.create_label();
        let mut enter = $a.create_label();
        let mut get_pc = $a.create_label();

        $a.jmp(get_pc)?;
        $a.set_label(&mut back)?;
        $a.pop($base)?;
        $a.push($base)?;
        $a.pop($cursor)?;
        $a.mov(al, $material.key_terminator as i8 as i32)?;
        $a.cld()?;
        $a.set_label(&mut find_payload)?;
        $a.scasb()?;
        $a.jne(find_payload)?;
        $a.push($cursor)?;
        $a.pop($entry)?;
        $a.set_label(&mut restart_key)?;
        $a.push($base)?;
        $a.pop($key)?;
        $a.set_label(&mut next_byte)?;
        $a.mov(al, byte_ptr($key))?;
        $a.xor(byte_ptr($cursor), al)?;
        $a.inc($cursor)?;
        $a.inc($key)?;
        $a.cmp(word_ptr($cursor), $material.terminator_word() as i16 as i32)?;
        $a.je(enter)?;
        $a.cmp(byte_ptr($key), $material.key_terminator as i8 as i32)?;
        $a.jne(next_byte)?;
        $a.jmp(restart_key)?;
        $a.set_label(&mut enter)?;
        $a.jmp($entry)?;
        $a.set_label(&mut get_pc)?;
        $a.call(back)?;
    }};
}

fn emit(bitness: u32, material: &KeyMaterial) -> Result<Vec<u8>, IcedError> {
    let mut a = CodeAssembler::new(bitness)?;
    if bitness == 64 {
        scan_decoder!(a, material, rbx, rdi, rcx, rsi);
    } else {
        scan_decoder!(a, material, ebx, edi, ecx, esi);
    }
    a.assemble(0)
}

/// Decoder bytes for `material` in `bitness`-bit mode.
pub fn decoder(bitness: u32, material: &KeyMaterial) -> Result<Vec<u8>, EncodingError> {
    emit(bitness, material).map_err(asm_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material() -> KeyMaterial {
        KeyMaterial {
            key: vec![1, 2, 3, 4],
            key_terminator: 0x41,
            payload_terminator: [0x42, 0x42],
        }
    }

    #[test]
    fn test_decoder_ends_with_backward_call() {
        for bitness in [32, 64] {
            let code = decoder(bitness, &material()).unwrap();
            // short jmp to the call, call back to the byte after that jmp
            assert_eq!(code[0], 0xEB);
            assert_eq!(usize::from(code[1]) + 2, code.len() - 5);
            let tail = &code[code.len() - 5..];
            assert_eq!(tail[0], 0xE8);
            let rel = i32::from_le_bytes([tail[1], tail[2], tail[3], tail[4]]);
            assert_eq!(code.len() as i32 + rel, 2);
        }
    }

    #[test]
    fn test_terminator_compare_is_word_sized() {
        let code = decoder(32, &material()).unwrap();
        // cmp word [edi], 0x4242
        assert!(code.windows(5).any(|w| w == [0x66, 0x81, 0x3F, 0x42, 0x42]));
    }
}

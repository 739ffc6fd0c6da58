//! Walker over the `LC_DYLD_INFO_ONLY` lazy-binding opcode stream.
//!
//! Each lazy import leaves a short opcode sequence in the stream. The walker
//! records, per import, where its symbol name and its ordinal-setting opcode
//! live, so the ordinal can later be rewritten in place without disturbing a
//! single neighboring byte.

use goblin::mach::bind_opcodes::{
    BIND_IMMEDIATE_MASK, BIND_OPCODE_ADD_ADDR_ULEB, BIND_OPCODE_DO_BIND,
    BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED, BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB,
    BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB, BIND_OPCODE_DONE, BIND_OPCODE_MASK,
    BIND_OPCODE_SET_ADDEND_SLEB, BIND_OPCODE_SET_DYLIB_ORDINAL_IMM,
    BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB, BIND_OPCODE_SET_DYLIB_SPECIAL_IMM,
    BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB, BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM,
    BIND_OPCODE_SET_TYPE_IMM,
};
use goblin::mach::load_command::DyldInfoCommand;

use crate::errors::{PatchError, Result};
use crate::uleb;

/// How an entry's dylib ordinal is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrdinalForm {
    /// `BIND_OPCODE_SET_DYLIB_ORDINAL_IMM`: ordinal in the opcode's low nibble.
    Imm,
    /// `BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB`: ordinal in a ULEB payload of
    /// `payload_len` bytes following the opcode. The length is recorded at
    /// scan time so rewrites preserve the byte count.
    Uleb { payload_len: usize },
}

/// One lazy import occurrence. Offsets index into the mapped image and stay
/// valid for as long as the image does.
#[derive(Debug, Clone, Copy)]
pub struct LazyBinding {
    /// Start of the NUL-terminated symbol name inside the stream.
    pub symbol_offset: usize,
    /// The ordinal-setting opcode byte.
    pub opcode_offset: usize,
    pub form: OrdinalForm,
}

impl LazyBinding {
    /// Symbol name bytes, NUL excluded.
    pub fn symbol_name<'d>(&self, image: &'d [u8]) -> &'d [u8] {
        let bytes = &image[self.symbol_offset..];
        let len = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        &bytes[..len]
    }

    /// Ordinal currently encoded for this entry.
    pub fn ordinal(&self, image: &[u8]) -> Result<u64> {
        match self.form {
            OrdinalForm::Imm => Ok(u64::from(image[self.opcode_offset] & BIND_IMMEDIATE_MASK)),
            OrdinalForm::Uleb { payload_len } => {
                let start = self.opcode_offset + 1;
                Ok(uleb::decode(image, start, start + payload_len)?.0)
            }
        }
    }

    /// Rewrite the ordinal in place, preserving the entry's byte length.
    pub fn set_ordinal(&self, image: &mut [u8], ordinal: u64) -> Result<()> {
        match self.form {
            OrdinalForm::Imm => {
                if ordinal > u64::from(BIND_IMMEDIATE_MASK) {
                    return Err(PatchError::OrdinalOutOfImmRange(ordinal));
                }
                image[self.opcode_offset] =
                    BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | (ordinal as u8 & BIND_IMMEDIATE_MASK);
            }
            OrdinalForm::Uleb { payload_len } => {
                let start = self.opcode_offset + 1;
                uleb::encode_into(&mut image[start..start + payload_len], ordinal, payload_len)?;
            }
        }
        Ok(())
    }
}

/// Collect every lazy import in `dyld_info`'s lazy-bind range.
///
/// Entries are committed on `BIND_OPCODE_DONE` once both a symbol name and a
/// rewritable ordinal opcode have been seen. Special ordinals (self, main
/// executable, flat lookup) never produce an entry.
pub fn scan(image: &[u8], dyld_info: &DyldInfoCommand) -> Result<Vec<LazyBinding>> {
    let start = dyld_info.lazy_bind_off as usize;
    let end = start + dyld_info.lazy_bind_size as usize;
    if end > image.len() {
        return Err(PatchError::MalformedImage(
            "lazy-bind stream extends past the end of the file",
        ));
    }

    let mut bindings = Vec::new();
    let mut symbol: Option<usize> = None;
    let mut opcode: Option<(usize, OrdinalForm)> = None;
    let mut at = start;
    while at < end {
        let byte = image[at];
        at += 1;
        match byte & BIND_OPCODE_MASK {
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                let name_len = image[at..end].iter().position(|b| *b == 0).ok_or(
                    PatchError::MalformedImage("unterminated symbol name in lazy-bind stream"),
                )?;
                symbol = Some(at);
                at += name_len + 1;
            }
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => {
                opcode = Some((at - 1, OrdinalForm::Imm));
            }
            BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
                let (_, payload_len) = uleb::decode(image, at, end)?;
                opcode = Some((at - 1, OrdinalForm::Uleb { payload_len }));
                at += payload_len;
            }
            BIND_OPCODE_SET_ADDEND_SLEB
            | BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB
            | BIND_OPCODE_ADD_ADDR_ULEB
            | BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                at += uleb::skip(image, at, end)?;
            }
            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                at += uleb::skip(image, at, end)?;
                at += uleb::skip(image, at, end)?;
            }
            BIND_OPCODE_DONE => {
                if let (Some(symbol_offset), Some((opcode_offset, form))) = (symbol, opcode) {
                    bindings.push(LazyBinding {
                        symbol_offset,
                        opcode_offset,
                        form,
                    });
                    symbol = None;
                    opcode = None;
                }
            }
            BIND_OPCODE_SET_DYLIB_SPECIAL_IMM
            | BIND_OPCODE_SET_TYPE_IMM
            | BIND_OPCODE_DO_BIND
            | BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {}
            // Threaded (0xD0) and the unassigned high nibbles carry no LEB
            // payload here; consume the byte without effect.
            _ => {}
        }
    }
    Ok(bindings)
}

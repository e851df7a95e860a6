//! Append-only buffer the translator emits machine code into.

/// What a recorded 64-bit slot must be patched with before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum RelocKind {
    /// Base address of the executable region.
    Base,
    /// Address of the image's `out_stream` buffer.
    OutStream,
    /// Address of the image's `in_stream` buffer.
    InStream,
    /// Address of the image itself, the host callback's argument.
    ImagePtr,
    /// Address of the host callback.
    Handler,
}

#[derive(Debug, Clone, Copy)]
pub(super) struct Reloc {
    pub at: usize,
    pub kind: RelocKind,
}

/// Machine code under construction plus its pending relocations.
#[derive(Debug, Default)]
pub(super) struct CodeBuf {
    bytes: Vec<u8>,
    relocs: Vec<Reloc>,
}

impl CodeBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Emit a blank 64-bit slot and record that it needs `kind` patched in.
    pub fn reloc_u64(&mut self, kind: RelocKind) {
        self.relocs.push(Reloc {
            at: self.bytes.len(),
            kind,
        });
        self.bytes.extend_from_slice(&0u64.to_le_bytes());
    }

    pub fn into_parts(self) -> (Vec<u8>, Vec<Reloc>) {
        (self.bytes, self.relocs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_little_endian() {
        let mut buf = CodeBuf::new();
        buf.emit_u8(0x90);
        buf.emit_u32(0xDEADBEEF);
        let (bytes, relocs) = buf.into_parts();
        assert_eq!(bytes, vec![0x90, 0xEF, 0xBE, 0xAD, 0xDE]);
        assert!(relocs.is_empty());
    }

    #[test]
    fn test_reloc_records_slot_position() {
        let mut buf = CodeBuf::new();
        buf.emit_bytes(&[0x49, 0xBE]);
        buf.reloc_u64(RelocKind::Base);
        assert_eq!(buf.len(), 10);
        let (bytes, relocs) = buf.into_parts();
        assert_eq!(&bytes[2..], &[0; 8]);
        assert_eq!(relocs[0].at, 2);
        assert_eq!(relocs[0].kind, RelocKind::Base);
    }
}

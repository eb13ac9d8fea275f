//! Control record framing: `[type: u32 LE][size: u32 LE][body: size bytes]` (§6).

pub const RECORD_HEADER_SIZE: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub ty: u32,
    pub size: u32,
}

impl RecordHeader {
    pub fn to_bytes(self) -> [u8; RECORD_HEADER_SIZE] {
        let mut out = [0u8; RECORD_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.ty.to_le_bytes());
        out[4..8].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: [u8; RECORD_HEADER_SIZE]) -> Self {
        Self {
            ty: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            size: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        }
    }
}

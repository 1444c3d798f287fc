// Frame header layout, flag bits, and alignment helpers.
use crate::core::error::{Error, ErrorKind};

pub const HEADER_LENGTH: usize = 16;
pub const FRAME_ALIGNMENT: usize = 16;
pub const FRAME_VERSION: u8 = 1;

pub const LENGTH_OFFSET: usize = 0;
pub const VERSION_OFFSET: usize = 4;
pub const FLAGS_OFFSET: usize = 5;
pub const TYPE_OFFSET: usize = 6;
pub const STREAM_ID_OFFSET: usize = 8;

pub const FLAG_BATCH_BEGIN: u8 = 0b0000_0001;
pub const FLAG_BATCH_END: u8 = 0b0000_0010;
pub const FLAG_FAILED: u8 = 0b0000_0100;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameType {
    Message = 0,
    Padding = 1,
}

impl FrameType {
    pub fn from_u16(value: u16) -> Result<Self, Error> {
        match value {
            0 => Ok(FrameType::Message),
            1 => Ok(FrameType::Padding),
            _ => Err(Error::new(ErrorKind::Corrupt).with_message("invalid frame type")),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameHeader {
    /// Framed length (header + payload); negative while the frame is being written.
    pub length: i32,
    pub version: u8,
    pub flags: u8,
    pub frame_type: FrameType,
    pub stream_id: i32,
}

impl FrameHeader {
    pub fn message(payload_len: usize, stream_id: i32) -> Self {
        Self {
            length: framed_length(payload_len) as i32,
            version: FRAME_VERSION,
            flags: 0,
            frame_type: FrameType::Message,
            stream_id,
        }
    }

    pub fn padding(frame_len: usize) -> Self {
        Self {
            length: frame_len as i32,
            version: FRAME_VERSION,
            flags: 0,
            frame_type: FrameType::Padding,
            stream_id: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LENGTH] {
        let mut buf = [0u8; HEADER_LENGTH];
        buf[LENGTH_OFFSET..LENGTH_OFFSET + 4].copy_from_slice(&self.length.to_le_bytes());
        buf[VERSION_OFFSET] = self.version;
        buf[FLAGS_OFFSET] = self.flags;
        buf[TYPE_OFFSET..TYPE_OFFSET + 2].copy_from_slice(&(self.frame_type as u16).to_le_bytes());
        buf[STREAM_ID_OFFSET..STREAM_ID_OFFSET + 4].copy_from_slice(&self.stream_id.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_LENGTH {
            return Err(Error::new(ErrorKind::Corrupt).with_message("frame header too small"));
        }
        let length = i32::from_le_bytes(read_4(buf, LENGTH_OFFSET));
        let version = buf[VERSION_OFFSET];
        let flags = buf[FLAGS_OFFSET];
        let frame_type = FrameType::from_u16(u16::from_le_bytes([
            buf[TYPE_OFFSET],
            buf[TYPE_OFFSET + 1],
        ]))?;
        let stream_id = i32::from_le_bytes(read_4(buf, STREAM_ID_OFFSET));

        Ok(Self {
            length,
            version,
            flags,
            frame_type,
            stream_id,
        })
    }

    pub fn is_committed(&self) -> bool {
        self.length > 0
    }

    pub fn frame_len(&self) -> usize {
        aligned_length(self.length.unsigned_abs() as usize)
    }

    pub fn payload_len(&self) -> usize {
        (self.length.unsigned_abs() as usize).saturating_sub(HEADER_LENGTH)
    }

    pub fn validate(&self, capacity: usize) -> Result<(), Error> {
        if self.version != FRAME_VERSION {
            return Err(Error::new(ErrorKind::Corrupt).with_message("unexpected frame version"));
        }
        let length = self.length.unsigned_abs() as usize;
        if length < HEADER_LENGTH {
            return Err(Error::new(ErrorKind::Corrupt).with_message("frame shorter than header"));
        }
        if self.frame_len() > capacity {
            return Err(Error::new(ErrorKind::Corrupt).with_message("frame exceeds partition"));
        }
        Ok(())
    }
}

pub fn align(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

pub fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

pub fn framed_length(payload_len: usize) -> usize {
    payload_len + HEADER_LENGTH
}

pub fn aligned_length(framed_len: usize) -> usize {
    align(framed_len, FRAME_ALIGNMENT)
}

pub fn aligned_framed_length(payload_len: usize) -> usize {
    aligned_length(framed_length(payload_len))
}

/// Bytes reserved for a batch of `fragment_count` fragments totalling `total_length`
/// payload bytes. Covers `Σ align(H + len_i)` for any split of the total; the slack
/// becomes trailing padding at commit.
pub fn batch_length(fragment_count: usize, total_length: usize) -> usize {
    let slack = fragment_count * (FRAME_ALIGNMENT - 1);
    fragment_count * HEADER_LENGTH + align_down(total_length + slack, FRAME_ALIGNMENT)
}

/// Exact reservation for fragments of the given payload lengths.
pub fn exact_batch_length(lengths: &[usize]) -> usize {
    lengths.iter().map(|len| aligned_framed_length(*len)).sum()
}

pub fn is_batch_begin(flags: u8) -> bool {
    flags & FLAG_BATCH_BEGIN != 0
}

pub fn is_batch_end(flags: u8) -> bool {
    flags & FLAG_BATCH_END != 0
}

pub fn is_failed(flags: u8) -> bool {
    flags & FLAG_FAILED != 0
}

fn read_4(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}

#[cfg(test)]
mod tests {
    use super::{
        FLAG_BATCH_BEGIN, FLAG_FAILED, FRAME_ALIGNMENT, FrameHeader, FrameType, HEADER_LENGTH,
        align, aligned_framed_length, batch_length, exact_batch_length, is_batch_begin, is_batch_end, is_failed,
    };
    use crate::core::error::ErrorKind;

    #[test]
    fn alignment_is_16_bytes() {
        assert_eq!(align(0, FRAME_ALIGNMENT), 0);
        assert_eq!(align(1, FRAME_ALIGNMENT), 16);
        assert_eq!(align(16, FRAME_ALIGNMENT), 16);
        assert_eq!(align(17, FRAME_ALIGNMENT), 32);
    }

    #[test]
    fn sixteen_byte_message_frames_to_32() {
        assert_eq!(aligned_framed_length(16), 32);
        assert_eq!(aligned_framed_length(0), HEADER_LENGTH);
        assert_eq!(aligned_framed_length(17), 48);
    }

    #[test]
    fn header_round_trip() {
        let mut header = FrameHeader::message(16, 7);
        header.flags = FLAG_BATCH_BEGIN | FLAG_FAILED;
        let buf = header.encode();
        let decoded = FrameHeader::decode(&buf).expect("decode");
        assert_eq!(header, decoded);
        assert_eq!(decoded.payload_len(), 16);
        assert_eq!(decoded.frame_len(), 32);
    }

    #[test]
    fn unknown_frame_type_is_corrupt() {
        let mut buf = FrameHeader::padding(32).encode();
        buf[super::TYPE_OFFSET] = 9;
        let err = FrameHeader::decode(&buf).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn header_rejects_short_length() {
        let mut header = FrameHeader::padding(32);
        header.length = 8;
        let err = header.validate(1024).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert_eq!(FrameHeader::padding(32).frame_type, FrameType::Padding);
    }

    #[test]
    fn batch_length_covers_every_split() {
        for split in [
            vec![16usize, 16, 16],
            vec![10, 10, 10],
            vec![1, 1, 46],
            vec![0, 0, 48],
            vec![33, 0, 15],
            vec![0, 0, 0],
        ] {
            let total: usize = split.iter().sum();
            let used = exact_batch_length(&split);
            let reserved = batch_length(split.len(), total);
            assert!(reserved >= used, "{split:?}: reserved {reserved} < used {used}");
            assert_eq!(reserved % FRAME_ALIGNMENT, 0);
        }
        // Three 10-byte fragments need 96 bytes; the bound leaves one 16-byte pad.
        assert_eq!(exact_batch_length(&[10, 10, 10]), 96);
        assert_eq!(batch_length(3, 30), 112);
    }

    #[test]
    fn single_fragment_batch_length_is_exact() {
        for len in [0usize, 1, 15, 16, 20, 64] {
            assert_eq!(batch_length(1, len), aligned_framed_length(len), "len {len}");
        }
        assert_eq!(exact_batch_length(&[16, 16, 16]), 3 * aligned_framed_length(16));
    }

    #[test]
    fn flag_helpers() {
        assert!(is_batch_begin(FLAG_BATCH_BEGIN));
        assert!(!is_batch_end(FLAG_BATCH_BEGIN));
        assert!(is_failed(FLAG_FAILED));
    }
}

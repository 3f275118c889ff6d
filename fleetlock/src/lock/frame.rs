/*
Each record on disk is this header followed by `len` bytes of CBOR. The header is written by hand
so its size is fixed and known before the body is touched; a torn write can then be told apart from
a damaged one by comparing `len` against what is left in the file.
 */
#[derive(Debug, Eq, PartialEq)]
pub struct FrameHeader {
  pub len: u32,
  pub crc: u32,
}
// Serialization is big endian
impl FrameHeader {
  pub const SIZE: usize = 8;

  pub fn for_body(body: &[u8]) -> FrameHeader {
    FrameHeader {
      len: body.len() as u32,
      crc: crc32fast::hash(body),
    }
  }

  pub fn put(&self, buf: &mut [u8; Self::SIZE]) {
    buf[0] = (self.len >> 24) as u8;
    buf[1] = (self.len >> 16) as u8;
    buf[2] = (self.len >> 8) as u8;
    buf[3] = self.len as u8;
    buf[4] = (self.crc >> 24) as u8;
    buf[5] = (self.crc >> 16) as u8;
    buf[6] = (self.crc >> 8) as u8;
    buf[7] = self.crc as u8;
  }

  pub fn matches(&self, body: &[u8]) -> bool {
    body.len() == self.len as usize && crc32fast::hash(body) == self.crc
  }
}
impl From<&[u8; FrameHeader::SIZE]> for FrameHeader {
  fn from(buf: &[u8; FrameHeader::SIZE]) -> Self {
    let mut ret = FrameHeader { len: 0, crc: 0 };
    ret.len |= (buf[0] as u32) << 24;
    ret.len |= (buf[1] as u32) << 16;
    ret.len |= (buf[2] as u32) << 8;
    ret.len |= buf[3] as u32;
    ret.crc |= (buf[4] as u32) << 24;
    ret.crc |= (buf[5] as u32) << 16;
    ret.crc |= (buf[6] as u32) << 8;
    ret.crc |= buf[7] as u32;
    ret
  }
}

/// Encodes `body` as one complete frame.
pub fn frame(body: &[u8]) -> Vec<u8> {
  let mut header = [0u8; FrameHeader::SIZE];
  FrameHeader::for_body(body).put(&mut header);
  let mut out = Vec::with_capacity(FrameHeader::SIZE + body.len());
  out.extend_from_slice(&header);
  out.extend_from_slice(body);
  out
}

#[test]
fn test_frame_header_serde() {
  let header = FrameHeader {
    len: 0x8b5d7015,
    crc: 0x0f0e0d0c,
  };
  let mut buf = [0u8; FrameHeader::SIZE];
  header.put(&mut buf);
  assert_eq!(buf, [0x8b, 0x5d, 0x70, 0x15, 0x0f, 0x0e, 0x0d, 0x0c]);
  assert_eq!(header, FrameHeader::from(&buf));
}

#[test]
fn test_frame_checksum() {
  let framed = frame(b"hello");
  let mut header = [0u8; FrameHeader::SIZE];
  header.copy_from_slice(&framed[..FrameHeader::SIZE]);
  let header = FrameHeader::from(&header);
  assert!(header.matches(b"hello"));
  assert!(!header.matches(b"hellp"));
  assert!(!header.matches(b"hell"));
}

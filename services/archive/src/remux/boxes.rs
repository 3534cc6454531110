use std::io::{self, Read, Seek, SeekFrom, Write};
use thiserror::Error;

/// Maximum box payload read into memory (64 MB).
pub const MAX_BOX_PAYLOAD: u64 = 64 * 1024 * 1024;

pub const FTYP: [u8; 4] = *b"ftyp";
pub const MOOV: [u8; 4] = *b"moov";
pub const MOOF: [u8; 4] = *b"moof";
pub const TRAK: [u8; 4] = *b"trak";
pub const TKHD: [u8; 4] = *b"tkhd";
pub const MDIA: [u8; 4] = *b"mdia";
pub const MDHD: [u8; 4] = *b"mdhd";
pub const MVEX: [u8; 4] = *b"mvex";
pub const TREX: [u8; 4] = *b"trex";
pub const MFHD: [u8; 4] = *b"mfhd";
pub const TRAF: [u8; 4] = *b"traf";
pub const TFHD: [u8; 4] = *b"tfhd";
pub const TFDT: [u8; 4] = *b"tfdt";
pub const TRUN: [u8; 4] = *b"trun";

#[derive(Debug, Error)]
pub enum BoxError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("truncated box at offset {offset}: {message}")]
    Truncated { offset: u64, message: String },

    #[error("box '{box_type}' payload of {size} bytes exceeds {max}", max = MAX_BOX_PAYLOAD)]
    TooLarge { box_type: String, size: u64 },

    #[error("invalid '{box_type}' box: {message}")]
    Invalid { box_type: String, message: String },
}

impl BoxError {
    pub fn invalid(box_type: [u8; 4], message: impl Into<String>) -> Self {
        Self::Invalid {
            box_type: type_name(box_type),
            message: message.into(),
        }
    }
}

pub type BoxResult<T> = std::result::Result<T, BoxError>;

/// Header of one box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub box_type: [u8; 4],
    /// Total size including the header, with `size == 0` already resolved.
    pub size: u64,
    /// 8, or 16 when a 64-bit size follows the type.
    pub header_len: u8,
}

impl BoxHeader {
    pub fn payload_len(&self) -> u64 {
        self.size - self.header_len as u64
    }

    pub fn type_name(&self) -> String {
        type_name(self.box_type)
    }

    /// Encode the header, switching to the 64-bit form when the size needs it.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<u64> {
        let payload = self.payload_len();
        if self.header_len == 16 || payload + 8 > u32::MAX as u64 {
            writer.write_all(&1u32.to_be_bytes())?;
            writer.write_all(&self.box_type)?;
            writer.write_all(&(payload + 16).to_be_bytes())?;
            Ok(16)
        } else {
            writer.write_all(&((payload + 8) as u32).to_be_bytes())?;
            writer.write_all(&self.box_type)?;
            Ok(8)
        }
    }
}

pub fn type_name(box_type: [u8; 4]) -> String {
    String::from_utf8_lossy(&box_type).into_owned()
}

/// Cursor over the top-level boxes of a seekable stream.
pub struct BoxReader<R> {
    reader: R,
    next_offset: u64,
    end: u64,
}

impl<R: Read + Seek> BoxReader<R> {
    pub fn new(mut reader: R) -> BoxResult<Self> {
        let end = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;
        Ok(Self {
            reader,
            next_offset: 0,
            end,
        })
    }

    /// Header of the next box; the stream is left at its payload.
    pub fn next_box(&mut self) -> BoxResult<Option<BoxHeader>> {
        if self.next_offset >= self.end {
            return Ok(None);
        }

        let offset = self.next_offset;
        let remaining = self.end - offset;
        if remaining < 8 {
            return Err(BoxError::Truncated {
                offset,
                message: format!("{remaining} trailing bytes"),
            });
        }

        self.reader.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; 8];
        self.reader.read_exact(&mut header)?;
        let size32 = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as u64;
        let box_type = [header[4], header[5], header[6], header[7]];

        let (size, header_len) = match size32 {
            1 => {
                if remaining < 16 {
                    return Err(BoxError::Truncated {
                        offset,
                        message: "missing 64-bit size".to_string(),
                    });
                }
                let mut large = [0u8; 8];
                self.reader.read_exact(&mut large)?;
                (u64::from_be_bytes(large), 16u8)
            }
            // Extends to end of stream
            0 => (remaining, 8u8),
            n => (n, 8u8),
        };

        if size < header_len as u64 {
            return Err(BoxError::Truncated {
                offset,
                message: format!("'{}' size {size} smaller than its header", type_name(box_type)),
            });
        }
        if size > remaining {
            return Err(BoxError::Truncated {
                offset,
                message: format!(
                    "'{}' declares {size} bytes, {remaining} available",
                    type_name(box_type)
                ),
            });
        }

        self.next_offset = offset + size;
        Ok(Some(BoxHeader {
            box_type,
            size,
            header_len,
        }))
    }

    /// Read the payload of the box just returned by [`next_box`](Self::next_box).
    pub fn read_payload(&mut self, header: &BoxHeader) -> BoxResult<Vec<u8>> {
        let len = header.payload_len();
        if len > MAX_BOX_PAYLOAD {
            return Err(BoxError::TooLarge {
                box_type: header.type_name(),
                size: len,
            });
        }
        let mut payload = vec![0u8; len as usize];
        self.reader.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Stream the current box, header included, into `writer` unchanged.
    pub fn copy_box<W: Write>(&mut self, header: &BoxHeader, writer: &mut W) -> BoxResult<u64> {
        let written = header.write_to(writer)?;
        let payload = header.payload_len();
        let copied = io::copy(&mut (&mut self.reader).take(payload), writer)?;
        if copied != payload {
            return Err(BoxError::Truncated {
                offset: self.next_offset - header.size,
                message: format!("'{}' payload ended after {copied} bytes", header.type_name()),
            });
        }
        Ok(written + copied)
    }
}

/// A child box located inside an in-memory payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildBox {
    pub box_type: [u8; 4],
    /// Offset of the child's payload within the parent payload.
    pub payload_start: usize,
    /// Offset one past the child's last byte.
    pub end: usize,
}

impl ChildBox {
    pub fn payload<'a>(&self, parent: &'a [u8]) -> &'a [u8] {
        &parent[self.payload_start..self.end]
    }
}

/// Children of an in-memory container payload.
pub fn children(payload: &[u8]) -> BoxResult<Vec<ChildBox>> {
    let mut boxes = Vec::new();
    let mut pos = 0usize;

    while pos < payload.len() {
        let remaining = payload.len() - pos;
        if remaining < 8 {
            return Err(BoxError::Truncated {
                offset: pos as u64,
                message: format!("{remaining} trailing bytes in container"),
            });
        }
        let size32 = read_u32(payload, pos) as u64;
        let box_type = [payload[pos + 4], payload[pos + 5], payload[pos + 6], payload[pos + 7]];
        let (size, header_len) = match size32 {
            1 => {
                if remaining < 16 {
                    return Err(BoxError::Truncated {
                        offset: pos as u64,
                        message: "missing 64-bit size".to_string(),
                    });
                }
                (read_u64(payload, pos + 8), 16u64)
            }
            0 => (remaining as u64, 8),
            n => (n, 8),
        };
        if size < header_len || size > remaining as u64 {
            return Err(BoxError::Truncated {
                offset: pos as u64,
                message: format!("child '{}' has bad size {size}", type_name(box_type)),
            });
        }

        boxes.push(ChildBox {
            box_type,
            payload_start: pos + header_len as usize,
            end: pos + size as usize,
        });
        pos += size as usize;
    }

    Ok(boxes)
}

pub fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

pub fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(bytes)
}

// KTX2 container parsing
//
// Grounded on the source's `ktx2.h`/`img_ktx2.c`: this crate doesn't decode
// pixel data (that's the image collaborator's job per `spec.md` §14), it
// only needs to validate the identifier, read the fixed header/index, and
// hand back zero-copy level slices so `ImageUploadQueue` can stage them.
// Supercompression is rejected outright, matching the source comment that
// ref_vk consumes the container "directly and natively".
//
// Austin Shafer - 2024
use crate::error::{CoreError, Result};

pub const KTX2_IDENTIFIER: [u8; 12] = [
    0xAB, b'K', b'T', b'X', b' ', b'2', b'0', 0xBB, 0x0D, 0x0A, 0x1A, 0x0A,
];

const HEADER_SIZE: usize = 9 * 4; // 9 u32 fields
const INDEX_SIZE: usize = 4 * 4 + 2 * 8; // 4 u32 + 2 u64 fields
const LEVEL_RECORD_SIZE: usize = 3 * 8; // 3 u64 fields
pub const KTX2_MINIMAL_HEADER_SIZE: usize =
    KTX2_IDENTIFIER.len() + HEADER_SIZE + INDEX_SIZE + LEVEL_RECORD_SIZE;

/// Raw fixed header, immediately following the 12-byte identifier.
#[derive(Debug, Clone, Copy)]
pub struct Ktx2Header {
    pub vk_format: u32,
    pub type_size: u32,
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub pixel_depth: u32,
    pub layer_count: u32,
    pub face_count: u32,
    pub level_count: u32,
    pub supercompression_scheme: u32,
}

/// Offsets/lengths of the three index-referenced sections. This core
/// doesn't read any of them (no data format descriptor / key-value data /
/// supercompression global data parsing in scope), but keeps the fields
/// around for completeness and so offsets further in the file still make
/// sense to a caller inspecting the container by hand.
#[derive(Debug, Clone, Copy)]
pub struct Ktx2Index {
    pub dfd_byte_offset: u32,
    pub dfd_byte_length: u32,
    pub kvd_byte_offset: u32,
    pub kvd_byte_length: u32,
    pub sgd_byte_offset: u64,
    pub sgd_byte_length: u64,
}

/// One entry of the level index: where in the file this mip's bytes live.
#[derive(Debug, Clone, Copy)]
pub struct Ktx2Level {
    pub byte_offset: u64,
    pub byte_length: u64,
    pub uncompressed_byte_length: u64,
}

/// A parsed KTX2 container. Holds a reference to the caller's byte slice;
/// `level_data` slices into it rather than copying.
pub struct Ktx2File<'a> {
    pub header: Ktx2Header,
    pub index: Ktx2Index,
    pub levels: Vec<Ktx2Level>,
    data: &'a [u8],
}

impl<'a> Ktx2File<'a> {
    /// Zero-copy view of a single mip level's compressed (or raw, since
    /// supercompression is rejected at parse time) bytes.
    pub fn level_data(&self, level: usize) -> Result<&'a [u8]> {
        let l = self
            .levels
            .get(level)
            .ok_or(CoreError::InvalidKtx2("level index out of range"))?;
        let start = l.byte_offset as usize;
        let end = start + l.byte_length as usize;
        self.data
            .get(start..end)
            .ok_or(CoreError::InvalidKtx2("level record points past end of file"))
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

/// Parse a KTX2 container's identifier, fixed header, index, and level
/// array. `bytes` must outlive the returned `Ktx2File`.
pub fn parse(bytes: &[u8]) -> Result<Ktx2File<'_>> {
    if bytes.len() < KTX2_MINIMAL_HEADER_SIZE {
        return Err(CoreError::InvalidKtx2("file smaller than minimal header size"));
    }
    if bytes[..KTX2_IDENTIFIER.len()] != KTX2_IDENTIFIER {
        return Err(CoreError::InvalidKtx2("bad identifier bytes"));
    }

    let mut off = KTX2_IDENTIFIER.len();
    let header = Ktx2Header {
        vk_format: read_u32(bytes, off),
        type_size: read_u32(bytes, off + 4),
        pixel_width: read_u32(bytes, off + 8),
        pixel_height: read_u32(bytes, off + 12),
        pixel_depth: read_u32(bytes, off + 16),
        layer_count: read_u32(bytes, off + 20),
        face_count: read_u32(bytes, off + 24),
        level_count: read_u32(bytes, off + 28),
        supercompression_scheme: read_u32(bytes, off + 32),
    };
    off += HEADER_SIZE;

    if header.supercompression_scheme != 0 {
        return Err(CoreError::InvalidKtx2("supercompression is not supported"));
    }
    if header.level_count == 0 {
        return Err(CoreError::InvalidKtx2("level count must be at least 1"));
    }

    let index = Ktx2Index {
        dfd_byte_offset: read_u32(bytes, off),
        dfd_byte_length: read_u32(bytes, off + 4),
        kvd_byte_offset: read_u32(bytes, off + 8),
        kvd_byte_length: read_u32(bytes, off + 12),
        sgd_byte_offset: read_u64(bytes, off + 16),
        sgd_byte_length: read_u64(bytes, off + 24),
    };
    off += INDEX_SIZE;

    let level_count = header.level_count as usize;
    let levels_end = off + level_count * LEVEL_RECORD_SIZE;
    if bytes.len() < levels_end {
        return Err(CoreError::InvalidKtx2("file truncated before end of level index"));
    }

    let mut levels = Vec::with_capacity(level_count);
    for i in 0..level_count {
        let lo = off + i * LEVEL_RECORD_SIZE;
        let level = Ktx2Level {
            byte_offset: read_u64(bytes, lo),
            byte_length: read_u64(bytes, lo + 8),
            uncompressed_byte_length: read_u64(bytes, lo + 16),
        };
        if (level.byte_offset as usize) + (level.byte_length as usize) > bytes.len() {
            return Err(CoreError::InvalidKtx2("level record points past end of file"));
        }
        levels.push(level);
    }

    Ok(Ktx2File {
        header,
        index,
        levels,
        data: bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_minimal(level_count: u32, supercompression: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&KTX2_IDENTIFIER);
        buf.extend_from_slice(&37u32.to_le_bytes()); // vkFormat
        buf.extend_from_slice(&4u32.to_le_bytes()); // typeSize
        buf.extend_from_slice(&64u32.to_le_bytes()); // pixelWidth
        buf.extend_from_slice(&64u32.to_le_bytes()); // pixelHeight
        buf.extend_from_slice(&0u32.to_le_bytes()); // pixelDepth
        buf.extend_from_slice(&1u32.to_le_bytes()); // layerCount
        buf.extend_from_slice(&1u32.to_le_bytes()); // faceCount
        buf.extend_from_slice(&level_count.to_le_bytes());
        buf.extend_from_slice(&supercompression.to_le_bytes());
        // index: all zero, unused
        buf.extend_from_slice(&[0u8; INDEX_SIZE]);
        // one level record pointing at trailing payload bytes
        let level_offset = buf.len() as u64 + LEVEL_RECORD_SIZE as u64 * level_count as u64;
        let payload = vec![0xAAu8; 16];
        for _ in 0..level_count {
            buf.extend_from_slice(&level_offset.to_le_bytes());
            buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
            buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        }
        buf.extend_from_slice(&payload);
        buf
    }

    #[test]
    fn parses_minimal_container() {
        let bytes = build_minimal(1, 0);
        let file = parse(&bytes).unwrap();
        assert_eq!(file.header.pixel_width, 64);
        assert_eq!(file.header.pixel_height, 64);
        assert_eq!(file.levels.len(), 1);
        assert_eq!(file.level_data(0).unwrap(), &[0xAAu8; 16][..]);
    }

    #[test]
    fn rejects_bad_identifier() {
        let mut bytes = build_minimal(1, 0);
        bytes[0] = 0x00;
        assert!(matches!(parse(&bytes), Err(CoreError::InvalidKtx2(_))));
    }

    #[test]
    fn rejects_supercompression() {
        let bytes = build_minimal(1, 1);
        assert!(matches!(parse(&bytes), Err(CoreError::InvalidKtx2(_))));
    }

    #[test]
    fn rejects_truncated_file() {
        let bytes = build_minimal(1, 0);
        let truncated = &bytes[..bytes.len() - 20];
        assert!(matches!(parse(truncated), Err(CoreError::InvalidKtx2(_))));
    }

    #[test]
    fn rejects_out_of_range_level() {
        let bytes = build_minimal(1, 0);
        let file = parse(&bytes).unwrap();
        assert!(matches!(
            file.level_data(5),
            Err(CoreError::InvalidKtx2(_))
        ));
    }

    // spec scenario 6: a 4x4 R8G8B8A8_UNORM image with one level of 64
    // bytes parses to the declared dimensions and hands back that exact
    // byte range unmodified; feeding it to an upload queue is image.rs's
    // job, not this module's.
    #[test]
    fn scenario_6_ktx2_parse_4x4_rgba8_64_byte_level() {
        const VK_FORMAT_R8G8B8A8_UNORM: u32 = 37;
        let mut buf = Vec::new();
        buf.extend_from_slice(&KTX2_IDENTIFIER);
        buf.extend_from_slice(&VK_FORMAT_R8G8B8A8_UNORM.to_le_bytes());
        buf.extend_from_slice(&4u32.to_le_bytes()); // typeSize
        buf.extend_from_slice(&4u32.to_le_bytes()); // pixelWidth
        buf.extend_from_slice(&4u32.to_le_bytes()); // pixelHeight
        buf.extend_from_slice(&0u32.to_le_bytes()); // pixelDepth
        buf.extend_from_slice(&1u32.to_le_bytes()); // layerCount
        buf.extend_from_slice(&1u32.to_le_bytes()); // faceCount
        buf.extend_from_slice(&1u32.to_le_bytes()); // levelCount
        buf.extend_from_slice(&0u32.to_le_bytes()); // supercompressionScheme
        buf.extend_from_slice(&[0u8; INDEX_SIZE]);
        let payload = vec![0x7Fu8; 64];
        let level_offset = buf.len() as u64 + LEVEL_RECORD_SIZE as u64;
        buf.extend_from_slice(&level_offset.to_le_bytes());
        buf.extend_from_slice(&64u64.to_le_bytes());
        buf.extend_from_slice(&64u64.to_le_bytes());
        buf.extend_from_slice(&payload);

        let file = parse(&buf).unwrap();
        assert_eq!(file.header.vk_format, VK_FORMAT_R8G8B8A8_UNORM);
        assert_eq!(file.header.pixel_width, 4);
        assert_eq!(file.header.pixel_height, 4);
        assert_eq!(file.levels.len(), 1);
        assert_eq!(file.levels[0].byte_length, 64);
        assert_eq!(file.levels[0].byte_offset, level_offset);
        assert_eq!(file.level_data(0).unwrap(), &payload[..]);
    }
}

//! Storage backend abstraction for the store engine.
//!
//! The backend trait abstracts the underlying storage mechanism,
//! allowing both file-based (production) and in-memory (testing) implementations.
//! Backends know nothing about chunks beyond their size: the database reads whole
//! chunks and writes arbitrary byte ranges produced by the
//! [`ChunkWriter`](crate::chunk::ChunkWriter).
//!
//! # File layout
//!
//! ```text
//! Offset   Size   Contents
//! ------   ----   --------
//! 0        128    Fixed header (see DatabaseHeader)
//! 128      4088   Malloc table: free-list head per 8-byte size delta
//! 8192     ...    Data area, a sequence of whole-chunk blocks
//! ```

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::InMemoryBackend;

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    chunk::CHUNK_SIZE,
    error::{Error, Result},
    types::Address,
};

/// Magic number for nd-store database files.
pub const MAGIC: &[u8; 8] = b"NDSTORE\0";

/// Size of the fixed header fields at the start of chunk 0.
pub const HEADER_SIZE: usize = 128;

/// Number of root pointer slots in the header.
pub const ROOT_SLOT_COUNT: usize = 8;

/// Offset of the version field.
pub const VERSION_OFFSET: u64 = 8;
/// Offset of the chunk size field.
pub const CHUNK_SIZE_OFFSET: u64 = 12;
/// Offset of the chunk count field.
pub const CHUNK_COUNT_OFFSET: u64 = 16;
/// Offset of the pointer to the root of the free large-block trie.
pub const FREE_TREE_ROOT_OFFSET: u64 = 24;
/// Offset of the field recording where the malloc table starts.
pub const MALLOC_TABLE_BASE_OFFSET: u64 = 32;
/// Offset of the field recording where the data area starts.
pub const DATA_AREA_BASE_OFFSET: u64 = 40;
/// Offset of the header checksum.
pub const CHECKSUM_OFFSET: u64 = 48;
/// Offset of the first root slot.
pub const ROOT_SLOTS_OFFSET: u64 = 64;

/// Start of the malloc table.
pub const MALLOC_TABLE_OFFSET: u64 = HEADER_SIZE as u64;
/// Number of chunks occupied by the header and malloc table.
pub const HEADER_CHUNKS: u64 = 2;
/// Start of the data area.
pub const DATA_AREA_OFFSET: u64 = HEADER_CHUNKS * CHUNK_SIZE as u64;

/// Storage backend trait for abstracting file I/O.
pub trait StorageBackend: Send + Sync {
    /// Reads `buf.len()` bytes at `offset`. Bytes past the end of the file read as zero.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the read fails.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `data` at `offset`, extending the file if needed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the write fails, including `ErrorKind::Interrupted`
    /// when the write was cut short and nothing may be assumed about its effect.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Flushes all writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the sync fails.
    fn sync(&self) -> Result<()>;

    /// Returns the current file size in bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the metadata query fails.
    fn file_size(&self) -> Result<u64>;

    /// Truncates or extends the file to `new_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file cannot be resized.
    fn set_len(&self, new_size: u64) -> Result<()>;

    /// Returns `true` if the backend refuses writes.
    fn is_read_only(&self) -> bool;

    /// Reads one whole chunk.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the read fails.
    fn read_chunk(&self, chunk: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        self.read_at(chunk * CHUNK_SIZE as u64, &mut buf)?;
        Ok(buf)
    }
}

impl<B: StorageBackend + ?Sized> StorageBackend for std::sync::Arc<B> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        (**self).write_at(offset, data)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }

    fn file_size(&self) -> Result<u64> {
        (**self).file_size()
    }

    fn set_len(&self, new_size: u64) -> Result<()> {
        (**self).set_len(new_size)
    }

    fn is_read_only(&self) -> bool {
        (**self).is_read_only()
    }
}

/// Decoded fixed header.
///
/// # Layout (128 bytes)
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       8     Magic "NDSTORE\0"
/// 8       4     Format version (caller-defined)
/// 12      4     Chunk size
/// 16      8     Chunk count
/// 24      8     Root of the free large-block trie
/// 32      8     Malloc table base
/// 40      8     Data area base
/// 48      8     XXH3-64 of bytes 0..48 and 56..128
/// 56      8     Reserved
/// 64      64    Root slots (8 x address)
/// ```
///
/// The header lives inside chunk 0 and is mutated in place by the allocator; the
/// checksum is refreshed on every flush and verified on open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseHeader {
    /// Format version.
    pub version: u32,
    /// Number of chunks in the address space, header chunks included.
    pub chunk_count: u64,
    /// Root of the free large-block trie.
    pub free_tree_root: Address,
    /// Root pointer slots.
    pub roots: [Address; ROOT_SLOT_COUNT],
}

impl DatabaseHeader {
    /// Creates the header of an empty database.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            chunk_count: HEADER_CHUNKS,
            free_tree_root: Address::NULL,
            roots: [Address::NULL; ROOT_SLOT_COUNT],
        }
    }

    /// Serializes the header, checksum included.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(MAGIC);
        LittleEndian::write_u32(&mut buf[8..12], self.version);
        LittleEndian::write_u32(&mut buf[12..16], CHUNK_SIZE as u32);
        LittleEndian::write_u64(&mut buf[16..24], self.chunk_count);
        LittleEndian::write_u64(&mut buf[24..32], self.free_tree_root.raw());
        LittleEndian::write_u64(&mut buf[32..40], MALLOC_TABLE_OFFSET);
        LittleEndian::write_u64(&mut buf[40..48], DATA_AREA_OFFSET);
        for (i, root) in self.roots.iter().enumerate() {
            let start = ROOT_SLOTS_OFFSET as usize + i * Address::SIZE;
            LittleEndian::write_u64(&mut buf[start..start + Address::SIZE], root.raw());
        }
        let checksum = Self::checksum_of(&buf);
        LittleEndian::write_u64(&mut buf[48..56], checksum);
        buf
    }

    /// Deserializes and validates a header.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if the buffer is too short or the layout fields
    /// disagree with this build.
    /// Returns `Error::InvalidMagic` if the magic number does not match.
    /// Returns `Error::HeaderChecksumMismatch` if the checksum does not verify.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::corrupted("Header too short"));
        }

        if &buf[0..8] != MAGIC {
            return Err(Error::InvalidMagic);
        }

        if LittleEndian::read_u64(&buf[48..56]) != Self::checksum_of(buf) {
            return Err(Error::HeaderChecksumMismatch);
        }

        let chunk_size = LittleEndian::read_u32(&buf[12..16]);
        if chunk_size as usize != CHUNK_SIZE {
            return Err(Error::corrupted(format!("Unexpected chunk size {chunk_size}")));
        }
        if LittleEndian::read_u64(&buf[32..40]) != MALLOC_TABLE_OFFSET
            || LittleEndian::read_u64(&buf[40..48]) != DATA_AREA_OFFSET
        {
            return Err(Error::corrupted("Unexpected malloc table or data area base"));
        }

        let chunk_count = LittleEndian::read_u64(&buf[16..24]);
        if chunk_count < HEADER_CHUNKS {
            return Err(Error::corrupted(format!("Chunk count {chunk_count} below header size")));
        }

        let mut roots = [Address::NULL; ROOT_SLOT_COUNT];
        for (i, root) in roots.iter_mut().enumerate() {
            let start = ROOT_SLOTS_OFFSET as usize + i * Address::SIZE;
            *root = Address::new(LittleEndian::read_u64(&buf[start..start + Address::SIZE]));
        }

        Ok(Self {
            version: LittleEndian::read_u32(&buf[8..12]),
            chunk_count,
            free_tree_root: Address::new(LittleEndian::read_u64(&buf[24..32])),
            roots,
        })
    }

    /// Computes the header checksum over everything but the checksum field itself.
    pub fn checksum_of(buf: &[u8]) -> u64 {
        let mut hashed = [0u8; HEADER_SIZE - 8];
        hashed[..48].copy_from_slice(&buf[..48]);
        hashed[48..].copy_from_slice(&buf[56..HEADER_SIZE]);
        xxhash_rust::xxh3::xxh3_64(&hashed)
    }

    /// Returns the address of a root slot.
    pub fn root_slot_address(slot: usize) -> Address {
        Address::new(ROOT_SLOTS_OFFSET + (slot * Address::SIZE) as u64)
    }
}

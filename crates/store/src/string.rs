//! Strings stored in the database.
//!
//! A string is addressed by its first block. Short strings fit one block; longer
//! ones are a chain of segments. The sign of the leading length tells them apart:
//!
//! ```text
//! Short:    [i32 len][utf-8 bytes]
//! Long:     [i32 -len][u64 next segment][utf-8 bytes]
//! Segment:  [u64 next segment][utf-8 bytes]
//! ```

use std::cmp::Ordering;

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    db::{Database, WriteLock},
    error::{Error, Result},
    malloc::MAX_SMALL_PAYLOAD,
    types::{Address, POOL_STRING_LONG, POOL_STRING_SHORT},
};

const LENGTH_SIZE: usize = 4;
const NEXT_SIZE: usize = Address::SIZE;

/// Longest string, in UTF-8 bytes, stored in a single block.
pub const MAX_SHORT_STRING: usize = MAX_SMALL_PAYLOAD - LENGTH_SIZE;
const LONG_HEAD_CAPACITY: usize = MAX_SMALL_PAYLOAD - LENGTH_SIZE - NEXT_SIZE;
const SEGMENT_CAPACITY: usize = MAX_SMALL_PAYLOAD - NEXT_SIZE;

/// Stores `text` and returns the address of its first block.
///
/// # Errors
///
/// Returns [`Error::AllocationTooLarge`] for strings longer than `i32::MAX` bytes,
/// or any allocator error.
pub fn store(w: &mut WriteLock<'_>, text: &str) -> Result<Address> {
    let bytes = text.as_bytes();
    let len = i32::try_from(bytes.len()).map_err(|_| Error::AllocationTooLarge { size: bytes.len() })?;

    if bytes.len() <= MAX_SHORT_STRING {
        let address = w.malloc(LENGTH_SIZE + bytes.len(), POOL_STRING_SHORT)?;
        w.put_i32(address, len)?;
        w.put_bytes(address.add(LENGTH_SIZE as u64), bytes)?;
        return Ok(address);
    }

    let (head_bytes, mut rest) = bytes.split_at(LONG_HEAD_CAPACITY);
    let head = w.malloc(MAX_SMALL_PAYLOAD, POOL_STRING_LONG)?;
    w.put_i32(head, -len)?;
    w.put_bytes(head.add((LENGTH_SIZE + NEXT_SIZE) as u64), head_bytes)?;

    let mut link = head.add(LENGTH_SIZE as u64);
    while !rest.is_empty() {
        let take = rest.len().min(SEGMENT_CAPACITY);
        let segment = w.malloc(NEXT_SIZE + take, POOL_STRING_LONG)?;
        w.put_bytes(segment.add(NEXT_SIZE as u64), &rest[..take])?;
        w.put_address(link, segment)?;
        link = segment;
        rest = &rest[take..];
    }
    Ok(head)
}

/// Returns the string's length in UTF-8 bytes.
///
/// # Errors
///
/// Returns an error if the string header cannot be read.
pub fn byte_len(db: &Database, address: Address) -> Result<usize> {
    let tag = db.get_i32(address)?;
    Ok(tag.unsigned_abs() as usize)
}

/// Reads the string at `address`.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] if the chain is truncated or the bytes are not
/// UTF-8, or any read error.
pub fn load(db: &Database, address: Address) -> Result<String> {
    let tag = db.get_i32(address)?;
    let len = tag.unsigned_abs() as usize;

    let bytes = if tag >= 0 {
        if len > MAX_SHORT_STRING {
            return Err(Error::corrupted(format!(
                "Short string {address} claims {len} bytes"
            )));
        }
        let mut bytes = vec![0u8; len];
        db.get_bytes(address.add(LENGTH_SIZE as u64), &mut bytes)?;
        bytes
    } else {
        let mut bytes = Vec::with_capacity(len);
        let mut next = db.get_address(address.add(LENGTH_SIZE as u64))?;
        let mut part = vec![0u8; len.min(LONG_HEAD_CAPACITY)];
        db.get_bytes(address.add((LENGTH_SIZE + NEXT_SIZE) as u64), &mut part)?;
        bytes.extend_from_slice(&part);

        while bytes.len() < len {
            if next.is_null() {
                return Err(Error::corrupted(format!(
                    "Long string {address} ends after {} of {len} bytes",
                    bytes.len()
                )));
            }
            let mut part = vec![0u8; (len - bytes.len()).min(SEGMENT_CAPACITY)];
            db.get_bytes(next.add(NEXT_SIZE as u64), &mut part)?;
            bytes.extend_from_slice(&part);
            next = db.get_address(next)?;
        }
        bytes
    };

    String::from_utf8(bytes)
        .map_err(|_| Error::corrupted(format!("String {address} is not valid UTF-8")))
}

/// Frees every block of the string at `address`. Null is a no-op.
///
/// # Errors
///
/// Returns an error if the chain cannot be read or a block cannot be freed.
pub fn free(w: &mut WriteLock<'_>, address: Address) -> Result<()> {
    if address.is_null() {
        return Ok(());
    }
    let tag = w.get_i32(address)?;
    if tag >= 0 {
        return w.free(address, POOL_STRING_SHORT);
    }

    let len = tag.unsigned_abs() as usize;
    let mut next = w.get_address(address.add(LENGTH_SIZE as u64))?;
    w.free(address, POOL_STRING_LONG)?;

    let mut remaining = len.saturating_sub(LONG_HEAD_CAPACITY);
    while remaining > 0 && !next.is_null() {
        let segment = next;
        next = w.get_address(segment)?;
        w.free(segment, POOL_STRING_LONG)?;
        remaining = remaining.saturating_sub(SEGMENT_CAPACITY);
    }
    Ok(())
}

/// Search order: case-insensitive first, then case-sensitive to break ties.
pub fn compare_search_order(a: &str, b: &str) -> Ordering {
    compare_ignore_case(a, b).then_with(|| a.cmp(b))
}

/// Compares two strings by their lowercase forms.
pub fn compare_ignore_case(a: &str, b: &str) -> Ordering {
    a.chars().flat_map(char::to_lowercase).cmp(b.chars().flat_map(char::to_lowercase))
}

/// Compares `candidate` against `target` ignoring case, looking only at the first
/// `target.chars().count()` lowercase characters of the candidate when `prefix` is set.
pub fn compare_for_search(candidate: &str, target: &str, prefix: bool) -> Ordering {
    let lowered = candidate.chars().flat_map(char::to_lowercase);
    let target_lowered = target.chars().flat_map(char::to_lowercase);
    if prefix {
        let limit = target.chars().flat_map(char::to_lowercase).count();
        lowered.take(limit).cmp(target_lowered)
    } else {
        lowered.cmp(target_lowered)
    }
}

/// Compares two stored strings in search order.
///
/// # Errors
///
/// Returns an error if either string cannot be read.
pub fn compare(db: &Database, a: Address, b: Address) -> Result<Ordering> {
    Ok(compare_search_order(&load(db, a)?, &load(db, b)?))
}

/// Decodes a short-string block image; used by fuzzing and diagnostics.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] if the image is truncated, names a long string or
/// is not UTF-8.
pub fn decode_short(block: &[u8]) -> Result<String> {
    if block.len() < LENGTH_SIZE {
        return Err(Error::corrupted("String block shorter than its length field"));
    }
    let tag = LittleEndian::read_i32(block);
    if tag < 0 {
        return Err(Error::corrupted("Long string where a short one was expected"));
    }
    let len = tag as usize;
    let bytes = block
        .get(LENGTH_SIZE..LENGTH_SIZE + len)
        .ok_or_else(|| Error::corrupted(format!("String block too small for {len} bytes")))?;
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::corrupted("String is not valid UTF-8"))
}

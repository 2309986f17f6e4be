use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{PageId, PAGE_SIZE};

const RECORD_COUNT_OFFSET: usize = 0;
const RECORDS_OFFSET: usize = 4;
const NAME_SIZE: usize = 32;
const RECORD_SIZE: usize = NAME_SIZE + 4;

/// Directory of `(index name, root page id)` records stored inside page 0.
///
/// Every root change of a named B+Tree updates its record here, so an index
/// can be reopened by name. Operates directly on the latched page bytes.
pub struct HeaderPage;

impl HeaderPage {
    pub const MAX_RECORDS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE;

    pub fn record_count(data: &[u8]) -> usize {
        LittleEndian::read_u32(&data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4]) as usize
    }

    /// Add a `(name, root_page_id)` record. Fails on duplicate names, names
    /// longer than the fixed slot, or a full directory.
    pub fn insert_record(data: &mut [u8], name: &str, root_page_id: PageId) -> bool {
        if name.len() > NAME_SIZE || name.is_empty() {
            return false;
        }
        if Self::find_record(data, name).is_some() {
            return false;
        }
        let count = Self::record_count(data);
        if count >= Self::MAX_RECORDS {
            return false;
        }

        let offset = RECORDS_OFFSET + count * RECORD_SIZE;
        data[offset..offset + NAME_SIZE].fill(0);
        data[offset..offset + name.len()].copy_from_slice(name.as_bytes());
        LittleEndian::write_i32(&mut data[offset + NAME_SIZE..offset + RECORD_SIZE], root_page_id);
        LittleEndian::write_u32(
            &mut data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4],
            (count + 1) as u32,
        );
        true
    }

    /// Overwrite the root page id of an existing record.
    pub fn update_record(data: &mut [u8], name: &str, root_page_id: PageId) -> bool {
        match Self::find_record(data, name) {
            Some(index) => {
                let offset = RECORDS_OFFSET + index * RECORD_SIZE;
                LittleEndian::write_i32(
                    &mut data[offset + NAME_SIZE..offset + RECORD_SIZE],
                    root_page_id,
                );
                true
            }
            None => false,
        }
    }

    /// Look up the root page id registered under `name`.
    pub fn get_record(data: &[u8], name: &str) -> Option<PageId> {
        let index = Self::find_record(data, name)?;
        let offset = RECORDS_OFFSET + index * RECORD_SIZE;
        Some(LittleEndian::read_i32(
            &data[offset + NAME_SIZE..offset + RECORD_SIZE],
        ))
    }

    fn find_record(data: &[u8], name: &str) -> Option<usize> {
        if name.len() > NAME_SIZE {
            return None;
        }
        let count = Self::record_count(data);
        (0..count.min(Self::MAX_RECORDS)).find(|&i| {
            let offset = RECORDS_OFFSET + i * RECORD_SIZE;
            let stored = &data[offset..offset + NAME_SIZE];
            stored[..name.len()] == *name.as_bytes() && stored[name.len()..].iter().all(|&b| b == 0)
        })
    }
}

//! In-memory SPIFFS images and the filesystem merge
//!
//! SPIFFS is the log-structured filesystem the device keeps at a fixed
//! flash offset. The geometry here is part of the binary contract with
//! the on-device build and must not be changed: 256 byte logical pages,
//! 4 KiB logical and physical blocks, 32 byte object names, no
//! filesystem magic.
//!
//! Each block starts with one lookup page holding a `u16` object id per
//! remaining page (`0xffff` free, `0x0000` deleted, bit 15 marks index
//! pages). Every other page carries a 5 byte header (object id, span
//! index, inverted flag bits). A file consists of data pages plus an
//! index: the span-0 index page holds the file size, type and name
//! followed by data page numbers; further index pages hold page numbers
//! only. Flag bits are asserted by *clearing* them, matching NOR flash
//! semantics.

use miette::Diagnostic;
use thiserror::Error;

const LOG_PAGE_SIZE: usize = 256;
const LOG_BLOCK_SIZE: usize = 4096;
const PAGES_PER_BLOCK: usize = LOG_BLOCK_SIZE / LOG_PAGE_SIZE;
/// Lookup entries for one block fit in a single page.
const LOOKUP_PAGES_PER_BLOCK: usize = 1;
const OBJ_NAME_LEN: usize = 32;

const PAGE_HEADER_SIZE: usize = 5;
/// Page header, 3 alignment bytes, u32 size, u8 type, name.
const IX_HEADER_SIZE: usize = PAGE_HEADER_SIZE + 3 + 4 + 1 + OBJ_NAME_LEN;
/// Data page numbers held by the span-0 index page.
const OBJ_HDR_IX_LEN: usize = (LOG_PAGE_SIZE - IX_HEADER_SIZE) / 2;
/// Data page numbers held by each further index page.
const OBJ_IX_LEN: usize = (LOG_PAGE_SIZE - (PAGE_HEADER_SIZE + 3)) / 2;
/// File bytes held by one data page.
const DATA_PER_PAGE: usize = LOG_PAGE_SIZE - PAGE_HEADER_SIZE;

const OBJ_ID_FREE: u16 = 0xffff;
const OBJ_ID_DELETED: u16 = 0x0000;
const OBJ_ID_IX_FLAG: u16 = 0x8000;

const TYPE_FILE: u8 = 1;

/// A file whose index was written but never finalized carries this size.
const UNDEFINED_LEN: u32 = 0xffff_ffff;

// Flag bits; a flag is asserted when its bit is cleared.
const FLAG_USED: u8 = 1 << 0;
const FLAG_FINAL: u8 = 1 << 1;
const FLAG_INDEX: u8 = 1 << 2;
const FLAG_IXDELE: u8 = 1 << 6;
const FLAG_DELET: u8 = 1 << 7;

const DATA_PAGE_FLAGS: u8 = 0xff & !(FLAG_USED | FLAG_FINAL);
const INDEX_PAGE_FLAGS: u8 = 0xff & !(FLAG_USED | FLAG_FINAL | FLAG_INDEX);

#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum SpiffsError {
    #[error("image size {0} is not a positive multiple of the block size")]
    ImageSize(usize),

    #[error("filesystem images differ in size ({device} vs {update})")]
    SizeMismatch { device: usize, update: usize },

    #[error("lookup entry and page header disagree at page {0}")]
    BadLookup(usize),

    #[error("broken index chain for object {0:#06x}")]
    BadIndex(u16),

    #[error("file '{0}' not found")]
    NotFound(String),

    #[error("file name '{0}' too long")]
    NameTooLong(String),

    #[error("no free pages left in the filesystem image")]
    Full,
}

#[derive(Debug, Clone)]
struct FileEntry {
    obj_id: u16,
    header_page: usize,
    size: usize,
    name: String,
}

/// A mounted, mutable SPIFFS image.
pub struct SpiffsImage {
    data: Vec<u8>,
}

impl SpiffsImage {
    /// Mount an image, verifying that lookup pages and page headers tell
    /// the same story.
    pub fn mount(data: &[u8]) -> Result<Self, SpiffsError> {
        if data.is_empty() || data.len() % LOG_BLOCK_SIZE != 0 {
            return Err(SpiffsError::ImageSize(data.len()));
        }
        let image = SpiffsImage {
            data: data.to_vec(),
        };
        image.check_consistency()?;
        Ok(image)
    }

    /// A freshly erased image of `size` bytes containing no files.
    pub fn create(size: usize) -> Result<Self, SpiffsError> {
        if size == 0 || size % LOG_BLOCK_SIZE != 0 {
            return Err(SpiffsError::ImageSize(size));
        }
        Ok(SpiffsImage {
            data: vec![0xff; size],
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Names of all live files.
    pub fn list(&self) -> Vec<String> {
        self.files().into_iter().map(|f| f.name).collect()
    }

    /// Read the contents of the named file.
    pub fn read(&self, name: &str) -> Result<Vec<u8>, SpiffsError> {
        let file = self
            .find(name)
            .ok_or_else(|| SpiffsError::NotFound(name.to_string()))?;
        let (data_pages, _) = self.object_layout(&file)?;

        let mut out = Vec::with_capacity(file.size);
        for pix in data_pages {
            let take = DATA_PER_PAGE.min(file.size - out.len());
            out.extend_from_slice(&self.page(pix)[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + take]);
        }
        Ok(out)
    }

    /// Create or overwrite the named file.
    pub fn write(&mut self, name: &str, content: &[u8]) -> Result<(), SpiffsError> {
        if name.len() >= OBJ_NAME_LEN {
            return Err(SpiffsError::NameTooLong(name.to_string()));
        }
        match self.delete(name) {
            Ok(()) | Err(SpiffsError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let obj_id = self.allocate_obj_id()?;
        let n_data = (content.len() + DATA_PER_PAGE - 1) / DATA_PER_PAGE;
        let n_extra_ix = if n_data > OBJ_HDR_IX_LEN {
            (n_data - OBJ_HDR_IX_LEN + OBJ_IX_LEN - 1) / OBJ_IX_LEN
        } else {
            0
        };

        let free = self.free_pages(n_data + 1 + n_extra_ix)?;
        let data_pages = &free[..n_data];
        let header_page = free[n_data];
        let extra_ix_pages = &free[n_data + 1..];

        // Data pages first, the way the log is normally appended.
        for (span, (&pix, chunk)) in data_pages
            .iter()
            .zip(content.chunks(DATA_PER_PAGE))
            .enumerate()
        {
            self.write_page_header(pix, obj_id, span as u16, DATA_PAGE_FLAGS);
            let off = pix * LOG_PAGE_SIZE + PAGE_HEADER_SIZE;
            self.data[off..off + chunk.len()].copy_from_slice(chunk);
            self.set_lookup_entry(pix, obj_id);
        }

        // Span-0 index page: header plus the first run of page numbers.
        self.write_page_header(header_page, obj_id | OBJ_ID_IX_FLAG, 0, INDEX_PAGE_FLAGS);
        let base = header_page * LOG_PAGE_SIZE;
        self.data[base + 8..base + 12].copy_from_slice(&(content.len() as u32).to_le_bytes());
        self.data[base + 12] = TYPE_FILE;
        for b in &mut self.data[base + 13..base + 13 + OBJ_NAME_LEN] {
            *b = 0;
        }
        self.data[base + 13..base + 13 + name.len()].copy_from_slice(name.as_bytes());
        for (k, &pix) in data_pages.iter().take(OBJ_HDR_IX_LEN).enumerate() {
            let off = base + IX_HEADER_SIZE + 2 * k;
            self.data[off..off + 2].copy_from_slice(&(pix as u16).to_le_bytes());
        }
        self.set_lookup_entry(header_page, obj_id | OBJ_ID_IX_FLAG);

        // Remaining page numbers spill into plain index pages.
        let mut written = OBJ_HDR_IX_LEN.min(n_data);
        for (i, &ix_pix) in extra_ix_pages.iter().enumerate() {
            self.write_page_header(
                ix_pix,
                obj_id | OBJ_ID_IX_FLAG,
                (i + 1) as u16,
                INDEX_PAGE_FLAGS,
            );
            let base = ix_pix * LOG_PAGE_SIZE + PAGE_HEADER_SIZE + 3;
            for (k, &pix) in data_pages[written..]
                .iter()
                .take(OBJ_IX_LEN)
                .enumerate()
            {
                let off = base + 2 * k;
                self.data[off..off + 2].copy_from_slice(&(pix as u16).to_le_bytes());
            }
            written = (written + OBJ_IX_LEN).min(n_data);
            self.set_lookup_entry(ix_pix, obj_id | OBJ_ID_IX_FLAG);
        }

        Ok(())
    }

    /// Delete the named file, releasing its pages.
    pub fn delete(&mut self, name: &str) -> Result<(), SpiffsError> {
        let file = self
            .find(name)
            .ok_or_else(|| SpiffsError::NotFound(name.to_string()))?;
        let (data_pages, index_pages) = self.object_layout(&file)?;

        for pix in data_pages {
            self.mark_deleted(pix, false);
        }
        for pix in index_pages {
            self.mark_deleted(pix, true);
        }
        self.mark_deleted(file.header_page, true);
        Ok(())
    }

    fn total_pages(&self) -> usize {
        self.data.len() / LOG_PAGE_SIZE
    }

    fn is_lookup_page(pix: usize) -> bool {
        pix % PAGES_PER_BLOCK < LOOKUP_PAGES_PER_BLOCK
    }

    fn page(&self, pix: usize) -> &[u8] {
        &self.data[pix * LOG_PAGE_SIZE..(pix + 1) * LOG_PAGE_SIZE]
    }

    fn lookup_entry(&self, pix: usize) -> u16 {
        let block_start = (pix / PAGES_PER_BLOCK) * LOG_BLOCK_SIZE;
        let off = block_start + 2 * (pix % PAGES_PER_BLOCK - LOOKUP_PAGES_PER_BLOCK);
        u16::from_le_bytes([self.data[off], self.data[off + 1]])
    }

    fn set_lookup_entry(&mut self, pix: usize, value: u16) {
        let block_start = (pix / PAGES_PER_BLOCK) * LOG_BLOCK_SIZE;
        let off = block_start + 2 * (pix % PAGES_PER_BLOCK - LOOKUP_PAGES_PER_BLOCK);
        self.data[off..off + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// (object id, span index, flags) from a page header.
    fn page_header(&self, pix: usize) -> (u16, u16, u8) {
        let p = self.page(pix);
        (
            u16::from_le_bytes([p[0], p[1]]),
            u16::from_le_bytes([p[2], p[3]]),
            p[4],
        )
    }

    fn write_page_header(&mut self, pix: usize, obj_id: u16, span: u16, flags: u8) {
        let off = pix * LOG_PAGE_SIZE;
        self.data[off..off + 2].copy_from_slice(&obj_id.to_le_bytes());
        self.data[off + 2..off + 4].copy_from_slice(&span.to_le_bytes());
        self.data[off + 4] = flags;
    }

    fn mark_deleted(&mut self, pix: usize, index: bool) {
        self.set_lookup_entry(pix, OBJ_ID_DELETED);
        let off = pix * LOG_PAGE_SIZE + 4;
        self.data[off] &= !FLAG_DELET;
        if index {
            self.data[off] &= !FLAG_IXDELE;
        }
    }

    fn check_consistency(&self) -> Result<(), SpiffsError> {
        for pix in 0..self.total_pages() {
            if Self::is_lookup_page(pix) {
                continue;
            }
            let entry = self.lookup_entry(pix);
            if entry == OBJ_ID_FREE || entry == OBJ_ID_DELETED {
                continue;
            }
            let (obj_id, _, flags) = self.page_header(pix);
            if obj_id != entry || flags & FLAG_USED != 0 {
                return Err(SpiffsError::BadLookup(pix));
            }
        }
        Ok(())
    }

    fn files(&self) -> Vec<FileEntry> {
        let mut files = Vec::new();
        for pix in 0..self.total_pages() {
            if Self::is_lookup_page(pix) {
                continue;
            }
            let entry = self.lookup_entry(pix);
            if entry == OBJ_ID_FREE
                || entry == OBJ_ID_DELETED
                || entry & OBJ_ID_IX_FLAG == 0
            {
                continue;
            }
            let (_, span, flags) = self.page_header(pix);
            let live = span == 0
                && flags & (FLAG_USED | FLAG_FINAL | FLAG_INDEX) == 0
                && flags & FLAG_DELET != 0;
            if !live {
                continue;
            }

            let page = self.page(pix);
            if page[12] != TYPE_FILE {
                continue;
            }
            let size = u32::from_le_bytes(page[8..12].try_into().unwrap());
            if size == UNDEFINED_LEN {
                continue;
            }
            let name_bytes = &page[13..13 + OBJ_NAME_LEN];
            let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(OBJ_NAME_LEN);
            let name = String::from_utf8_lossy(&name_bytes[..name_len]).into_owned();

            files.push(FileEntry {
                obj_id: entry & !OBJ_ID_IX_FLAG,
                header_page: pix,
                size: size as usize,
                name,
            });
        }
        files
    }

    fn find(&self, name: &str) -> Option<FileEntry> {
        self.files().into_iter().find(|f| f.name == name)
    }

    /// Resolve a file's data pages (span order) and its extra index pages.
    fn object_layout(
        &self,
        file: &FileEntry,
    ) -> Result<(Vec<usize>, Vec<usize>), SpiffsError> {
        let n_data = (file.size + DATA_PER_PAGE - 1) / DATA_PER_PAGE;
        let mut data_pages = Vec::with_capacity(n_data);
        let mut index_pages = Vec::new();

        let header = self.page(file.header_page);
        for k in 0..n_data.min(OBJ_HDR_IX_LEN) {
            let off = IX_HEADER_SIZE + 2 * k;
            data_pages.push(u16::from_le_bytes([header[off], header[off + 1]]) as usize);
        }

        let mut span = 1u16;
        while data_pages.len() < n_data {
            let ix_pix = self
                .find_index_page(file.obj_id, span)
                .ok_or(SpiffsError::BadIndex(file.obj_id))?;
            let page = self.page(ix_pix);
            for k in 0..(n_data - data_pages.len()).min(OBJ_IX_LEN) {
                let off = PAGE_HEADER_SIZE + 3 + 2 * k;
                data_pages.push(u16::from_le_bytes([page[off], page[off + 1]]) as usize);
            }
            index_pages.push(ix_pix);
            span += 1;
        }

        for &pix in &data_pages {
            if pix >= self.total_pages()
                || Self::is_lookup_page(pix)
                || self.lookup_entry(pix) != file.obj_id
            {
                return Err(SpiffsError::BadIndex(file.obj_id));
            }
        }

        Ok((data_pages, index_pages))
    }

    fn find_index_page(&self, obj_id: u16, span: u16) -> Option<usize> {
        (0..self.total_pages()).find(|&pix| {
            !Self::is_lookup_page(pix)
                && self.lookup_entry(pix) == obj_id | OBJ_ID_IX_FLAG
                && self.page_header(pix).1 == span
        })
    }

    fn allocate_obj_id(&self) -> Result<u16, SpiffsError> {
        let mut used: Vec<u16> = (0..self.total_pages())
            .filter(|&pix| !Self::is_lookup_page(pix))
            .map(|pix| self.lookup_entry(pix) & !OBJ_ID_IX_FLAG)
            .collect();
        used.sort_unstable();
        used.dedup();

        (1..OBJ_ID_IX_FLAG - 1)
            .find(|id| used.binary_search(id).is_err())
            .ok_or(SpiffsError::Full)
    }

    fn free_pages(&self, count: usize) -> Result<Vec<usize>, SpiffsError> {
        let free: Vec<usize> = (0..self.total_pages())
            .filter(|&pix| {
                !Self::is_lookup_page(pix) && self.lookup_entry(pix) == OBJ_ID_FREE
            })
            .take(count)
            .collect();
        if free.len() < count {
            return Err(SpiffsError::Full);
        }
        Ok(free)
    }
}

/// Merge a firmware update's filesystem into the one read back from the
/// device.
///
/// Every file shipped in `update` overwrites its device counterpart;
/// files only present on the device are preserved. Returns the bytes to
/// flash back.
pub fn merge_filesystems(device: &[u8], update: &[u8]) -> Result<Vec<u8>, SpiffsError> {
    if device.len() != update.len() {
        return Err(SpiffsError::SizeMismatch {
            device: device.len(),
            update: update.len(),
        });
    }

    let mut merged = SpiffsImage::mount(device)?;
    let update = SpiffsImage::mount(update)?;

    for name in update.list() {
        let content = update.read(&name)?;
        merged.write(&name, &content)?;
    }

    Ok(merged.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const IMAGE_SIZE: usize = 64 * 1024;

    fn image_with(files: &[(&str, &[u8])]) -> SpiffsImage {
        let mut fs = SpiffsImage::create(IMAGE_SIZE).unwrap();
        for (name, content) in files {
            fs.write(name, content).unwrap();
        }
        fs
    }

    #[test]
    fn blank_image_has_no_files() {
        let fs = SpiffsImage::create(IMAGE_SIZE).unwrap();
        assert!(fs.list().is_empty());
    }

    #[test]
    fn write_read_round_trip() {
        let content: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let fs = image_with(&[("conf0.json", &content)]);

        assert_eq!(fs.list(), vec!["conf0.json"]);
        assert_eq!(fs.read("conf0.json").unwrap(), content);
    }

    #[test]
    fn empty_file_round_trip() {
        let fs = image_with(&[("empty", b"")]);
        assert_eq!(fs.read("empty").unwrap(), b"");
    }

    #[test]
    fn large_file_spills_into_extra_index_pages() {
        // More data pages than the span-0 index page can hold.
        let content: Vec<u8> = (0..(OBJ_HDR_IX_LEN + 3) * DATA_PER_PAGE + 17)
            .map(|i| (i * 31 % 256) as u8)
            .collect();
        let fs = image_with(&[("big.bin", &content)]);

        assert_eq!(fs.read("big.bin").unwrap(), content);
    }

    #[test]
    fn overwrite_replaces_contents() {
        let mut fs = image_with(&[("app.js", b"old contents")]);
        fs.write("app.js", b"new").unwrap();

        assert_eq!(fs.list(), vec!["app.js"]);
        assert_eq!(fs.read("app.js").unwrap(), b"new");
    }

    #[test]
    fn deleted_pages_are_reusable() {
        let mut fs = SpiffsImage::create(IMAGE_SIZE).unwrap();
        let content = vec![0x5a; 40 * 1024];
        // Rewriting a file larger than half the image only works if the
        // old copy's pages are actually released.
        fs.write("blob", &content).unwrap();
        fs.write("blob", &content).unwrap();
        assert_eq!(fs.read("blob").unwrap(), content);
    }

    #[test]
    fn filling_up_reports_full() {
        let mut fs = SpiffsImage::create(LOG_BLOCK_SIZE).unwrap();
        let err = fs.write("toobig", &vec![0; 16 * 1024]).unwrap_err();
        assert!(matches!(err, SpiffsError::Full));
    }

    #[test]
    fn mount_rejects_garbage() {
        let garbage = vec![0xAB; IMAGE_SIZE];
        assert!(SpiffsImage::mount(&garbage).is_err());

        assert!(matches!(
            SpiffsImage::mount(&[0xff; 100]),
            Err(SpiffsError::ImageSize(100))
        ));
    }

    #[test]
    fn mount_round_trips_through_bytes() {
        let fs = image_with(&[("a", b"alpha"), ("b", b"beta")]);
        let remounted = SpiffsImage::mount(fs.as_bytes()).unwrap();

        let mut names = remounted.list();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(remounted.read("b").unwrap(), b"beta");
    }

    #[test]
    fn merge_preserves_device_files_and_takes_updates() {
        let device = image_with(&[("a", b"device a"), ("b", b"device b")]);
        let update = image_with(&[("b", b"update b"), ("c", b"update c")]);

        let merged = merge_filesystems(device.as_bytes(), update.as_bytes()).unwrap();
        let merged = SpiffsImage::mount(&merged).unwrap();

        let mut names = merged.list();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(merged.read("a").unwrap(), b"device a");
        assert_eq!(merged.read("b").unwrap(), b"update b");
        assert_eq!(merged.read("c").unwrap(), b"update c");
    }

    #[test]
    fn merge_rejects_size_mismatch() {
        let device = SpiffsImage::create(IMAGE_SIZE).unwrap();
        let update = SpiffsImage::create(IMAGE_SIZE / 2).unwrap();
        assert!(matches!(
            merge_filesystems(device.as_bytes(), update.as_bytes()),
            Err(SpiffsError::SizeMismatch { .. })
        ));
    }
}

//! Reading of AidAim SFS (Single File System) containers.
//!
//! An SFS container packages a virtual file tree inside one physical file.
//! The file opens with a 0x118-byte header; after it the container is a
//! sequence of fixed-size chunks, each carrying a 32-byte chunk header and
//! `chunk_size - 32` payload bytes. Files are scattered over chunks and
//! located through per-file pointer tables; the tables themselves may span
//! several chunks, threaded through the chunk headers.
//!
//! # Known Limitations
//!
//! Encrypted containers are not supported, and the only supported
//! compression is the zlib block scheme used by Bruker BCF files.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::read::ZlibDecoder;
use log::{debug, info, warn};

use crate::error::{Error, Result};

/// Container signature at offset 0.
pub const SFS_SIGNATURE: &[u8; 8] = b"AAMVHFSS";
/// `AACS` as a little-endian u32: per-file compression signature.
const AACS_SIGNATURE: u32 = 0x5343_4141;

/// Bytes before chunk 0.
const FILE_HEADER_SIZE: u64 = 0x118;
/// Bytes of header at the start of every chunk.
const CHUNK_HEADER_SIZE: u64 = 0x20;
/// Size of one record in the entry table.
const TREE_ITEM_SIZE: usize = 0x200;
/// First compressed block header of a zlib-compressed file.
const COMPRESSED_DATA_START: u64 = 0x80;

/// Microseconds between 1601-01-01 (Windows filetime epoch) and 1970-01-01.
const FILETIME_EPOCH_OFFSET_MICROS: i64 = 11_644_473_600_000_000;

/// Convert a Windows filetime (100 ns ticks since 1601-01-01 UTC) to a
/// wall-clock instant. Returns `None` for values outside the representable
/// range.
pub fn filetime_to_datetime(ticks: u64) -> Option<DateTime<Utc>> {
    let micros = ((ticks / 10) as i64).checked_sub(FILETIME_EPOCH_OFFSET_MICROS)?;
    DateTime::from_timestamp_micros(micros)
}

/// Convert a wall-clock instant back to a Windows filetime.
pub fn datetime_to_filetime(t: &DateTime<Utc>) -> u64 {
    ((t.timestamp_micros() + FILETIME_EPOCH_OFFSET_MICROS) * 10) as u64
}

/// Block-compression parameters of one file inside a compressed container.
#[derive(Debug, Clone, Copy)]
pub struct CompressionInfo {
    /// Size of each block once inflated.
    pub uncompressed_block_size: u32,
    /// Number of consecutively packed blocks.
    pub block_count: u32,
}

/// One node of the container's virtual file tree.
#[derive(Debug, Clone)]
pub struct SfsEntry {
    pub name: String,
    /// Payload size in bytes; 0 for directories.
    pub size: u64,
    pub is_dir: bool,
    /// Index of the parent entry in the table; -1 for children of the root.
    pub parent: i32,
    pub create_time: Option<DateTime<Utc>>,
    pub modify_time: Option<DateTime<Utc>>,
    pub secondary_time: Option<DateTime<Utc>>,
    /// Opaque permission bits, kept as stored.
    pub permissions: u32,
    /// Chunk index holding the first page of the pointer table.
    first_pointer_chunk: i32,
    /// Number of data chunks (`ceil(size / usable)`).
    size_in_chunks: usize,
    /// Absolute byte offsets of the payload region of each data chunk.
    pointers: Vec<u64>,
    /// Populated only when the container advertises zlib compression.
    compression: Option<CompressionInfo>,
}

impl SfsEntry {
    /// Parse one 0x200-byte record of the entry table. The pointer table is
    /// filled in later, once the container geometry is known.
    fn parse(raw: &[u8]) -> Result<SfsEntry> {
        let first_pointer_chunk = i32::from_le_bytes(raw[0..4].try_into().unwrap_or_default());
        let size = u64::from_le_bytes(raw[4..12].try_into().unwrap_or_default());
        let create = u64::from_le_bytes(raw[12..20].try_into().unwrap_or_default());
        let modify = u64::from_le_bytes(raw[20..28].try_into().unwrap_or_default());
        let secondary = u64::from_le_bytes(raw[28..36].try_into().unwrap_or_default());
        let permissions = u32::from_le_bytes(raw[36..40].try_into().unwrap_or_default());
        let parent = i32::from_le_bytes(raw[40..44].try_into().unwrap_or_default());
        // 176 reserved bytes, then the directory flag and 3 more reserved.
        let is_dir = raw[220] != 0;
        let name_raw = &raw[224..480];
        let name_end = name_raw.iter().position(|&b| b == 0).unwrap_or(name_raw.len());
        let name = String::from_utf8_lossy(&name_raw[..name_end]).into_owned();

        Ok(SfsEntry {
            name,
            size,
            is_dir,
            parent,
            create_time: filetime_to_datetime(create),
            modify_time: filetime_to_datetime(modify),
            secondary_time: filetime_to_datetime(secondary),
            permissions,
            first_pointer_chunk,
            size_in_chunks: 0,
            pointers: Vec::new(),
            compression: None,
        })
    }

    pub fn compression(&self) -> Option<&CompressionInfo> {
        self.compression.as_ref()
    }
}

/// A parsed SFS container. Immutable after construction; the entry tree and
/// pointer tables may be freely shared for reads.
pub struct SfsContainer {
    path: PathBuf,
    file: File,
    version: f32,
    chunk_size: u32,
    usable_chunk: u32,
    total_chunks: u32,
    entries: Vec<SfsEntry>,
    /// True when the first file opens with the `AACS` signature. The
    /// decision is container-global.
    compressed: bool,
}

impl SfsContainer {
    /// Open and parse the container at `path`: header, entry table, pointer
    /// tables and compression detection.
    pub fn open(path: impl AsRef<Path>) -> Result<SfsContainer> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;

        let mut signature = [0u8; 8];
        read_exact_at(&file, 0, &mut signature)?;
        if &signature != SFS_SIGNATURE {
            return Err(Error::NotSfsContainer(path));
        }

        let mut buf8 = [0u8; 8];
        read_exact_at(&file, 0x124, &mut buf8)?;
        let version = f32::from_le_bytes(buf8[0..4].try_into().unwrap_or_default());
        let chunk_size = u32::from_le_bytes(buf8[4..8].try_into().unwrap_or_default());
        if chunk_size as u64 <= CHUNK_HEADER_SIZE {
            return Err(Error::UnsupportedVersion(format!(
                "chunk size {chunk_size} is smaller than the chunk header"
            )));
        }
        if !(2.0..3.0).contains(&version) {
            warn!("unrecognised SFS version {version:.2}, attempting to read anyway");
        }
        let usable_chunk = chunk_size - CHUNK_HEADER_SIZE as u32;

        let mut buf12 = [0u8; 12];
        read_exact_at(&file, 0x140, &mut buf12)?;
        let tree_chunk = u32::from_le_bytes(buf12[0..4].try_into().unwrap_or_default());
        let n_tree_items = u32::from_le_bytes(buf12[4..8].try_into().unwrap_or_default());
        let total_chunks = u32::from_le_bytes(buf12[8..12].try_into().unwrap_or_default());
        debug!(
            "SFS v{version:.2}: chunk size {chunk_size}, {n_tree_items} tree items, \
             {total_chunks} chunks"
        );

        let mut container = SfsContainer {
            path,
            file,
            version,
            chunk_size,
            usable_chunk,
            total_chunks,
            entries: Vec::new(),
            compressed: false,
        };

        // The entry table fits in a single chunk.
        let mut raw_tree = vec![0u8; TREE_ITEM_SIZE * n_tree_items as usize];
        let tree_offset = container.chunk_payload_offset(tree_chunk as u64);
        read_exact_at(&container.file, tree_offset, &mut raw_tree)?;
        for record in raw_tree.chunks_exact(TREE_ITEM_SIZE) {
            container.entries.push(SfsEntry::parse(record)?);
        }

        for idx in 0..container.entries.len() {
            if !container.entries[idx].is_dir {
                container.fill_pointer_table(idx)?;
            }
        }

        container.detect_compression()?;
        info!(
            "opened SFS container '{}' ({} entries, compression: {})",
            container.path.display(),
            container.entries.len(),
            if container.compressed { "zlib" } else { "none" }
        );
        Ok(container)
    }

    /// Absolute byte offset of the payload region of chunk `k`.
    fn chunk_payload_offset(&self, k: u64) -> u64 {
        FILE_HEADER_SIZE + k * self.chunk_size as u64 + CHUNK_HEADER_SIZE
    }

    /// Absolute byte offset of the header of chunk `k`.
    fn chunk_header_offset(&self, k: u64) -> u64 {
        FILE_HEADER_SIZE + k * self.chunk_size as u64
    }

    /// Populate one file's pointer table. Tables larger than a chunk are
    /// threaded through the chunk headers: the first 4 header bytes of each
    /// table chunk give the index of the next one.
    fn fill_pointer_table(&mut self, idx: usize) -> Result<()> {
        let usable = self.usable_chunk as u64;
        let entry = &self.entries[idx];
        let size_in_chunks = entry.size.div_ceil(usable) as usize;
        let pointers_per_chunk = (usable / 4) as usize;
        let n_table_chunks = size_in_chunks.div_ceil(pointers_per_chunk).max(1);

        let mut table = vec![0u8; n_table_chunks * usable as usize];
        if n_table_chunks > 1 {
            let mut next_chunk = entry.first_pointer_chunk as u32;
            for page in 0..n_table_chunks {
                let mut link = [0u8; 4];
                read_exact_at(&self.file, self.chunk_header_offset(next_chunk as u64), &mut link)?;
                let body = &mut table[page * usable as usize..(page + 1) * usable as usize];
                read_exact_at(&self.file, self.chunk_payload_offset(next_chunk as u64), body)?;
                next_chunk = u32::from_le_bytes(link);
            }
        } else {
            let offset = self.chunk_payload_offset(entry.first_pointer_chunk as u64);
            read_exact_at(&self.file, offset, &mut table[..usable as usize])?;
        }

        let chunk_size = self.chunk_size as u64;
        let pointers = table[..size_in_chunks * 4]
            .chunks_exact(4)
            .map(|b| {
                let k = u32::from_le_bytes(b.try_into().unwrap_or_default()) as u64;
                FILE_HEADER_SIZE + k * chunk_size + CHUNK_HEADER_SIZE
            })
            .collect();

        let entry = &mut self.entries[idx];
        entry.size_in_chunks = size_in_chunks;
        entry.pointers = pointers;
        debug!(
            "entry '{}': {} bytes over {} chunks",
            entry.name, entry.size, entry.size_in_chunks
        );
        Ok(())
    }

    /// Read the first file's opening bytes to decide whether the container
    /// uses zlib block compression, then parse the per-file descriptors.
    fn detect_compression(&mut self) -> Result<()> {
        let probe = self
            .entries
            .iter()
            .find(|e| !e.is_dir && !e.pointers.is_empty())
            .map(|e| e.pointers[0]);
        let Some(offset) = probe else {
            return Ok(());
        };
        let mut sig = [0u8; 4];
        read_exact_at(&self.file, offset, &mut sig)?;
        self.compressed = u32::from_le_bytes(sig) == AACS_SIGNATURE;
        if !self.compressed {
            return Ok(());
        }

        for idx in 0..self.entries.len() {
            if self.entries[idx].is_dir || self.entries[idx].pointers.is_empty() {
                continue;
            }
            let mut head = [0u8; 16];
            read_exact_at(&self.file, self.entries[idx].pointers[0], &mut head)?;
            if u32::from_le_bytes(head[0..4].try_into().unwrap_or_default()) != AACS_SIGNATURE {
                return Err(Error::UnknownCompression);
            }
            self.entries[idx].compression = Some(CompressionInfo {
                uncompressed_block_size: u32::from_le_bytes(
                    head[4..8].try_into().unwrap_or_default(),
                ),
                block_count: u32::from_le_bytes(head[12..16].try_into().unwrap_or_default()),
            });
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version_string(&self) -> String {
        format!("{:.2}", self.version)
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn usable_chunk(&self) -> u32 {
        self.usable_chunk
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn entries(&self) -> &[SfsEntry] {
        &self.entries
    }

    /// Full path of an entry, reconstructed by walking `parent` indices.
    pub fn path_of(&self, idx: usize) -> String {
        let mut parts = vec![self.entries[idx].name.as_str()];
        let mut parent = self.entries[idx].parent;
        while parent >= 0 {
            let p = parent as usize;
            parts.push(self.entries[p].name.as_str());
            parent = self.entries[p].parent;
        }
        parts.reverse();
        parts.join("/")
    }

    /// Find the table index of the entry named `name` under `parent`
    /// (-1 = root). Duplicate names are not expected; if present, the last
    /// table record wins.
    fn child_index(&self, parent: i32, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .rev()
            .find(|(_, e)| e.parent == parent && e.name == name)
            .map(|(i, _)| i)
    }

    /// Look up a file entry by a `/`-separated path from the root.
    pub fn entry(&self, path: &str) -> Result<SfsFile<'_>> {
        let mut parent = -1i32;
        let mut idx = None;
        for component in path.split('/') {
            if let Some(i) = idx {
                // The previous component must have been a directory.
                let e: &SfsEntry = &self.entries[i];
                if !e.is_dir {
                    return Err(Error::NotFound(path.to_string()));
                }
            }
            let i = self
                .child_index(parent, component)
                .ok_or_else(|| Error::NotFound(path.to_string()))?;
            parent = i as i32;
            idx = Some(i);
        }
        let idx = idx.ok_or_else(|| Error::NotFound(path.to_string()))?;
        if self.entries[idx].is_dir {
            return Err(Error::NotAFile(path.to_string()));
        }
        Ok(SfsFile {
            sfs: self,
            entry: &self.entries[idx],
        })
    }

    /// All entries directly under the directory `path`.
    pub fn dir_entries(&self, path: &str) -> Result<Vec<&SfsEntry>> {
        let mut parent = -1i32;
        for component in path.split('/') {
            let i = self
                .child_index(parent, component)
                .ok_or_else(|| Error::NotFound(path.to_string()))?;
            parent = i as i32;
        }
        if !self.entries[parent as usize].is_dir {
            return Err(Error::NotFound(path.to_string()));
        }
        Ok(self.entries.iter().filter(|e| e.parent == parent).collect())
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        read_exact_at(&self.file, offset, buf)
    }
}

/// Positioned read on a shared read-only descriptor. An unexpected EOF is
/// reported as `Truncated` with the offending offset.
fn read_exact_at(mut file: &File, offset: u64, buf: &mut [u8]) -> Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Truncated { offset }
        } else {
            Error::Io(e)
        }
    })
}

/// Handle to one file inside the container: random-access raw reads and
/// sequential block iteration, hiding chunked storage and per-block
/// decompression.
#[derive(Clone, Copy)]
pub struct SfsFile<'a> {
    sfs: &'a SfsContainer,
    entry: &'a SfsEntry,
}

impl<'a> SfsFile<'a> {
    pub fn entry(&self) -> &'a SfsEntry {
        self.entry
    }

    /// Read `length` raw payload bytes logically starting at `offset`,
    /// ignoring any compression.
    pub fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        if offset + length > self.entry.size {
            return Err(Error::Truncated { offset });
        }
        let usable = self.sfs.usable_chunk as u64;
        let mut data = vec![0u8; length as usize];
        if length == 0 {
            return Ok(data);
        }

        let first = (offset / usable) as usize;
        let first_off = offset % usable;
        let last = ((offset + length) / usable) as usize;
        let last_cut = (offset + length) % usable;

        if first == last {
            self.sfs
                .read_exact_at(self.entry.pointers[first] + first_off, &mut data)?;
            return Ok(data);
        }

        let head = (usable - first_off) as usize;
        self.sfs
            .read_exact_at(self.entry.pointers[first] + first_off, &mut data[..head])?;
        let mut written = head;
        for i in first + 1..last {
            self.sfs.read_exact_at(
                self.entry.pointers[i],
                &mut data[written..written + usable as usize],
            )?;
            written += usable as usize;
        }
        if last_cut > 0 {
            self.sfs
                .read_exact_at(self.entry.pointers[last], &mut data[written..])?;
        }
        Ok(data)
    }

    /// Sequential uncompressed payload blocks along with their nominal size
    /// and count. One block is one chunk payload when the container is
    /// uncompressed, or one inflated zlib block otherwise.
    pub fn blocks(&self) -> Result<(BlockIter<'a>, u32, u32)> {
        match (self.sfs.compressed, self.entry.compression) {
            (true, Some(info)) => Ok((
                BlockIter::Zlib {
                    file: *self,
                    offset: COMPRESSED_DATA_START,
                    remaining: info.block_count,
                },
                info.uncompressed_block_size,
                info.block_count,
            )),
            (true, None) => Err(Error::UnknownCompression),
            (false, _) => Ok((
                BlockIter::Raw {
                    file: *self,
                    next: 0,
                },
                self.sfs.usable_chunk,
                self.entry.size_in_chunks as u32,
            )),
        }
    }

    /// Materialise the whole file through the block accessor.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let (blocks, block_size, count) = self.blocks()?;
        let mut data = Vec::with_capacity(block_size as usize * count as usize);
        for block in blocks {
            data.extend_from_slice(&block?);
        }
        Ok(data)
    }
}

/// Iterator of uncompressed payload blocks of one file.
pub enum BlockIter<'a> {
    Raw {
        file: SfsFile<'a>,
        next: usize,
    },
    Zlib {
        file: SfsFile<'a>,
        /// Logical offset of the next 16-byte block header.
        offset: u64,
        remaining: u32,
    },
}

impl Iterator for BlockIter<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            BlockIter::Raw { file, next } => {
                let entry = file.entry;
                if *next >= entry.size_in_chunks {
                    return None;
                }
                let usable = file.sfs.usable_chunk as u64;
                let mut len = usable;
                if *next == entry.size_in_chunks - 1 && entry.size % usable != 0 {
                    len = entry.size % usable;
                }
                let mut buf = vec![0u8; len as usize];
                let res = file.sfs.read_exact_at(entry.pointers[*next], &mut buf);
                *next += 1;
                match res {
                    Ok(()) => Some(Ok(buf)),
                    Err(e) => Some(Err(e)),
                }
            }
            BlockIter::Zlib {
                file,
                offset,
                remaining,
            } => {
                if *remaining == 0 {
                    return None;
                }
                *remaining -= 1;
                Some(Self::next_zlib_block(file, offset))
            }
        }
    }
}

impl BlockIter<'_> {
    fn next_zlib_block(file: &SfsFile<'_>, offset: &mut u64) -> Result<Vec<u8>> {
        // 16-byte block header; only the compressed size is meaningful.
        let head = file.read_range(*offset, 16)?;
        let cpr_size = u32::from_le_bytes(head[0..4].try_into().unwrap_or_default()) as u64;
        *offset += 16;
        let raw = file.read_range(*offset, cpr_size)?;
        *offset += cpr_size;
        let mut block = Vec::new();
        ZlibDecoder::new(raw.as_slice())
            .read_to_end(&mut block)
            .map_err(Error::Io)?;
        Ok(block)
    }
}

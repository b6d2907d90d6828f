//! Decoding of the binary spectral maps (`EDSDatabase/SpectrumData<i>`).
//!
//! A spectral map is a stream of per-pixel sparse histograms in a bespoke
//! variable-length encoding, decoded here in one sequential pass into a
//! dense `(rows, columns, channels)` array. Pixels come grouped by raster
//! line; each pixel picks one of three encodings: a plain u16 pulse list,
//! a packed 12-bit pulse list, or a run-encoded dense histogram with
//! optional trailing pulses. The decoder reads whole uncompressed blocks
//! from the container and splices them into a working buffer, so record
//! boundaries never have to align with storage boundaries.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;

use crate::error::{Error, Result};
use crate::header::{HyperHeader, Instrument};
use crate::sfs::{BlockIter, SfsContainer, SfsFile};

/// Offset of the first line record inside the decoded stream.
const PIXEL_DATA_START: usize = 0x1A0;
/// Bytes of one pixel header.
const PIXEL_HEADER_LEN: usize = 22;

/// Cooperative cancellation flag, checked by the decoder between blocks.
/// Cancelling never leaves a partial array observable.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Integer type selected for the output array.
///
/// Unsigned types are preferred; the signed ladder exists to keep in-place
/// accumulation safe in runtimes where unsigned wrap-around would mask
/// overflow. Decoded arrays are always returned in the same-width unsigned
/// type, since counts are never negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
}

impl Dtype {
    /// Pick the smallest width that cannot overflow a per-cell deposit of
    /// `roof` counts.
    pub fn from_roof(roof: u64, downsample: usize) -> Dtype {
        let aggregated = downsample > 1;
        if roof > 0xFF {
            if roof > 0xFFFF {
                if aggregated {
                    if roof > 0xEFFF_FFFF {
                        Dtype::I64
                    } else {
                        Dtype::I32
                    }
                } else {
                    Dtype::U32
                }
            } else if aggregated {
                if roof > 0xEFFF {
                    Dtype::I32
                } else {
                    Dtype::I16
                }
            } else {
                Dtype::U16
            }
        } else if aggregated {
            if roof > 0xEF {
                Dtype::I16
            } else {
                Dtype::I8
            }
        } else {
            Dtype::U8
        }
    }

    /// The same-width unsigned counterpart.
    pub fn unsigned(self) -> Dtype {
        match self {
            Dtype::I8 => Dtype::U8,
            Dtype::I16 => Dtype::U16,
            Dtype::I32 => Dtype::U32,
            Dtype::I64 => Dtype::U64,
            other => other,
        }
    }
}

/// Dense channel-count storage in the selected width.
#[derive(Debug, Clone, PartialEq)]
pub enum HypermapData {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
}

/// A decoded hypermap: row-major `(height, width, channels)` counts.
#[derive(Debug, Clone, PartialEq)]
pub struct Hypermap {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    /// Storage type of `data` (always unsigned).
    pub dtype: Dtype,
    pub data: HypermapData,
}

impl Hypermap {
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.height, self.width, self.channels)
    }

    pub fn get(&self, y: usize, x: usize, c: usize) -> u64 {
        let i = (y * self.width + x) * self.channels + c;
        match &self.data {
            HypermapData::U8(d) => d[i] as u64,
            HypermapData::U16(d) => d[i] as u64,
            HypermapData::U32(d) => d[i] as u64,
            HypermapData::U64(d) => d[i],
        }
    }

    /// Sum of every cell.
    pub fn total(&self) -> u64 {
        match &self.data {
            HypermapData::U8(d) => d.iter().map(|&v| v as u64).sum(),
            HypermapData::U16(d) => d.iter().map(|&v| v as u64).sum(),
            HypermapData::U32(d) => d.iter().map(|&v| v as u64).sum(),
            HypermapData::U64(d) => d.iter().sum(),
        }
    }
}

/// Accumulation cell of the output array, one impl per storage width.
/// Adds wrap like the reference arrays do; the width selection is expected
/// to make wrapping unreachable.
trait Cell: Copy + Default {
    fn add_count(self, v: u64) -> Self;
    fn into_data(cells: Vec<Self>) -> HypermapData;
}

impl Cell for u8 {
    fn add_count(self, v: u64) -> Self {
        self.wrapping_add(v as u8)
    }
    fn into_data(cells: Vec<Self>) -> HypermapData {
        HypermapData::U8(cells)
    }
}

impl Cell for u16 {
    fn add_count(self, v: u64) -> Self {
        self.wrapping_add(v as u16)
    }
    fn into_data(cells: Vec<Self>) -> HypermapData {
        HypermapData::U16(cells)
    }
}

impl Cell for u32 {
    fn add_count(self, v: u64) -> Self {
        self.wrapping_add(v as u32)
    }
    fn into_data(cells: Vec<Self>) -> HypermapData {
        HypermapData::U32(cells)
    }
}

impl Cell for u64 {
    fn add_count(self, v: u64) -> Self {
        self.wrapping_add(v)
    }
    fn into_data(cells: Vec<Self>) -> HypermapData {
        HypermapData::U64(cells)
    }
}

/// One decode of one spectral map. Construct per decode; the entry's block
/// iterator is consumed exactly once.
pub struct HypermapDecoder<'a> {
    sfs: &'a SfsContainer,
    header: &'a HyperHeader,
    index: usize,
    downsample: usize,
    cutoff_channels: Option<usize>,
    cancel: CancelToken,
}

impl<'a> HypermapDecoder<'a> {
    pub fn new(sfs: &'a SfsContainer, header: &'a HyperHeader, index: usize) -> Self {
        HypermapDecoder {
            sfs,
            header,
            index,
            downsample: 1,
            cutoff_channels: None,
            cancel: CancelToken::new(),
        }
    }

    /// Spatial downsampling factor; output cells aggregate `d x d` input
    /// pixels.
    pub fn downsample(mut self, d: usize) -> Self {
        self.downsample = d.max(1);
        self
    }

    /// Truncate the energy axis to at most this many channels.
    pub fn cutoff_channels(mut self, c: Option<usize>) -> Self {
        self.cutoff_channels = c;
        self
    }

    /// Truncate the energy axis at an energy in keV.
    pub fn cutoff_kev(self, kev: Option<f64>) -> Result<Self> {
        let channels = match kev {
            Some(kev) => {
                let spectrum = self.header.spectrum(self.index)?;
                Some(spectrum.energy_to_channel(kev).max(0) as usize)
            }
            None => None,
        };
        Ok(self.cutoff_channels(channels))
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    fn entry(&self) -> Result<SfsFile<'a>> {
        self.sfs
            .entry(&format!("EDSDatabase/SpectrumData{}", self.index))
    }

    /// Channel count of the output: the nominal capacity, the header
    /// estimate and the caller-supplied cutoff, whichever is smallest.
    fn channel_cutoff(&self) -> Result<usize> {
        let capacity = self.header.spectrum(self.index)?.counts.len();
        let estimated = self.header.estimate_channels(self.index)?;
        let mut cutoff = capacity.min(estimated);
        if let Some(user) = self.cutoff_channels {
            cutoff = cutoff.min(user);
        }
        Ok(cutoff)
    }

    fn ladder_dtype(&self) -> Result<Dtype> {
        let roof = self.header.depth_roof(self.index, self.downsample)?;
        Ok(Dtype::from_roof(roof, self.downsample))
    }

    /// Output shape and dtype without decoding: reads the raster dimensions
    /// from the head of the stream and sizes the rest from the header.
    pub fn shape_and_dtype(&self) -> Result<((usize, usize, usize), Dtype)> {
        let (mut blocks, _, _) = self.entry()?.blocks()?;
        let first = match blocks.next() {
            Some(block) => block?,
            None => {
                return Err(Error::BadHypermap {
                    offset: 0,
                    reason: "empty spectral map".to_string(),
                })
            }
        };
        let (height, width) = read_dimensions(&first)?;
        let d = self.downsample;
        let shape = (
            height.div_ceil(d),
            width.div_ceil(d),
            self.channel_cutoff()?,
        );
        Ok((shape, self.ladder_dtype()?))
    }

    /// Decode the whole map. The output is bit-identical across repeated
    /// decodes of the same input.
    pub fn decode(&self) -> Result<Hypermap> {
        let dtype = self.ladder_dtype()?;
        match dtype {
            Dtype::U8 | Dtype::I8 => self.decode_cells::<u8>(dtype),
            Dtype::U16 | Dtype::I16 => self.decode_cells::<u16>(dtype),
            Dtype::U32 | Dtype::I32 => self.decode_cells::<u32>(dtype),
            Dtype::U64 | Dtype::I64 => self.decode_cells::<u64>(dtype),
        }
    }

    fn decode_cells<T: Cell>(&self, dtype: Dtype) -> Result<Hypermap> {
        let (blocks, block_size, block_count) = self.entry()?.blocks()?;
        debug!(
            "decoding SpectrumData{}: {} blocks of {} bytes, downsample {}",
            self.index, block_count, block_size, self.downsample
        );
        let mut stream = PixelStream::new(blocks, self.cancel.clone());

        let head = stream.take(8)?.to_vec();
        let (height, width) = read_dimensions(&head)?;
        let cutoff = self.channel_cutoff()?;
        let d = self.downsample;
        let out_h = height.div_ceil(d);
        let out_w = width.div_ceil(d);
        let mut cells = vec![T::default(); out_h * out_w * cutoff];

        stream.skip(PIXEL_DATA_START - 8)?;
        let mut hist: Vec<u64> = Vec::new();
        for y in 0..height {
            let line_pixels = stream.read_i32()?;
            if line_pixels < 0 {
                return Err(stream.bad("negative line pixel count"));
            }
            for _ in 0..line_pixels {
                let px = PixelHeader::read(&mut stream)?;
                if px.chan_used > px.chan_capacity {
                    return Err(stream.bad(&format!(
                        "pixel uses {} channels of a {}-channel map",
                        px.chan_used, px.chan_capacity
                    )));
                }
                if (px.x as usize) >= width {
                    return Err(stream.bad(&format!(
                        "pixel column {} outside a {width}-pixel line",
                        px.x
                    )));
                }

                let capacity = px.chan_capacity as usize;
                hist.clear();
                match px.flag {
                    0 => {
                        let body = stream.take(px.body_size as usize)?;
                        bincount_pulses16(body, capacity, &mut hist);
                    }
                    1 => {
                        let at = stream.position();
                        let body = stream.take(px.body_size as usize)?;
                        unpack_pulses12(body, px.extra_pulses as usize, capacity, &mut hist)
                            .map_err(|reason| Error::BadHypermap { offset: at, reason })?;
                    }
                    _ => {
                        if px.body_size < 4 {
                            return Err(stream.bad("run-encoded pixel body shorter than 4 bytes"));
                        }
                        let at = stream.position();
                        stream.ensure(px.body_size as usize)?;
                        let body = stream.take(px.body_size as usize - 4)?;
                        unpack_runs(body, capacity, &mut hist)
                            .map_err(|reason| Error::BadHypermap { offset: at, reason })?;
                        if px.extra_pulses > 0 {
                            let additional_size = stream.read_u32()? as usize;
                            let at = stream.position();
                            let add = stream.take(additional_size)?;
                            apply_extra_pulses(add, px.extra_pulses as usize, &mut hist)
                                .map_err(|reason| Error::BadHypermap { offset: at, reason })?;
                        } else {
                            stream.skip(4)?;
                        }
                    }
                }

                // Cutoff is enforced at write time; histograms longer than
                // the output axis simply stop contributing there.
                let base = ((y / d) * out_w + (px.x as usize) / d) * cutoff;
                for (c, &v) in hist.iter().take(cutoff).enumerate() {
                    cells[base + c] = cells[base + c].add_count(v);
                }
            }
        }

        Ok(Hypermap {
            height: out_h,
            width: out_w,
            channels: cutoff,
            dtype: dtype.unsigned(),
            data: T::into_data(cells),
        })
    }

    /// Deferred variant: shape and dtype now, pixel decoding later.
    pub fn lazy(&self, instrument: Option<Instrument>) -> Result<LazyHypermap> {
        let (shape, dtype) = self.shape_and_dtype()?;
        Ok(LazyHypermap {
            shape,
            dtype,
            path: self.sfs.path().to_path_buf(),
            index: self.index,
            downsample: self.downsample,
            cutoff_channels: self.cutoff_channels,
            instrument,
        })
    }
}

/// A deferred decode with its shape and dtype declared in advance. The
/// container is reopened when the data is finally wanted.
#[derive(Debug, Clone)]
pub struct LazyHypermap {
    pub shape: (usize, usize, usize),
    /// Ladder dtype; the decoded array uses `dtype.unsigned()`.
    pub dtype: Dtype,
    path: PathBuf,
    index: usize,
    downsample: usize,
    cutoff_channels: Option<usize>,
    instrument: Option<Instrument>,
}

impl LazyHypermap {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn decode(&self) -> Result<Hypermap> {
        let sfs = SfsContainer::open(&self.path)?;
        let xml = sfs.entry("EDSDatabase/HeaderData")?.read_all()?;
        let header = HyperHeader::parse(&xml, &[self.index], self.instrument)?;
        HypermapDecoder::new(&sfs, &header, self.index)
            .downsample(self.downsample)
            .cutoff_channels(self.cutoff_channels)
            .decode()
    }
}

fn read_dimensions(block: &[u8]) -> Result<(usize, usize)> {
    if block.len() < 8 {
        return Err(Error::BadHypermap {
            offset: 0,
            reason: "spectral map shorter than its dimension header".to_string(),
        });
    }
    let height = i32::from_le_bytes(block[0..4].try_into().unwrap_or_default());
    let width = i32::from_le_bytes(block[4..8].try_into().unwrap_or_default());
    if height <= 0 || width <= 0 {
        return Err(Error::BadHypermap {
            offset: 0,
            reason: format!("impossible raster dimensions {height}x{width}"),
        });
    }
    Ok((height as usize, width as usize))
}

/// 22-byte header in front of every pixel record.
struct PixelHeader {
    x: u32,
    chan_capacity: u16,
    chan_used: u16,
    flag: u16,
    extra_pulses: u16,
    body_size: u32,
}

impl PixelHeader {
    fn read(stream: &mut PixelStream<'_>) -> Result<PixelHeader> {
        stream.ensure(PIXEL_HEADER_LEN)?;
        let x = stream.read_u32()?;
        let chan_capacity = stream.read_u16()?;
        let chan_used = stream.read_u16()?;
        stream.skip(4)?; // reserved
        let flag = stream.read_u16()?;
        stream.skip(2)?; // reserved size field
        let extra_pulses = stream.read_u16()?;
        let body_size = stream.read_u32()?;
        Ok(PixelHeader {
            x,
            chan_capacity,
            chan_used,
            flag,
            extra_pulses,
            body_size,
        })
    }
}

/// Working buffer over the container's block iterator. Whenever a read
/// would pass the end of the buffer, the unconsumed tail is spliced in
/// front of the next uncompressed block.
struct PixelStream<'a> {
    blocks: BlockIter<'a>,
    buf: Vec<u8>,
    offset: usize,
    /// Bytes consumed before the start of `buf`, for error reporting.
    drained: u64,
    cancel: CancelToken,
}

impl<'a> PixelStream<'a> {
    fn new(blocks: BlockIter<'a>, cancel: CancelToken) -> Self {
        PixelStream {
            blocks,
            buf: Vec::new(),
            offset: 0,
            drained: 0,
            cancel,
        }
    }

    /// Absolute offset of the next unread byte in the decoded stream.
    fn position(&self) -> u64 {
        self.drained + self.offset as u64
    }

    fn bad(&self, reason: &str) -> Error {
        Error::BadHypermap {
            offset: self.position(),
            reason: reason.to_string(),
        }
    }

    fn ensure(&mut self, n: usize) -> Result<()> {
        while self.offset + n > self.buf.len() {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let block = match self.blocks.next() {
                Some(block) => block?,
                None => return Err(self.bad("stream ends inside a record")),
            };
            self.drained += self.offset as u64;
            self.buf.drain(..self.offset);
            self.offset = 0;
            self.buf.extend_from_slice(&block);
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        self.ensure(n)?;
        let slice = &self.buf[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.ensure(n)?;
        self.offset += n;
        Ok(())
    }

    fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }
}

/// Plain pulse list: the body is u16 energies; the histogram is their
/// bincount. Pulses outside the nominal capacity do not count.
fn bincount_pulses16(body: &[u8], capacity: usize, hist: &mut Vec<u64>) {
    hist.resize(capacity, 0);
    for pair in body.chunks_exact(2) {
        let v = u16::from_le_bytes([pair[0], pair[1]]) as usize;
        if v < capacity {
            hist[v] += 1;
        }
    }
}

/// Packed 12-bit pulse list. The on-disk convention is preserved verbatim:
/// byte-swap each u16 word, double every byte, drop bytes 0 and 5 of every
/// 6 doubled bytes, read the compacted stream as big-endian u16,
/// right-shift even-indexed values by 4 and mask everything to 12 bits.
/// Every 6 body bytes expand to 8 compacted bytes, i.e. 4 pulses — dense
/// 12-bit packing.
fn unpack_pulses12(
    body: &[u8],
    n_pulses: usize,
    capacity: usize,
    hist: &mut Vec<u64>,
) -> std::result::Result<(), String> {
    let mut swapped = Vec::with_capacity(body.len());
    for pair in body.chunks_exact(2) {
        swapped.push(pair[1]);
        swapped.push(pair[0]);
    }
    let mut compact = Vec::with_capacity(body.len() * 4 / 3 + 4);
    for (i, b) in swapped.iter().flat_map(|&b| [b, b]).enumerate() {
        if i % 6 != 0 && i % 6 != 5 {
            compact.push(b);
        }
    }
    if compact.len() / 2 < n_pulses {
        return Err(format!(
            "12-bit body holds {} pulses, header promises {n_pulses}",
            compact.len() / 2
        ));
    }
    hist.resize(capacity, 0);
    for (i, pair) in compact.chunks_exact(2).take(n_pulses).enumerate() {
        let mut v = u16::from_be_bytes([pair[0], pair[1]]);
        if i % 2 == 0 {
            v >>= 4;
        }
        v &= 0x0FFF;
        if (v as usize) < capacity {
            hist[v as usize] += 1;
        }
    }
    Ok(())
}

/// Run-encoded dense histogram. Each run starts with a width (in nibbles)
/// and a length; non-zero runs carry a gain added to every emitted value.
/// The result is right-padded with zeros up to the nominal capacity.
fn unpack_runs(
    body: &[u8],
    capacity: usize,
    hist: &mut Vec<u64>,
) -> std::result::Result<(), String> {
    let mut off = 0usize;
    while off < body.len() {
        if off + 2 > body.len() {
            return Err("run header overruns the pixel body".to_string());
        }
        let nibble_width = body[off];
        let run_length = body[off + 1] as usize;
        off += 2;

        if nibble_width == 0 {
            hist.extend(std::iter::repeat(0).take(run_length));
            continue;
        }
        let byte_width = match nibble_width {
            1 | 2 => 1usize,
            4 => 2,
            8 => 4,
            16 => 8,
            other => return Err(format!("unknown run width of {other} nibbles")),
        };
        if off + byte_width > body.len() {
            return Err("run gain overruns the pixel body".to_string());
        }
        let gain = uint_le(&body[off..off + byte_width]);
        off += byte_width;

        if nibble_width == 1 {
            let len = run_length.div_ceil(2);
            if off + len > body.len() {
                return Err("nibble run overruns the pixel body".to_string());
            }
            let mut emitted = 0;
            for &b in &body[off..off + len] {
                hist.push((b & 0x0F) as u64 + gain);
                emitted += 1;
                if emitted < run_length {
                    hist.push((b >> 4) as u64 + gain);
                    emitted += 1;
                }
            }
            off += len;
        } else {
            let len = run_length * byte_width;
            if off + len > body.len() {
                return Err("run values overrun the pixel body".to_string());
            }
            for value in body[off..off + len].chunks_exact(byte_width) {
                hist.push(uint_le(value) + gain);
            }
            off += len;
        }
    }
    if hist.len() < capacity {
        hist.resize(capacity, 0);
    }
    Ok(())
}

/// Trailing pulses appended after a run-encoded body: u16 channel indices,
/// each bumping the histogram by one.
fn apply_extra_pulses(
    body: &[u8],
    n_pulses: usize,
    hist: &mut [u64],
) -> std::result::Result<(), String> {
    if body.len() < n_pulses * 2 {
        return Err(format!(
            "additional-pulse body holds {} bytes, {n_pulses} pulses promised",
            body.len()
        ));
    }
    for pair in body.chunks_exact(2).take(n_pulses) {
        let idx = u16::from_le_bytes([pair[0], pair[1]]) as usize;
        if idx >= hist.len() {
            return Err(format!("additional pulse at channel {idx} beyond capacity"));
        }
        hist[idx] += 1;
    }
    Ok(())
}

fn uint_le(bytes: &[u8]) -> u64 {
    let mut v = 0u64;
    for (i, &b) in bytes.iter().enumerate() {
        v |= (b as u64) << (8 * i);
    }
    v
}

//! Builders for synthetic SFS containers and acquisition headers, shared by
//! the test modules. Containers produced here are bit-faithful to the real
//! layout: 0x118-byte file header, 32-byte chunk headers, single-chunk entry
//! table, chained pointer-table pages and optional zlib block wrapping.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::sfs::datetime_to_filetime;

const CHUNK_HEADER: usize = 32;
const TREE_ITEM: usize = 0x200;

static NEXT_FILE_ID: AtomicUsize = AtomicUsize::new(0);

/// Instant stamped on every entry written by the builder.
pub fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 3, 15, 10, 20, 30).unwrap()
}

struct BuildEntry {
    name: String,
    parent: i32,
    is_dir: bool,
    data: Vec<u8>,
}

pub struct ContainerBuilder {
    chunk_size: u32,
    block_size: Option<u32>,
    entries: Vec<BuildEntry>,
}

impl ContainerBuilder {
    pub fn new(chunk_size: u32) -> Self {
        ContainerBuilder {
            chunk_size,
            block_size: None,
            entries: Vec::new(),
        }
    }

    /// Store every file zlib-block-compressed with the given uncompressed
    /// block size.
    pub fn compressed(mut self, block_size: u32) -> Self {
        self.block_size = Some(block_size);
        self
    }

    /// Add a file at a `/`-separated path, creating parent directories.
    pub fn file(mut self, path: &str, data: Vec<u8>) -> Self {
        let mut parent = -1i32;
        let components: Vec<&str> = path.split('/').collect();
        for dir in &components[..components.len() - 1] {
            parent = self.ensure_dir(parent, dir);
        }
        self.entries.push(BuildEntry {
            name: components[components.len() - 1].to_string(),
            parent,
            is_dir: false,
            data,
        });
        self
    }

    fn ensure_dir(&mut self, parent: i32, name: &str) -> i32 {
        for (i, e) in self.entries.iter().enumerate() {
            if e.is_dir && e.parent == parent && e.name == name {
                return i as i32;
            }
        }
        self.entries.push(BuildEntry {
            name: name.to_string(),
            parent,
            is_dir: true,
            data: Vec::new(),
        });
        self.entries.len() as i32 - 1
    }

    pub fn write_to(&self, dir: &Path) -> PathBuf {
        let id = NEXT_FILE_ID.fetch_add(1, Ordering::SeqCst);
        let path = dir.join(format!("synthetic_{id}.bcf"));
        std::fs::write(&path, self.build()).unwrap();
        path
    }

    pub fn build(&self) -> Vec<u8> {
        let chunk_size = self.chunk_size as usize;
        let usable = chunk_size - CHUNK_HEADER;
        assert!(
            self.entries.len() * TREE_ITEM <= usable,
            "entry table must fit in a single chunk"
        );
        let pointers_per_page = usable / 4;

        // Chunk 0 is reserved: its payload region overlaps the fixed file
        // header fields (tree_chunk/n_tree_items/total_chunks at 0x140),
        // so the entry tree lives in chunk 1; tables and data follow per file.
        struct Plan {
            entry: usize,
            table_chunks: Vec<u32>,
            data_chunks: Vec<u32>,
            stored: Vec<u8>,
        }
        let tree_chunk = 1u32;
        let mut plans = Vec::new();
        let mut next_chunk = tree_chunk + 1;
        for (i, e) in self.entries.iter().enumerate() {
            if e.is_dir {
                continue;
            }
            let stored = match self.block_size {
                Some(block) => wrap_zlib_blocks(&e.data, block as usize),
                None => e.data.clone(),
            };
            let n_data = stored.len().div_ceil(usable);
            let n_table = n_data.div_ceil(pointers_per_page).max(1);
            let table_chunks: Vec<u32> = (next_chunk..next_chunk + n_table as u32).collect();
            next_chunk += n_table as u32;
            let data_chunks: Vec<u32> = (next_chunk..next_chunk + n_data as u32).collect();
            next_chunk += n_data as u32;
            plans.push(Plan {
                entry: i,
                table_chunks,
                data_chunks,
                stored,
            });
        }
        let total_chunks = next_chunk;

        let mut out = vec![0u8; 0x118 + total_chunks as usize * chunk_size];
        out[0..8].copy_from_slice(b"AAMVHFSS");
        out[0x124..0x128].copy_from_slice(&2.60f32.to_le_bytes());
        out[0x128..0x12C].copy_from_slice(&(self.chunk_size).to_le_bytes());
        out[0x140..0x144].copy_from_slice(&tree_chunk.to_le_bytes());
        out[0x144..0x148].copy_from_slice(&(self.entries.len() as u32).to_le_bytes());
        out[0x148..0x14C].copy_from_slice(&total_chunks.to_le_bytes());

        let chunk_payload = |k: u32| 0x118 + k as usize * chunk_size + CHUNK_HEADER;
        let chunk_header = |k: u32| 0x118 + k as usize * chunk_size;

        // Entry table.
        let ticks = datetime_to_filetime(&fixed_time());
        for (i, e) in self.entries.iter().enumerate() {
            let first_table = plans
                .iter()
                .find(|p| p.entry == i)
                .map(|p| p.table_chunks[0] as i32)
                .unwrap_or(0);
            let at = chunk_payload(tree_chunk) + i * TREE_ITEM;
            let rec = &mut out[at..at + TREE_ITEM];
            rec[0..4].copy_from_slice(&first_table.to_le_bytes());
            rec[4..12].copy_from_slice(&(e.data_len(self.block_size) as u64).to_le_bytes());
            rec[12..20].copy_from_slice(&ticks.to_le_bytes());
            rec[20..28].copy_from_slice(&ticks.to_le_bytes());
            rec[28..36].copy_from_slice(&ticks.to_le_bytes());
            rec[36..40].copy_from_slice(&0o644u32.to_le_bytes());
            rec[40..44].copy_from_slice(&e.parent.to_le_bytes());
            rec[220] = e.is_dir as u8;
            rec[224..224 + e.name.len()].copy_from_slice(e.name.as_bytes());
        }

        // Pointer tables and data.
        for plan in &plans {
            for (page, &tc) in plan.table_chunks.iter().enumerate() {
                if plan.table_chunks.len() > 1 {
                    let next = plan.table_chunks.get(page + 1).copied().unwrap_or(0);
                    let at = chunk_header(tc);
                    out[at..at + 4].copy_from_slice(&next.to_le_bytes());
                }
                let slice = &plan.data_chunks
                    [page * pointers_per_page..plan.data_chunks.len().min((page + 1) * pointers_per_page)];
                let mut at = chunk_payload(tc);
                for &dc in slice {
                    out[at..at + 4].copy_from_slice(&dc.to_le_bytes());
                    at += 4;
                }
            }
            for (i, &dc) in plan.data_chunks.iter().enumerate() {
                let part = &plan.stored[i * usable..plan.stored.len().min((i + 1) * usable)];
                let at = chunk_payload(dc);
                out[at..at + part.len()].copy_from_slice(part);
            }
        }
        out
    }
}

impl BuildEntry {
    /// Stored size of the entry, after optional compression wrapping.
    fn data_len(&self, block_size: Option<u32>) -> usize {
        match (self.is_dir, block_size) {
            (true, _) => 0,
            (false, None) => self.data.len(),
            (false, Some(b)) => wrap_zlib_blocks(&self.data, b as usize).len(),
        }
    }
}

/// Wrap raw bytes the way SFS stores zlib-compressed files: a 0x80-byte
/// `AACS` header followed by consecutively packed deflate blocks, each with
/// a 16-byte block header.
pub fn wrap_zlib_blocks(data: &[u8], block_size: usize) -> Vec<u8> {
    let n_blocks = data.len().div_ceil(block_size);
    let mut out = vec![0u8; 0x80];
    out[0..4].copy_from_slice(&0x5343_4141u32.to_le_bytes());
    out[4..8].copy_from_slice(&(block_size as u32).to_le_bytes());
    out[12..16].copy_from_slice(&(n_blocks as u32).to_le_bytes());
    for block in data.chunks(block_size) {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(block).unwrap();
        let packed = enc.finish().unwrap();
        out.extend_from_slice(&(packed.len() as u32).to_le_bytes());
        out.extend_from_slice(&(block.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(packed.len() as u32 + 16).to_le_bytes());
        out.extend_from_slice(&packed);
    }
    out
}

/// Parameters for a synthetic acquisition header document.
pub struct HeaderXml {
    pub width: u32,
    pub height: u32,
    /// Detector image planes, each `width * height` u16 values.
    pub planes: Vec<(String, Vec<u16>)>,
    /// Summed spectrum counts, one per channel.
    pub counts: Vec<u64>,
    pub calib_abs: f64,
    pub calib_lin: f64,
    pub hv: f64,
    pub amplification: f64,
    pub dx: Option<f64>,
    pub dy: Option<f64>,
    pub file_version: u32,
    pub spectrum_indices: Vec<usize>,
    pub with_overview: bool,
}

impl Default for HeaderXml {
    fn default() -> Self {
        HeaderXml {
            width: 4,
            height: 4,
            planes: vec![("BSE".to_string(), vec![7u16; 16])],
            counts: vec![10, 40, 30, 20, 5, 4, 3, 2],
            calib_abs: -0.01,
            calib_lin: 0.01,
            hv: 20.0,
            amplification: 20000.0,
            dx: Some(0.5),
            dy: Some(0.5),
            file_version: 1,
            spectrum_indices: vec![0],
            with_overview: false,
        }
    }
}

impl HeaderXml {
    pub fn render(&self) -> String {
        let mut sem = String::new();
        sem.push_str(&format!("<HV>{}</HV>", self.hv));
        if let Some(dx) = self.dx {
            sem.push_str(&format!("<DX>{dx}</DX>"));
        }
        if let Some(dy) = self.dy {
            sem.push_str(&format!("<DY>{dy}</DY>"));
        }
        sem.push_str("<Mag>1000</Mag>");

        let mut planes = String::new();
        for (i, (desc, plane)) in self.planes.iter().enumerate() {
            let raw: Vec<u8> = plane.iter().flat_map(|v| v.to_le_bytes()).collect();
            planes.push_str(&format!(
                "<Plane{i}><Data>{}</Data><Description>{desc}</Description></Plane{i}>",
                BASE64.encode(&raw)
            ));
        }
        let image = format!(
            "<ClassInstance Type=\"TRTImageData\"><Width>{}</Width><Height>{}</Height>\
             <PlaneCount>{}</PlaneCount>{planes}</ClassInstance>",
            self.width,
            self.height,
            self.planes.len()
        );

        let overview = if self.with_overview {
            let raw: Vec<u8> = vec![5u16; (self.width * self.height) as usize]
                .iter()
                .flat_map(|v| v.to_le_bytes())
                .collect();
            format!(
                "<ClassInstance Name=\"OverviewImages\"><ChildClassInstances>\
                 <ClassInstance Type=\"TRTImageData\">\
                 <Width>{w}</Width><Height>{h}</Height><PlaneCount>1</PlaneCount>\
                 <Plane0><Data>{data}</Data><Description>Overview</Description></Plane0>\
                 <ChildClassInstances><ClassInstance Name=\"Map\">\
                 <TRTSolidOverlayElement><TRTBasicLineOverlayElement><TRTOverlayElement>\
                 <Rect><Top>1</Top><Left>2</Left><Bottom>3</Bottom><Right>4</Right></Rect>\
                 </TRTOverlayElement></TRTBasicLineOverlayElement></TRTSolidOverlayElement>\
                 </ClassInstance></ChildClassInstances>\
                 </ClassInstance></ChildClassInstances></ClassInstance>",
                w = self.width,
                h = self.height,
                data = BASE64.encode(&raw)
            )
        } else {
            String::new()
        };

        let det_layers = {
            let mini = "<DetLayers><Window Thickness=\"0.05\"/><Si Thickness=\"0.45\"/></DetLayers>";
            let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
            enc.write_all(mini.as_bytes()).unwrap();
            BASE64.encode(enc.finish().unwrap())
        };

        let mut spectra = String::new();
        for &i in &self.spectrum_indices {
            let counts = self
                .counts
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(",");
            spectra.push_str(&format!(
                "<SpectrumData{i}><ClassInstance Type=\"TRTSpectrum\" Name=\"Spectrum {i}\">\
                 <TRTHeaderedClass>\
                 <ClassInstance Type=\"TRTSpectrumHardwareHeader\">\
                 <Amplification>{amp}</Amplification><ShapingTime>130000</ShapingTime>\
                 </ClassInstance>\
                 <ClassInstance Type=\"TRTDetectorHeader\">\
                 <Type>SDD</Type><DetLayers>{det_layers}</DetLayers>\
                 </ClassInstance>\
                 <ClassInstance Type=\"TRTESMAHeader\">\
                 <PrimaryEnergy>{hv}</PrimaryEnergy><ElevationAngle>35.0</ElevationAngle>\
                 <AzimutAngle>45.0</AzimutAngle>\
                 </ClassInstance>\
                 </TRTHeaderedClass>\
                 <ClassInstance Type=\"TRTSpectrumHeader\">\
                 <CalibAbs>{abs}</CalibAbs><CalibLin>{lin}</CalibLin>\
                 <ChannelCount>{n}</ChannelCount>\
                 </ClassInstance>\
                 <Channels>{counts}</Channels>\
                 </ClassInstance></SpectrumData{i}>",
                amp = self.amplification,
                hv = self.hv,
                abs = self.calib_abs,
                lin = self.calib_lin,
                n = self.counts.len(),
            ));
        }

        format!(
            "<Data><ClassInstance Type=\"TRTSpectrumDatabase\" Name=\"Hypermap\">\
             <Header><Date>15.03.2020</Date><Time>10:20:30</Time>\
             <FileVersion>{ver}</FileVersion></Header>\
             <ChCount>{ch}</ChCount><DetectorCount>{det}</DetectorCount>\
             <LineCounter>96</LineCounter>\
             <ClassInstance Type=\"TRTSEMData\">{sem}</ClassInstance>\
             <ClassInstance Type=\"TRTSEMStageData\"><X>11.5</X><Y>-3.25</Y><Z>7.0</Z>\
             </ClassInstance>\
             <ClassInstance Type=\"TRTDSPConfiguration\"><LineAverage>1</LineAverage>\
             <PixelAverage>1</PixelAverage><PixelTime>8</PixelTime></ClassInstance>\
             {image}\
             <ClassInstance Type=\"TRTContainerClass\"><ChildClassInstances>\
             <ClassInstance Type=\"TRTElementInformationList\">\
             <ClassInstance Type=\"TRTSpectrumRegionList\"><ChildClassInstances>\
             <ClassInstance Type=\"TRTSpectrumRegion\" Name=\"Fe\">\
             <Line>K</Line><Energy>6.4</Energy><Width>0.11</Width></ClassInstance>\
             <ClassInstance Type=\"TRTSpectrumRegion\" Name=\"Al\">\
             <Line>K</Line><Energy>1.49</Energy><Width>0.07</Width></ClassInstance>\
             </ChildClassInstances></ClassInstance></ClassInstance>\
             {overview}\
             </ChildClassInstances></ClassInstance>\
             {spectra}\
             </ClassInstance></Data>",
            ver = self.file_version,
            ch = self.counts.len(),
            det = self.spectrum_indices.len(),
        )
    }
}

/// Pack 12-bit pulses the way spectral maps store them on disk: values go
/// into a dense big-endian 12-bit stream (two pulses per 3 bytes), which is
/// then byte-swapped u16-wise. The decoder's byteswap/double/drop-2-of-6
/// walk recovers exactly these values.
pub fn pack_pulses12(values: &[u16]) -> Vec<u8> {
    let mut swapped = Vec::with_capacity(values.len() / 2 * 3 + 4);
    for pair in values.chunks(2) {
        let v0 = pair[0];
        let v1 = pair.get(1).copied().unwrap_or(0);
        swapped.push((v0 >> 4) as u8);
        swapped.push((((v0 & 0x0F) << 4) | (v1 >> 8)) as u8);
        swapped.push((v1 & 0xFF) as u8);
    }
    if swapped.len() % 2 != 0 {
        swapped.push(0);
    }
    let mut body = Vec::with_capacity(swapped.len());
    for pair in swapped.chunks_exact(2) {
        body.push(pair[1]);
        body.push(pair[0]);
    }
    body
}

/// One pixel of a synthetic spectral map, in one of the three on-disk
/// encodings.
pub enum PixelData {
    /// Plain u16 pulse list.
    Pulses16(Vec<u16>),
    /// Packed 12-bit pulse list.
    Pulses12(Vec<u16>),
    /// Run-encoded histogram, with optional trailing pulse indices.
    Runs {
        histogram: Vec<u16>,
        extra: Vec<u16>,
    },
}

/// Run-encode a dense histogram: zero stretches become width-0 runs, the
/// rest u16 value runs with a zero gain.
fn encode_runs(histogram: &[u16]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < histogram.len() {
        if histogram[i] == 0 {
            let start = i;
            while i < histogram.len() && histogram[i] == 0 && i - start < 255 {
                i += 1;
            }
            out.push(0);
            out.push((i - start) as u8);
        } else {
            let start = i;
            while i < histogram.len() && histogram[i] != 0 && i - start < 255 {
                i += 1;
            }
            out.push(4);
            out.push((i - start) as u8);
            out.extend_from_slice(&0u16.to_le_bytes()); // gain
            for &v in &histogram[start..i] {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
    }
    out
}

/// Encode a hypermap pixel stream. `pixels[y]` holds `(x, data)` records
/// for line `y`; missing columns stay implicit.
pub fn encode_map_stream(
    height: u32,
    width: u32,
    chan_capacity: u16,
    pixels: &[Vec<(u32, PixelData)>],
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(height as i32).to_le_bytes());
    out.extend_from_slice(&(width as i32).to_le_bytes());
    out.resize(0x1A0, 0);
    assert_eq!(pixels.len(), height as usize);
    for line in pixels {
        out.extend_from_slice(&(line.len() as i32).to_le_bytes());
        for (x, data) in line {
            let (flag, chan_used, extra_count, body, additional) = match data {
                PixelData::Pulses16(pulses) => {
                    let body: Vec<u8> =
                        pulses.iter().flat_map(|p| p.to_le_bytes()).collect();
                    (0u16, chan_capacity, pulses.len() as u16, body, Vec::new())
                }
                PixelData::Pulses12(pulses) => (
                    1,
                    chan_capacity,
                    pulses.len() as u16,
                    pack_pulses12(pulses),
                    Vec::new(),
                ),
                PixelData::Runs { histogram, extra } => {
                    assert!(histogram.len() <= chan_capacity as usize);
                    let mut body = encode_runs(histogram);
                    let mut additional = Vec::new();
                    if extra.is_empty() {
                        body.extend_from_slice(&0u32.to_le_bytes()); // padding
                    } else {
                        body.extend_from_slice(&(extra.len() as u32 * 2).to_le_bytes());
                        for &p in extra {
                            additional.extend_from_slice(&p.to_le_bytes());
                        }
                    }
                    (2, histogram.len() as u16, extra.len() as u16, body, additional)
                }
            };
            out.extend_from_slice(&x.to_le_bytes());
            out.extend_from_slice(&chan_capacity.to_le_bytes());
            out.extend_from_slice(&chan_used.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&flag.to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&extra_count.to_le_bytes());
            out.extend_from_slice(&(body.len() as u32).to_le_bytes());
            out.extend_from_slice(&body);
            out.extend_from_slice(&additional);
        }
    }
    out
}

/// Encode a hypermap pixel stream where every listed pixel uses the plain
/// u16 pulse-list mode.
pub fn encode_pulse_stream(
    height: u32,
    width: u32,
    chan_capacity: u16,
    pixels: &[Vec<(u32, Vec<u16>)>],
) -> Vec<u8> {
    let mapped: Vec<Vec<(u32, PixelData)>> = pixels
        .iter()
        .map(|line| {
            line.iter()
                .map(|(x, pulses)| (*x, PixelData::Pulses16(pulses.clone())))
                .collect()
        })
        .collect();
    encode_map_stream(height, width, chan_capacity, &mapped)
}

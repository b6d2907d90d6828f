//! Reader for Bruker Esprit BCF files: an SFS (single-file-system)
//! container holding an XML acquisition header, 16-bit detector imagery and
//! one or more binary hypermaps (an X-ray spectrum per raster pixel).
//!
//! [`load`] is the high-level entry point and returns one record per image
//! plane and per requested hypermap, each carrying its data, axis
//! calibration and metadata trees. [`SfsContainer`], [`HyperHeader`] and
//! [`HypermapDecoder`] expose the individual layers for callers that need
//! more control.

pub mod error;
pub mod header;
pub mod hypermap;
pub mod sfs;

#[cfg(test)]
pub(crate) mod testkit;

use std::path::Path;

use log::debug;
use serde::Serialize;

pub use error::{Error, Result};
pub use header::xmltree::Value;
pub use header::{EdxSpectrum, HyperHeader, ImagePlane, Instrument};
pub use hypermap::{CancelToken, Dtype, Hypermap, HypermapData, HypermapDecoder, LazyHypermap};
pub use sfs::{SfsContainer, SfsEntry, SfsFile};

/// Which kinds of records [`load`] should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Select {
    Images,
    Spectra,
    #[default]
    Both,
}

/// Which hypermap indices to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexSelect {
    /// The lowest available index.
    #[default]
    Default,
    All,
    One(usize),
}

/// Options of the high-level [`load`] call.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub select: Select,
    pub index: IndexSelect,
    /// Spatial downsampling factor; 0 and 1 both mean none.
    pub downsample: usize,
    /// Truncate the energy axis at this energy.
    pub cutoff_kev: Option<f64>,
    /// Overrides the SEM/TEM guess derived from the beam energy.
    pub instrument: Option<Instrument>,
    /// Defer hypermap decoding; records then carry [`LazyHypermap`]s.
    pub lazy: bool,
}

/// One axis of a record's data, with its physical calibration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Axis {
    pub name: String,
    pub size: usize,
    pub offset: f64,
    pub scale: f64,
    pub units: String,
}

/// Payload of one record.
#[derive(Debug, Clone)]
pub enum RecordData {
    Image(ImagePlane),
    Hypermap(Hypermap),
    Lazy(LazyHypermap),
}

/// One loaded dataset: data, axis descriptors, the semantic metadata tree
/// and the unmodified original metadata tree.
#[derive(Debug, Clone)]
pub struct Record {
    pub data: RecordData,
    pub axes: Vec<Axis>,
    pub metadata: Value,
    pub original_metadata: Value,
}

/// A BCF file opened for reading: the container, its parsed header and the
/// set of hypermap indices found in the virtual file tree.
pub struct BcfReader {
    sfs: SfsContainer,
    header: HyperHeader,
    available_indexes: Vec<usize>,
    default_index: usize,
}

impl BcfReader {
    pub fn open(path: impl AsRef<Path>, instrument: Option<Instrument>) -> Result<BcfReader> {
        let sfs = SfsContainer::open(path)?;
        let mut available_indexes: Vec<usize> = sfs
            .dir_entries("EDSDatabase")?
            .iter()
            .filter_map(|e| e.name.strip_prefix("SpectrumData"))
            .filter_map(|suffix| suffix.parse().ok())
            .collect();
        available_indexes.sort_unstable();
        let Some(&default_index) = available_indexes.first() else {
            return Err(Error::BadHeader(
                "container holds no spectral maps".to_string(),
            ));
        };
        debug!("available hypermap indices: {available_indexes:?}");

        let xml = sfs.entry("EDSDatabase/HeaderData")?.read_all()?;
        let header = HyperHeader::parse(&xml, &available_indexes, instrument)?;
        Ok(BcfReader {
            sfs,
            header,
            available_indexes,
            default_index,
        })
    }

    pub fn container(&self) -> &SfsContainer {
        &self.sfs
    }

    pub fn header(&self) -> &HyperHeader {
        &self.header
    }

    pub fn available_indexes(&self) -> &[usize] {
        &self.available_indexes
    }

    pub fn default_index(&self) -> usize {
        self.default_index
    }

    fn validate_index(&self, index: usize) -> Result<usize> {
        if self.available_indexes.contains(&index) {
            Ok(index)
        } else {
            Err(Error::IndexOutOfRange {
                index,
                available: self.available_indexes.clone(),
            })
        }
    }

    /// Decoder for one hypermap index, to be further configured by the
    /// caller.
    pub fn decoder(&self, index: usize) -> Result<HypermapDecoder<'_>> {
        let index = self.validate_index(index)?;
        Ok(HypermapDecoder::new(&self.sfs, &self.header, index))
    }
}

/// Read a BCF file into a list of records: detector images and/or decoded
/// hypermaps, per `options`.
pub fn load(path: impl AsRef<Path>, options: &LoadOptions) -> Result<Vec<Record>> {
    let path = path.as_ref();
    let reader = BcfReader::open(path, options.instrument)?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut records = Vec::new();
    if matches!(options.select, Select::Images | Select::Both) {
        image_records(&reader, &filename, &mut records)?;
    }
    if matches!(options.select, Select::Spectra | Select::Both) {
        let indexes: Vec<usize> = match options.index {
            IndexSelect::Default => vec![reader.default_index()],
            IndexSelect::All => reader.available_indexes().to_vec(),
            IndexSelect::One(i) => vec![reader.validate_index(i)?],
        };
        for index in indexes {
            records.push(spectra_record(&reader, &filename, index, options)?);
        }
    }
    Ok(records)
}

fn object(entries: Vec<(&str, Value)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    )
}

fn image_axes(header: &HyperHeader, height: usize, width: usize) -> Vec<Axis> {
    vec![
        Axis {
            name: "height".to_string(),
            size: height,
            offset: 0.0,
            scale: header.y_res,
            units: header.units.clone(),
        },
        Axis {
            name: "width".to_string(),
            size: width,
            offset: 0.0,
            scale: header.x_res,
            units: header.units.clone(),
        },
    ]
}

fn image_records(reader: &BcfReader, filename: &str, records: &mut Vec<Record>) -> Result<()> {
    let header = reader.header();
    let mode = header.mode.to_string();
    let original_metadata = object(vec![
        ("Microscope", header.sem_metadata.clone()),
        ("DSP Configuration", header.dsp_metadata.clone()),
        ("Stage", header.stage_metadata.clone()),
    ]);

    let mut planes: Vec<(&ImagePlane, Option<&header::OverviewRect>)> =
        header.image.planes.iter().map(|p| (p, None)).collect();
    if let Some(overview) = &header.overview {
        planes.extend(
            overview
                .image
                .planes
                .iter()
                .map(|p| (p, Some(&overview.rect))),
        );
    }

    for (plane, rect) in planes {
        let mut metadata = vec![
            (
                "Acquisition_instrument",
                object(vec![(mode.as_str(), header.acq_instrument(None)?)]),
            ),
            (
                "General",
                object(vec![
                    ("title", Value::Str(plane.description.clone())),
                    ("original_filename", Value::Str(filename.to_string())),
                ]),
            ),
            (
                "Sample",
                object(vec![("name", Value::Str(header.name.clone()))]),
            ),
            (
                "Signal",
                object(vec![
                    ("signal_type", Value::Str(plane.description.clone())),
                    ("record_by", Value::Str("image".to_string())),
                ]),
            ),
        ];
        if let Some(rect) = rect {
            // The overview plane marks the mapped region of interest in
            // physical coordinates.
            metadata.push((
                "Markers",
                object(vec![(
                    "overview",
                    object(vec![
                        ("marker_type", Value::Str("Rectangle".to_string())),
                        (
                            "data",
                            object(vec![
                                ("y1", Value::Float(rect.y1)),
                                ("x1", Value::Float(rect.x1)),
                                ("y2", Value::Float(rect.y2)),
                                ("x2", Value::Float(rect.x2)),
                            ]),
                        ),
                    ]),
                )]),
            ));
        }
        records.push(Record {
            axes: image_axes(header, plane.height, plane.width),
            metadata: object(metadata),
            original_metadata: original_metadata.clone(),
            data: RecordData::Image(plane.clone()),
        });
    }
    Ok(())
}

fn spectra_record(
    reader: &BcfReader,
    filename: &str,
    index: usize,
    options: &LoadOptions,
) -> Result<Record> {
    let header = reader.header();
    let downsample = options.downsample.max(1);
    let decoder = reader
        .decoder(index)?
        .downsample(downsample)
        .cutoff_kev(options.cutoff_kev)?;

    let (shape, data) = if options.lazy {
        let lazy = decoder.lazy(options.instrument)?;
        (lazy.shape, RecordData::Lazy(lazy))
    } else {
        let map = decoder.decode()?;
        (map.shape(), RecordData::Hypermap(map))
    };

    let spectrum = header.spectrum(index)?;
    let axes = vec![
        Axis {
            name: "height".to_string(),
            size: shape.0,
            offset: 0.0,
            scale: header.y_res * downsample as f64,
            units: header.units.clone(),
        },
        Axis {
            name: "width".to_string(),
            size: shape.1,
            offset: 0.0,
            scale: header.x_res * downsample as f64,
            units: header.units.clone(),
        },
        Axis {
            name: "Energy".to_string(),
            size: shape.2,
            offset: spectrum.calib_abs,
            scale: spectrum.calib_lin,
            units: "keV".to_string(),
        },
    ];

    let mode = header.mode.to_string();
    let elements: Vec<Value> = header
        .elements
        .keys()
        .map(|s| Value::Str(s.clone()))
        .collect();
    let mut xray_lines: Vec<String> = header
        .elements
        .iter()
        .map(|(symbol, e)| format!("{symbol}_{}", xray_line_label(&e.line)))
        .collect();
    xray_lines.sort();

    let metadata = object(vec![
        (
            "Acquisition_instrument",
            object(vec![(mode.as_str(), header.acq_instrument(Some(index))?)]),
        ),
        (
            "General",
            object(vec![
                ("original_filename", Value::Str(filename.to_string())),
                ("title", Value::Str("EDX".to_string())),
                ("date", Value::Str(header.date.clone())),
                ("time", Value::Str(header.time.clone())),
            ]),
        ),
        (
            "Sample",
            object(vec![
                ("name", Value::Str(header.name.clone())),
                ("elements", Value::List(elements)),
                (
                    "xray_lines",
                    Value::List(xray_lines.into_iter().map(Value::Str).collect()),
                ),
            ]),
        ),
        (
            "Signal",
            object(vec![
                ("signal_type", Value::Str(format!("EDS_{mode}"))),
                ("record_by", Value::Str("spectrum".to_string())),
                ("quantity", Value::Str("X-rays (Counts)".to_string())),
            ]),
        ),
    ]);
    let original_metadata = object(vec![
        ("Hardware", spectrum.hardware_metadata.clone()),
        ("Detector", spectrum.detector_metadata.clone()),
        ("Analysis", spectrum.esma_metadata.clone()),
        ("Spectrum", spectrum.spectrum_metadata.clone()),
        ("DSP Configuration", header.dsp_metadata.clone()),
        ("Line counter", header.line_counter.clone()),
        ("Stage", header.stage_metadata.clone()),
        ("Microscope", header.sem_metadata.clone()),
    ]);

    Ok(Record {
        data,
        axes,
        metadata,
        original_metadata,
    })
}

/// Normalise an X-ray line description: the vendor stores lines in caps and
/// omits the series letter when only one exists.
fn xray_line_label(line: &str) -> String {
    let line = if line.len() == 1 {
        format!("{line}a")
    } else if line.len() > 2 {
        line[..2].to_string()
    } else {
        line.to_string()
    };
    let mut chars = line.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => line,
    }
}

//! Parsing of the acquisition header (`EDSDatabase/HeaderData`).
//!
//! The header is one XML document holding the raster calibration, the
//! detector imagery, the element selection and one summed spectrum per
//! hypermap. Only the fields the readers need are lifted into typed
//! structs; everything else stays available as dynamically-typed metadata
//! trees.

pub mod xmltree;

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{NaiveDate, NaiveTime};
use flate2::read::ZlibDecoder;
use log::info;

use crate::error::{Error, Result};
use xmltree::{dictionarize, Value, XmlNode};

/// Kind of electron microscope the acquisition was made on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instrument {
    Sem,
    Tem,
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Instrument::Sem => "SEM",
            Instrument::Tem => "TEM",
        })
    }
}

impl FromStr for Instrument {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s {
            "SEM" | "sem" => Ok(Instrument::Sem),
            "TEM" | "tem" => Ok(Instrument::Tem),
            other => Err(format!("unknown instrument '{other}', expected SEM or TEM")),
        }
    }
}

/// One detector image plane, kept only when it contains non-zero pixels.
#[derive(Debug, Clone)]
pub struct ImagePlane {
    pub width: usize,
    pub height: usize,
    /// Row-major `width * height` values.
    pub data: Vec<u16>,
    pub description: String,
}

/// The set of image planes recorded by one image node.
#[derive(Debug, Clone, Default)]
pub struct ImageSet {
    pub width: usize,
    pub height: usize,
    pub planes: Vec<ImagePlane>,
}

/// Region of interest of the overview image, in physical units.
#[derive(Debug, Clone, Copy)]
pub struct OverviewRect {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

#[derive(Debug, Clone)]
pub struct Overview {
    pub image: ImageSet,
    pub rect: OverviewRect,
}

/// One entry of the element selection.
#[derive(Debug, Clone)]
pub struct ElementLine {
    pub line: String,
    pub energy: f64,
    pub width: f64,
}

/// Summed spectrum and detector description of one hypermap index.
#[derive(Debug, Clone)]
pub struct EdxSpectrum {
    pub hardware_metadata: Value,
    pub detector_metadata: Value,
    pub esma_metadata: Value,
    pub spectrum_metadata: Value,
    /// Amplification in V; `amplification / 1000` is the detector range in
    /// keV.
    pub amplification: f64,
    pub detector_type: String,
    /// Primary beam energy in kV.
    pub hv: f64,
    pub elevation_angle: f64,
    pub azimuth_angle: Option<f64>,
    /// Energy of channel 0, keV.
    pub calib_abs: f64,
    /// keV per channel.
    pub calib_lin: f64,
    pub channel_count: usize,
    /// Summed intensity per channel over the whole raster.
    pub counts: Vec<u64>,
}

impl EdxSpectrum {
    fn parse(node: &XmlNode) -> Result<EdxSpectrum> {
        let headered = node
            .find("TRTHeaderedClass")
            .ok_or_else(|| bad("spectrum without TRTHeaderedClass"))?;
        let hardware = headered
            .find_class("TRTSpectrumHardwareHeader")
            .ok_or_else(|| bad("spectrum without hardware header"))?;
        let detector = headered
            .find_class("TRTDetectorHeader")
            .ok_or_else(|| bad("spectrum without detector header"))?;
        let esma = headered
            .find_class("TRTESMAHeader")
            .ok_or_else(|| bad("spectrum without ESMA header"))?;
        let spectrum_header = node
            .find_class("TRTSpectrumHeader")
            .ok_or_else(|| bad("spectrum without spectrum header"))?;

        let hardware_metadata = dictionarize(hardware);
        let amplification = hardware_metadata
            .get("Amplification")
            .and_then(Value::as_f64)
            .ok_or_else(|| bad("spectrum without Amplification"))?;

        let mut detector_metadata = dictionarize(detector);
        let detector_type = detector_metadata
            .get("Type")
            .and_then(Value::as_str)
            .ok_or_else(|| bad("spectrum without detector Type"))?
            .to_string();
        // The detector layer description hides as a base64-encoded,
        // zlib-compressed XML sub-document.
        if let Value::Map(map) = &mut detector_metadata {
            if let Some(Value::Str(encoded)) = map.get("DetLayers") {
                let layers = parse_detector_layers(encoded)?;
                map.insert("DetLayers".to_string(), layers);
            }
        }

        let esma_metadata = dictionarize(esma);
        let hv = esma_metadata
            .get("PrimaryEnergy")
            .and_then(Value::as_f64)
            .ok_or_else(|| bad("spectrum without PrimaryEnergy"))?;
        let elevation_angle = esma_metadata
            .get("ElevationAngle")
            .and_then(Value::as_f64)
            .ok_or_else(|| bad("spectrum without ElevationAngle"))?;
        let azimuth_angle = esma_metadata.get("AzimutAngle").and_then(Value::as_f64);

        let spectrum_metadata = dictionarize(spectrum_header);
        let calib_abs = spectrum_metadata
            .get("CalibAbs")
            .and_then(Value::as_f64)
            .ok_or_else(|| bad("spectrum without CalibAbs"))?;
        let calib_lin = spectrum_metadata
            .get("CalibLin")
            .and_then(Value::as_f64)
            .ok_or_else(|| bad("spectrum without CalibLin"))?;
        let channel_count = spectrum_metadata
            .get("ChannelCount")
            .and_then(Value::as_i64)
            .ok_or_else(|| bad("spectrum without ChannelCount"))? as usize;

        let channels_text = node
            .find("Channels")
            .ok_or_else(|| bad("spectrum without Channels data"))?
            .text()
            .to_string();
        let counts = channels_text
            .split(',')
            .map(|v| v.trim().parse::<u64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| bad(&format!("unparseable channel counts: {e}")))?;

        Ok(EdxSpectrum {
            hardware_metadata,
            detector_metadata,
            esma_metadata,
            spectrum_metadata,
            amplification,
            detector_type,
            hv,
            elevation_angle,
            azimuth_angle,
            calib_abs,
            calib_lin,
            channel_count,
            counts,
        })
    }

    /// Convert an energy in keV to the nearest channel index.
    pub fn energy_to_channel(&self, energy_kev: f64) -> i64 {
        ((energy_kev - self.calib_abs) / self.calib_lin).round() as i64
    }
}

fn bad(msg: &str) -> Error {
    Error::BadHeader(msg.to_string())
}

/// Base64 decode tolerating embedded line breaks.
fn decode_base64(s: &str) -> Result<Vec<u8>> {
    let compact: String = s.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    BASE64
        .decode(compact.as_bytes())
        .map_err(|e| bad(&format!("bad base64 payload: {e}")))
}

fn parse_detector_layers(encoded: &str) -> Result<Value> {
    let packed = decode_base64(encoded)?;
    let mut xml = Vec::new();
    ZlibDecoder::new(packed.as_slice())
        .read_to_end(&mut xml)
        .map_err(|e| bad(&format!("bad DetLayers stream: {e}")))?;
    let doc = XmlNode::parse(&xml)?;
    let mut layers = BTreeMap::new();
    for child in &doc.children {
        let attrs: BTreeMap<String, Value> = child
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), Value::Str(v.clone())))
            .collect();
        layers.insert(child.tag.clone(), Value::Map(attrs));
    }
    Ok(Value::Map(layers))
}

/// The parsed acquisition header.
#[derive(Debug, Clone)]
pub struct HyperHeader {
    pub name: String,
    /// ISO-8601 acquisition date and time.
    pub date: String,
    pub time: String,
    pub version: i64,
    pub line_counter: Value,
    pub channel_count: i64,
    pub mapping_count: i64,
    pub sem_metadata: Value,
    pub stage_metadata: Value,
    pub dsp_metadata: Value,
    /// Primary beam energy in kV, 0 when the microscope record is absent.
    pub hv: f64,
    /// `"µm"` when the microscope record calibrates pixels, else `"pix"`.
    pub units: String,
    pub x_res: f64,
    pub y_res: f64,
    pub mode: Instrument,
    pub image: ImageSet,
    pub overview: Option<Overview>,
    pub elements: BTreeMap<String, ElementLine>,
    spectra: BTreeMap<usize, EdxSpectrum>,
}

impl HyperHeader {
    /// Parse the header document and the summed-spectrum records for the
    /// given hypermap indices.
    pub fn parse(xml: &[u8], indexes: &[usize], instrument: Option<Instrument>) -> Result<Self> {
        let doc = XmlNode::parse(xml)?;
        let root = doc
            .find_class("TRTSpectrumDatabase")
            .ok_or_else(|| bad("missing TRTSpectrumDatabase"))?;
        let name = match root.attr("Name") {
            Some(n) => n.to_string(),
            None => {
                info!("hypermap has no name, calling it 'Undefined'");
                "Undefined".to_string()
            }
        };

        let hd = root.find("Header").ok_or_else(|| bad("missing Header"))?;
        let date_text = hd
            .find("Date")
            .ok_or_else(|| bad("missing Header/Date"))?
            .text()
            .to_string();
        let time_text = hd
            .find("Time")
            .ok_or_else(|| bad("missing Header/Time"))?
            .text()
            .to_string();
        let date = NaiveDate::parse_from_str(&date_text, "%d.%m.%Y")
            .map_err(|e| bad(&format!("bad Header/Date '{date_text}': {e}")))?
            .format("%Y-%m-%d")
            .to_string();
        let time = NaiveTime::parse_from_str(&time_text, "%H:%M:%S")
            .map_err(|e| bad(&format!("bad Header/Time '{time_text}': {e}")))?
            .format("%H:%M:%S")
            .to_string();
        let version = hd
            .find("FileVersion")
            .and_then(|n| n.text().parse::<i64>().ok())
            .ok_or_else(|| bad("missing Header/FileVersion"))?;

        let line_counter = root
            .find("LineCounter")
            .map(|n| xmltree::interpret(n.text()))
            .ok_or_else(|| bad("missing LineCounter"))?;
        let channel_count = root
            .find("ChCount")
            .and_then(|n| n.text().parse::<i64>().ok())
            .ok_or_else(|| bad("missing ChCount"))?;
        let mapping_count = root
            .find("DetectorCount")
            .and_then(|n| n.text().parse::<i64>().ok())
            .ok_or_else(|| bad("missing DetectorCount"))?;

        // Microscope column parameters; availability depends on the vendor
        // licence so everything here has a fallback.
        let sem_node = root.find_class("TRTSEMData");
        let sem_metadata = sem_node.map(dictionarize).unwrap_or(Value::Null);
        let hv = sem_metadata.get("HV").and_then(Value::as_f64).unwrap_or(0.0);
        let (units, x_res, y_res) = match sem_metadata.get("DX") {
            Some(dx) => (
                "µm".to_string(),
                dx.as_f64().unwrap_or(1.0),
                sem_metadata
                    .get("DY")
                    .and_then(Value::as_f64)
                    .unwrap_or(1.0),
            ),
            None => ("pix".to_string(), 1.0, 1.0),
        };
        let stage_metadata = root
            .find_class("TRTSEMStageData")
            .map(dictionarize)
            .unwrap_or(Value::Null);
        let dsp_metadata = root
            .find_class("TRTDSPConfiguration")
            .map(dictionarize)
            .unwrap_or(Value::Null);

        let mode = match instrument {
            Some(mode) => mode,
            None if hv > 30.0 => Instrument::Tem,
            None => {
                info!(
                    "guessing a SEM acquisition from the {hv} keV beam energy; \
                     pass an instrument override if this is wrong"
                );
                Instrument::Sem
            }
        };

        let image_node = root
            .find_classes("TRTImageData")
            .filter(|n| n.attr("Name").is_none())
            .last()
            .ok_or_else(|| bad("missing image data"))?;
        let image = parse_image(image_node)?;

        let container = root
            .find_class("TRTContainerClass")
            .and_then(|c| c.find("ChildClassInstances"));

        let overview = if version == 2 {
            parse_overview(container, x_res, y_res)?
        } else {
            None
        };

        let mut elements = BTreeMap::new();
        let element_nodes = container
            .and_then(|c| c.find_class("TRTElementInformationList"))
            .and_then(|c| c.find_class("TRTSpectrumRegionList"))
            .and_then(|c| c.find("ChildClassInstances"));
        match element_nodes {
            Some(list) => {
                for region in list.find_classes("TRTSpectrumRegion") {
                    let Some(symbol) = region.attr("Name") else {
                        continue;
                    };
                    let line = region
                        .find("Line")
                        .map(|n| n.text().to_string())
                        .unwrap_or_default();
                    let energy = region
                        .find("Energy")
                        .and_then(|n| n.text().parse().ok())
                        .unwrap_or(0.0);
                    let width = region
                        .find("Width")
                        .and_then(|n| n.text().parse().ok())
                        .unwrap_or(0.0);
                    elements.insert(symbol.to_string(), ElementLine { line, energy, width });
                }
            }
            None => info!("no element selection present in the spectra"),
        }

        let mut spectra = BTreeMap::new();
        for &i in indexes {
            let node = root
                .find(&format!("SpectrumData{i}"))
                .and_then(|n| n.find("ClassInstance"))
                .ok_or_else(|| bad(&format!("missing SpectrumData{i}")))?;
            spectra.insert(i, EdxSpectrum::parse(node)?);
        }

        Ok(HyperHeader {
            name,
            date,
            time,
            version,
            line_counter,
            channel_count,
            mapping_count,
            sem_metadata,
            stage_metadata,
            dsp_metadata,
            hv,
            units,
            x_res,
            y_res,
            mode,
            image,
            overview,
            elements,
            spectra,
        })
    }

    pub fn spectrum(&self, index: usize) -> Result<&EdxSpectrum> {
        self.spectra.get(&index).ok_or_else(|| Error::IndexOutOfRange {
            index,
            available: self.spectra.keys().copied().collect(),
        })
    }

    /// Smallest channel count such that no per-pixel spectrum is truncated:
    /// the full channel count when the beam energy covers the detector
    /// range, else the channel of the beam energy.
    pub fn estimate_channels(&self, index: usize) -> Result<usize> {
        let spectrum = self.spectrum(index)?;
        let detector_range = spectrum.amplification / 1000.0;
        if self.hv >= detector_range {
            Ok(spectrum.counts.len())
        } else {
            Ok(spectrum.energy_to_channel(self.hv).max(0) as usize)
        }
    }

    /// Conservative per-cell upper bound used to size the output integer
    /// width: the summed-spectrum peak spread over the raster, doubled, and
    /// scaled by the downsample area.
    pub fn depth_roof(&self, index: usize, downsample: usize) -> Result<u64> {
        let spectrum = self.spectrum(index)?;
        let peak = spectrum.counts.iter().copied().max().unwrap_or(0);
        let w = self.image.width.max(1) as u64;
        let h = self.image.height.max(1) as u64;
        Ok(peak / w / h * 2 * downsample as u64 * downsample as u64)
    }

    /// Total acquisition time over the raster in seconds, when the DSP
    /// record carries the timing fields.
    pub fn real_time(&self) -> Option<f64> {
        let line_sum = match &self.line_counter {
            Value::Int(v) => *v as f64,
            Value::List(vs) => vs.iter().filter_map(Value::as_f64).sum(),
            other => other.as_f64()?,
        };
        let line_avg = self.dsp_metadata.get("LineAverage")?.as_f64()?;
        let pix_avg = self.dsp_metadata.get("PixelAverage")?.as_f64()?;
        let pix_time = self.dsp_metadata.get("PixelTime")?.as_f64()?;
        Some(line_sum * line_avg * pix_avg * pix_time * self.image.width as f64 / 1_000_000.0)
    }

    /// Semantic acquisition-instrument summary for result records.
    pub fn acq_instrument(&self, detector_index: Option<usize>) -> Result<Value> {
        let mut acq = BTreeMap::new();
        acq.insert("beam_energy".to_string(), Value::Float(self.hv));
        if let Some(mag) = self.sem_metadata.get("Mag").and_then(Value::as_f64) {
            acq.insert("magnification".to_string(), Value::Float(mag));
        }
        if let Some(index) = detector_index {
            let spectrum = self.spectrum(index)?;
            let mut eds = BTreeMap::new();
            eds.insert(
                "elevation_angle".to_string(),
                Value::Float(spectrum.elevation_angle),
            );
            eds.insert(
                "detector_type".to_string(),
                Value::Str(spectrum.detector_type.clone()),
            );
            if let Some(real_time) = self.real_time() {
                eds.insert("real_time".to_string(), Value::Float(real_time));
            }
            if let Some(azimuth) = spectrum.azimuth_angle {
                eds.insert("azimuth_angle".to_string(), Value::Float(azimuth));
            }
            let mut detector = BTreeMap::new();
            detector.insert("EDS".to_string(), Value::Map(eds));
            acq.insert("Detector".to_string(), Value::Map(detector));
        }
        Ok(Value::Map(acq))
    }
}

/// Parse one image node: dimensions, then one base64-encoded u16 buffer per
/// plane. Planes that are entirely zero are dropped.
fn parse_image(node: &XmlNode) -> Result<ImageSet> {
    let width = node
        .find("Width")
        .and_then(|n| n.text().parse::<usize>().ok())
        .ok_or_else(|| bad("image without Width"))?;
    let height = node
        .find("Height")
        .and_then(|n| n.text().parse::<usize>().ok())
        .ok_or_else(|| bad("image without Height"))?;
    let plane_count = node
        .find("PlaneCount")
        .and_then(|n| n.text().parse::<usize>().ok())
        .ok_or_else(|| bad("image without PlaneCount"))?;

    let mut planes = Vec::new();
    for i in 0..plane_count {
        let Some(plane) = node.find(&format!("Plane{i}")) else {
            continue;
        };
        let Some(data_node) = plane.find("Data") else {
            continue;
        };
        let raw = decode_base64(data_node.text())?;
        if raw.len() != width * height * 2 {
            return Err(bad(&format!(
                "image plane {i} holds {} bytes, expected {}",
                raw.len(),
                width * height * 2
            )));
        }
        let data: Vec<u16> = raw
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect();
        if data.iter().all(|&v| v == 0) {
            continue;
        }
        let description = plane
            .find("Description")
            .map(|n| n.text().to_string())
            .unwrap_or_default();
        planes.push(ImagePlane {
            width,
            height,
            data,
            description,
        });
    }
    Ok(ImageSet {
        width,
        height,
        planes,
    })
}

/// Version-2 headers may carry an overview image with a rectangular region
/// of interest marking the mapped area, in pixel coordinates.
fn parse_overview(
    container: Option<&XmlNode>,
    x_res: f64,
    y_res: f64,
) -> Result<Option<Overview>> {
    let Some(node) = container
        .and_then(|c| c.find_class_named("OverviewImages"))
        .and_then(|c| c.find("ChildClassInstances"))
        .and_then(|c| c.find_class("TRTImageData"))
    else {
        return Ok(None);
    };
    let image = parse_image(node)?;
    let rect = node
        .find("ChildClassInstances")
        .and_then(|c| c.find_class_named("Map"))
        .and_then(|c| c.find("TRTSolidOverlayElement"))
        .and_then(|c| c.find("TRTBasicLineOverlayElement"))
        .and_then(|c| c.find("TRTOverlayElement"))
        .and_then(|c| c.find("Rect"))
        .ok_or_else(|| bad("overview image without a Map rectangle"))?;
    let side = |tag: &str| -> Result<f64> {
        rect.find(tag)
            .and_then(|n| n.text().parse::<f64>().ok())
            .ok_or_else(|| bad(&format!("overview rectangle without {tag}")))
    };
    let rect = OverviewRect {
        y1: side("Top")? * y_res,
        x1: side("Left")? * x_res,
        y2: side("Bottom")? * y_res,
        x2: side("Right")? * x_res,
    };
    Ok(Some(Overview { image, rect }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::HeaderXml;

    fn parse_default() -> HyperHeader {
        let xml = HeaderXml::default().render();
        HyperHeader::parse(xml.as_bytes(), &[0], None).unwrap()
    }

    #[test]
    fn extracts_calibration_and_timing() {
        let h = parse_default();
        assert_eq!(h.name, "Hypermap");
        assert_eq!(h.date, "2020-03-15");
        assert_eq!(h.time, "10:20:30");
        assert_eq!(h.version, 1);
        assert_eq!(h.units, "µm");
        assert_eq!(h.x_res, 0.5);
        assert_eq!(h.y_res, 0.5);
        assert_eq!(h.mode, Instrument::Sem);
        assert_eq!(h.channel_count, 8);
    }

    #[test]
    fn extracts_images_and_elements() {
        let h = parse_default();
        assert_eq!(h.image.width, 4);
        assert_eq!(h.image.height, 4);
        assert_eq!(h.image.planes.len(), 1);
        assert_eq!(h.image.planes[0].description, "BSE");
        assert!(h.image.planes[0].data.iter().all(|&v| v == 7));

        assert_eq!(h.elements.len(), 2);
        let fe = &h.elements["Fe"];
        assert_eq!(fe.line, "K");
        assert_eq!(fe.energy, 6.4);
    }

    #[test]
    fn zero_planes_are_dropped() {
        let mut cfg = HeaderXml::default();
        cfg.planes = vec![
            ("Empty".to_string(), vec![0u16; 16]),
            ("SE".to_string(), vec![3u16; 16]),
        ];
        let xml = cfg.render();
        let h = HyperHeader::parse(xml.as_bytes(), &[0], None).unwrap();
        assert_eq!(h.image.planes.len(), 1);
        assert_eq!(h.image.planes[0].description, "SE");
    }

    #[test]
    fn spectrum_record_and_channel_estimate() {
        let h = parse_default();
        let s = h.spectrum(0).unwrap();
        assert_eq!(s.calib_abs, -0.01);
        assert_eq!(s.calib_lin, 0.01);
        assert_eq!(s.channel_count, 8);
        assert_eq!(s.counts, vec![10, 40, 30, 20, 5, 4, 3, 2]);
        assert_eq!(s.detector_type, "SDD");
        assert_eq!(s.amplification, 20000.0);
        // Detector layers decode from the packed sub-document.
        let layers = s.detector_metadata.get("DetLayers").unwrap();
        let si = layers.get("Si").unwrap();
        assert_eq!(si.get("Thickness"), Some(&Value::Str("0.45".to_string())));

        // 20 kV beam covers the 20 keV detector range: full channel count.
        assert_eq!(h.estimate_channels(0).unwrap(), 8);
        assert_eq!(s.energy_to_channel(0.04), 5);
    }

    #[test]
    fn low_beam_energy_truncates_channel_estimate() {
        let mut cfg = HeaderXml::default();
        cfg.hv = 10.0;
        cfg.amplification = 20000.0;
        cfg.calib_abs = 0.0;
        cfg.calib_lin = 2.0;
        let xml = cfg.render();
        let h = HyperHeader::parse(xml.as_bytes(), &[0], None).unwrap();
        assert_eq!(h.estimate_channels(0).unwrap(), 5);
    }

    #[test]
    fn depth_roof_scales_with_downsampling() {
        let h = parse_default();
        // peak 40 over a 4x4 raster, doubled: 40/4/4*2 = 4.
        assert_eq!(h.depth_roof(0, 1).unwrap(), 4);
        assert_eq!(h.depth_roof(0, 2).unwrap(), 16);
    }

    #[test]
    fn instrument_override_and_guess() {
        let xml = HeaderXml::default().render();
        let h = HyperHeader::parse(xml.as_bytes(), &[0], Some(Instrument::Tem)).unwrap();
        assert_eq!(h.mode, Instrument::Tem);

        let mut cfg = HeaderXml::default();
        cfg.hv = 200.0;
        let xml = cfg.render();
        let h = HyperHeader::parse(xml.as_bytes(), &[0], None).unwrap();
        assert_eq!(h.mode, Instrument::Tem);
    }

    #[test]
    fn version_two_overview_rect_in_physical_units() {
        let mut cfg = HeaderXml::default();
        cfg.file_version = 2;
        cfg.with_overview = true;
        let xml = cfg.render();
        let h = HyperHeader::parse(xml.as_bytes(), &[0], None).unwrap();
        let overview = h.overview.expect("overview expected");
        assert_eq!(overview.image.planes.len(), 1);
        let r = overview.rect;
        assert_eq!((r.y1, r.x1, r.y2, r.x2), (0.5, 1.0, 1.5, 2.0));
    }

    #[test]
    fn missing_mandatory_nodes_fail() {
        assert!(matches!(
            HyperHeader::parse(b"<Data><Other/></Data>", &[], None),
            Err(Error::BadHeader(_))
        ));

        let xml = HeaderXml::default().render().replace(
            "<ChCount>8</ChCount>",
            "",
        );
        assert!(matches!(
            HyperHeader::parse(xml.as_bytes(), &[0], None),
            Err(Error::BadHeader(_))
        ));

        // A requested spectrum index that is not in the document.
        let xml = HeaderXml::default().render();
        assert!(matches!(
            HyperHeader::parse(xml.as_bytes(), &[0, 1], None),
            Err(Error::BadHeader(_))
        ));
    }

    #[test]
    fn real_time_from_dsp_record() {
        let h = parse_default();
        // 96 lines * 1 * 1 * 8 us * 4 pixels wide / 1e6.
        assert_eq!(h.real_time(), Some(96.0 * 8.0 * 4.0 / 1_000_000.0));
    }
}

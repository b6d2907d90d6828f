use std::collections::BTreeMap;
use std::path::Path;

use clap::{Arg, ArgAction, Command};
use log::info;

use bcf_io::{
    BcfReader, Dtype, Hypermap, HypermapData, Instrument, LoadOptions, RecordData, Select, Value,
};

fn main() {
    env_logger::init();
    let matches = Command::new("bcf_io")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Inspect Bruker BCF hypermap containers: file tree, metadata, imagery and spectral maps.")
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .value_parser(clap::value_parser!(String))
                .required(true)
                .help("The path to the BCF file."),
        )
        .arg(
            Arg::new("tree")
                .short('t')
                .long("tree")
                .action(ArgAction::SetTrue)
                .help("Print the container's virtual file tree."),
        )
        .arg(
            Arg::new("metadata")
                .short('m')
                .long("metadata")
                .action(ArgAction::SetTrue)
                .help("Dump the parsed acquisition metadata as JSON."),
        )
        .arg(
            Arg::new("extract")
                .short('e')
                .long("extract")
                .value_name("ENTRY")
                .help("Extract one entry of the virtual file tree (e.g. 'EDSDatabase/HeaderData')."),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Where --extract writes the entry's bytes."),
        )
        .arg(
            Arg::new("map")
                .long("map")
                .action(ArgAction::SetTrue)
                .help("Decode the spectral map and print a summary."),
        )
        .arg(
            Arg::new("index")
                .long("index")
                .value_parser(clap::value_parser!(usize))
                .help("Hypermap index to decode (defaults to the lowest available)."),
        )
        .arg(
            Arg::new("downsample")
                .short('d')
                .long("downsample")
                .value_parser(clap::value_parser!(usize))
                .help("Downsampling factor for --map."),
        )
        .arg(
            Arg::new("cutoff")
                .short('c')
                .long("cutoff")
                .value_parser(clap::value_parser!(f64))
                .help("Truncate the energy axis at this energy in keV."),
        )
        .arg(
            Arg::new("instrument")
                .long("instrument")
                .value_name("SEM|TEM")
                .help("Override the instrument guess."),
        )
        .get_matches();

    let file_path = matches.get_one::<String>("input").unwrap();
    let instrument = match matches.get_one::<String>("instrument") {
        Some(text) => match text.parse::<Instrument>() {
            Ok(instrument) => Some(instrument),
            Err(err) => {
                eprintln!("Error: {}", err);
                std::process::exit(1);
            }
        },
        None => None,
    };

    let reader = match BcfReader::open(file_path, instrument) {
        Ok(reader) => reader,
        Err(err) => {
            eprintln!("Error: {}", err);
            std::process::exit(1);
        }
    };

    if matches.get_flag("tree") {
        print_tree(&reader);
        return;
    }
    if matches.get_flag("metadata") {
        print_metadata(&reader);
        return;
    }
    if let Some(entry) = matches.get_one::<String>("extract") {
        let Some(output) = matches.get_one::<String>("output") else {
            eprintln!("Error: --extract needs --output.");
            std::process::exit(1);
        };
        extract_entry(&reader, entry, Path::new(output));
        return;
    }
    if matches.get_flag("map") {
        let mut options = LoadOptions::default();
        options.select = Select::Spectra;
        options.instrument = instrument;
        options.cutoff_kev = matches.get_one::<f64>("cutoff").copied();
        options.downsample = matches.get_one::<usize>("downsample").copied().unwrap_or(1);
        if let Some(&index) = matches.get_one::<usize>("index") {
            options.index = bcf_io::IndexSelect::One(index);
        }
        print_map_summary(file_path, &options);
        return;
    }
    print_info(&reader);
}

fn print_info(reader: &BcfReader) {
    let sfs = reader.container();
    let header = reader.header();
    println!("SFS container v{}", sfs.version_string());
    println!("  Chunk size: {} bytes", sfs.chunk_size());
    println!("  Chunks: {}", sfs.total_chunks());
    println!(
        "  Compression: {}",
        if sfs.is_compressed() { "zlib" } else { "none" }
    );
    println!("  Entries: {}", sfs.entries().len());
    println!("Acquisition '{}'", header.name);
    println!("  Recorded: {} {}", header.date, header.time);
    println!("  Instrument: {} at {} kV", header.mode, header.hv);
    println!(
        "  Resolution: {} x {} {}/pixel",
        header.x_res, header.y_res, header.units
    );
    println!(
        "  Image: {}x{} pixels, {} plane(s)",
        header.image.width,
        header.image.height,
        header.image.planes.len()
    );
    println!("  Hypermap indices: {:?}", reader.available_indexes());
    if !header.elements.is_empty() {
        let symbols: Vec<&str> = header.elements.keys().map(String::as_str).collect();
        println!("  Elements: {}", symbols.join(", "));
    }
}

fn print_tree(reader: &BcfReader) {
    let sfs = reader.container();
    for (idx, entry) in sfs.entries().iter().enumerate() {
        let kind = if entry.is_dir { "dir " } else { "file" };
        let stamp = entry
            .modify_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        println!(
            "{kind} {size:>12}  {stamp}  {path}",
            size = entry.size,
            path = sfs.path_of(idx)
        );
    }
}

fn print_metadata(reader: &BcfReader) {
    let header = reader.header();
    let mut doc = BTreeMap::new();
    doc.insert("Name".to_string(), Value::Str(header.name.clone()));
    doc.insert("Date".to_string(), Value::Str(header.date.clone()));
    doc.insert("Time".to_string(), Value::Str(header.time.clone()));
    doc.insert("Mode".to_string(), Value::Str(header.mode.to_string()));
    doc.insert("Microscope".to_string(), header.sem_metadata.clone());
    doc.insert("Stage".to_string(), header.stage_metadata.clone());
    doc.insert(
        "DSP Configuration".to_string(),
        header.dsp_metadata.clone(),
    );
    let mut spectra = BTreeMap::new();
    for &index in reader.available_indexes() {
        if let Ok(spectrum) = header.spectrum(index) {
            let mut s = BTreeMap::new();
            s.insert("Hardware".to_string(), spectrum.hardware_metadata.clone());
            s.insert("Detector".to_string(), spectrum.detector_metadata.clone());
            s.insert("Analysis".to_string(), spectrum.esma_metadata.clone());
            s.insert("Spectrum".to_string(), spectrum.spectrum_metadata.clone());
            spectra.insert(format!("SpectrumData{index}"), Value::Map(s));
        }
    }
    doc.insert("Spectra".to_string(), Value::Map(spectra));

    match serde_json::to_string_pretty(&Value::Map(doc)) {
        Ok(json) => println!("{json}"),
        Err(err) => {
            eprintln!("Error: {}", err);
            std::process::exit(1);
        }
    }
}

fn extract_entry(reader: &BcfReader, entry: &str, output: &Path) {
    let result = reader
        .container()
        .entry(entry)
        .and_then(|file| file.read_all());
    match result {
        Ok(data) => {
            if let Err(err) = std::fs::write(output, &data) {
                eprintln!("Error: {}", err);
                std::process::exit(1);
            }
            info!("wrote {} bytes to {}", data.len(), output.display());
        }
        Err(err) => {
            eprintln!("Error: {}", err);
            std::process::exit(1);
        }
    }
}

fn print_map_summary(file_path: &str, options: &LoadOptions) {
    let records = match bcf_io::load(file_path, options) {
        Ok(records) => records,
        Err(err) => {
            eprintln!("Error: {}", err);
            std::process::exit(1);
        }
    };
    for record in records {
        let RecordData::Hypermap(map) = &record.data else {
            continue;
        };
        print_one_map(map);
        for axis in &record.axes {
            println!(
                "  axis {:>7}: {} steps of {} {}",
                axis.name, axis.size, axis.scale, axis.units
            );
        }
    }
}

fn print_one_map(map: &Hypermap) {
    let dtype = match map.dtype {
        Dtype::U8 => "u8",
        Dtype::U16 => "u16",
        Dtype::U32 => "u32",
        Dtype::U64 => "u64",
        Dtype::I8 => "i8",
        Dtype::I16 => "i16",
        Dtype::I32 => "i32",
        Dtype::I64 => "i64",
    };
    let (h, w, c) = map.shape();
    let cells = match &map.data {
        HypermapData::U8(d) => d.len(),
        HypermapData::U16(d) => d.len(),
        HypermapData::U32(d) => d.len(),
        HypermapData::U64(d) => d.len(),
    };
    println!("Hypermap {h}x{w}x{c} ({dtype}, {cells} cells)");
    println!("  Total counts: {}", map.total());
}

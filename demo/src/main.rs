//! A headless runner for the core: loads a ROM, runs it for a fixed number
//! of frames and dumps the final frame as a PPM image. No window, no audio;
//! see `dotmatrix::env::Peripherals` for the seam a real host would use
//! instead.

use std::{env, fs, io, process};

use log::{Log, Record, Metadata};

use dotmatrix::{
    BootRom, Config, Emulator, Disruption,
    cartridge::Cartridge,
    env::{Peripherals, RasterBuffer},
    error::EmulatorError,
    log::*,
};


fn main() {
    if let Err(e) = run() {
        eprintln!("ERROR: {}", e);
        process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args = Args::from_env()?;
    init_logger(args.debug_trace);

    let rom = fs::read(&args.rom_path)
        .map_err(|e| format!("failed to read {}: {}", args.rom_path, e))?;
    let cartridge = Cartridge::from_bytes(&rom);
    info!("loaded cartridge: {:?}", cartridge);

    let config = Config {
        boot_rom: if args.skip_boot_logo { BootRom::Minimal } else { BootRom::Original },
        debug_trace: args.debug_trace,
    };
    let mut emulator = Emulator::new(cartridge, config);
    let mut sink = FrameSink::new();

    for frame in 0..args.frames {
        match emulator.execute_frame(&mut sink) {
            Ok(()) => {}
            Err(Disruption::Terminated) => {
                return Err(format!("emulation terminated during frame {}", frame));
            }
        }
    }

    sink.write_ppm(&args.out_path)
        .map_err(|e| format!("failed to write {}: {}", args.out_path, e))?;
    info!("wrote {}", args.out_path);

    Ok(())
}


/// Hand-rolled argument parsing: `dotmatrix-demo <rom> [out.ppm] [frames]`.
struct Args {
    rom_path: String,
    out_path: String,
    frames: u32,
    skip_boot_logo: bool,
    debug_trace: bool,
}

impl Args {
    fn from_env() -> Result<Self, String> {
        let mut positional = Vec::new();
        let mut skip_boot_logo = false;
        let mut debug_trace = false;

        for arg in env::args().skip(1) {
            match arg.as_str() {
                "--skip-boot-logo" => skip_boot_logo = true,
                "--trace" => debug_trace = true,
                _ => positional.push(arg),
            }
        }

        let rom_path = positional.get(0).cloned().ok_or_else(|| {
            "usage: dotmatrix-demo <rom> [out.ppm] [frames] [--skip-boot-logo] [--trace]"
                .to_string()
        })?;
        let out_path = positional.get(1).cloned().unwrap_or_else(|| "frame.ppm".to_string());
        let frames = match positional.get(2) {
            Some(s) => s.parse().map_err(|_| format!("not a number: {}", s))?,
            None => 60,
        };

        Ok(Self { rom_path, out_path, frames, skip_boot_logo, debug_trace })
    }
}


/// Keeps only the most recently presented frame around.
struct FrameSink {
    last_frame: Box<RasterBuffer>,
}

impl FrameSink {
    fn new() -> Self {
        Self { last_frame: Box::new([0; dotmatrix::SCREEN_WIDTH * dotmatrix::SCREEN_HEIGHT * 4]) }
    }

    fn write_ppm(&self, path: &str) -> io::Result<()> {
        use io::Write;

        let mut out = io::BufWriter::new(fs::File::create(path)?);
        writeln!(out, "P6\n{} {}\n255", dotmatrix::SCREEN_WIDTH, dotmatrix::SCREEN_HEIGHT)?;
        for px in self.last_frame.chunks_exact(4) {
            out.write_all(&px[..3])?; // drop alpha, PPM has no channel for it
        }
        Ok(())
    }
}

impl Peripherals for FrameSink {
    fn present(&mut self, frame: &RasterBuffer) {
        self.last_frame.copy_from_slice(frame);
    }

    fn on_fatal(&mut self, err: EmulatorError) {
        error!("fatal: {}", err);
    }
}


fn init_logger(debug_trace: bool) {
    log::set_logger(&SimpleLogger)
        .expect("called init_logger(), but a logger is already set!");
    let level = if debug_trace { log::LevelFilter::Trace } else { log::LevelFilter::Info };
    log::set_max_level(level);
}

/// Prints everything the core logs to the terminal. Filters out log records
/// from other crates so third-party dependency chatter doesn't show up.
struct SimpleLogger;

impl Log for SimpleLogger {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if record.module_path().map(|p| p.starts_with("dotmatrix")).unwrap_or(false) {
            if self.enabled(record.metadata()) {
                println!("{:5}: {}", record.level(), record.args());
            }
        }
    }

    fn flush(&self) {}
}

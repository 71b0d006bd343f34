//! Demo driver: builds a two-adapter software topology, runs a fixed number
//! of frames and periodically logs the overlay stats. With `--switch` the
//! run migrates the simulation onto the render adapter a third of the way
//! through (async-compute mode) and back again, exercising the topology
//! change paths.

use clap::{App, Arg};
use log::info;

use xgpu_particles::extension::INTEL_VENDOR_ID;
use xgpu_particles::gpu::{AdapterDesc, Factory, SurfaceDesc};
use xgpu_particles::{Config, Particles};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("particles")
        .about("cross-adapter n-body particle simulation demo")
        .arg(
            Arg::with_name("numparticles")
                .long("numparticles")
                .takes_value(true)
                .default_value("1024")
                .help("particle count (buffer capacity)"),
        )
        .arg(
            Arg::with_name("frames")
                .long("frames")
                .takes_value(true)
                .default_value("120")
                .help("number of frames to run"),
        )
        .arg(
            Arg::with_name("numsim")
                .long("numsim")
                .takes_value(true)
                .help("simulate only this many particles (unlinks counts)"),
        )
        .arg(
            Arg::with_name("numcopy")
                .long("numcopy")
                .takes_value(true)
                .help("copy only this many particles (unlinks counts)"),
        )
        .arg(
            Arg::with_name("numdraw")
                .long("numdraw")
                .takes_value(true)
                .help("draw only this many particles (unlinks counts)"),
        )
        .arg(
            Arg::with_name("seed")
                .long("seed")
                .takes_value(true)
                .default_value("0")
                .help("initial-condition seed"),
        )
        .arg(Arg::with_name("novsync").long("novsync").help("present unthrottled"))
        .arg(Arg::with_name("fullscreen").long("fullscreen"))
        .arg(
            Arg::with_name("noext")
                .long("noext")
                .help("do not use the vendor command queue extension"),
        )
        .arg(Arg::with_name("nooverlay").long("nooverlay"))
        .arg(
            Arg::with_name("switch")
                .long("switch")
                .help("migrate the simulation between adapters mid-run"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("-v for debug logging, -vv for trace"),
        )
        .get_matches();

    let level = match matches.occurrences_of("verbose") {
        0 => log::Level::Info,
        1 => log::Level::Debug,
        _ => log::Level::Trace,
    };
    simple_logger::init_with_level(level)?;

    let num_particles: u32 =
        matches.value_of("numparticles").unwrap_or("1024").parse()?;
    let frames: u32 = matches.value_of("frames").unwrap_or("120").parse()?;
    let unlinked = matches.is_present("numsim")
        || matches.is_present("numcopy")
        || matches.is_present("numdraw");
    let parse_count = |name: &str| -> Result<u32, std::num::ParseIntError> {
        matches.value_of(name).unwrap_or("").parse()
    };

    let config = Config {
        max_particles: num_particles,
        num_rendered: if matches.is_present("numdraw") {
            parse_count("numdraw")?
        } else {
            num_particles
        },
        num_copied: if matches.is_present("numcopy") {
            parse_count("numcopy")?
        } else {
            num_particles
        },
        num_simulated: if matches.is_present("numsim") {
            parse_count("numsim")?
        } else {
            num_particles
        },
        linked_counts: !unlinked,
        vsync: !matches.is_present("novsync"),
        full_screen: matches.is_present("fullscreen"),
        enable_extension: !matches.is_present("noext"),
        enable_overlay: !matches.is_present("nooverlay"),
        seed: matches.value_of("seed").unwrap_or("0").parse()?,
        ..Config::default()
    };

    let factory = Factory::new(vec![
        AdapterDesc {
            description: "Software Discrete GPU".to_string(),
            vendor_id: 0x10de,
            is_software: false,
            is_uma: false,
            supports_queue_extension: false,
        },
        AdapterDesc {
            description: "Software Integrated GPU".to_string(),
            vendor_id: INTEL_VENDOR_ID,
            is_software: false,
            is_uma: true,
            supports_queue_extension: true,
        },
    ]);
    let surface = SurfaceDesc {
        width: 1280,
        height: 720,
        allow_tearing: true,
    };

    let mut particles = Particles::new(&factory, surface, &config)?;
    let home_compute_index = particles.compute_adapter_index();
    let render_index = particles.render_adapter_index();
    let switch_mid_run = matches.is_present("switch");

    for frame in 0..frames {
        let mut overlay = |stats: &xgpu_particles::FrameStats| {
            if frame % 30 == 0 {
                let gpu: Vec<String> = stats
                    .gpu_times
                    .iter()
                    .map(|(seconds, name)| {
                        format!("{} {:.3}", name, seconds * 1000.0)
                    })
                    .collect();
                info!(
                    "frame {:4}: {:6.2} ms host, {}, async {}",
                    frame,
                    stats.frame_time * 1000.0,
                    gpu.join(", "),
                    stats.async_mode,
                );
            }
        };
        particles.draw(Some(&mut overlay))?;

        if switch_mid_run && frame == frames / 3 {
            info!("switching simulation onto the render adapter");
            particles.set_compute_adapter_index(render_index);
        }
        if switch_mid_run && frame == 2 * frames / 3 {
            info!("switching simulation back to its home adapter");
            particles.set_compute_adapter_index(home_compute_index);
        }
    }
    info!("ran {} frames, exiting", frames);
    Ok(())
}

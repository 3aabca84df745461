#[allow(dead_code)]
mod channels;
#[allow(dead_code)]
mod commands;
mod engine;
#[allow(dead_code)]
mod frontend;
#[allow(dead_code)]
mod hp41;
mod hpil;
mod pilbox;
mod printer;
mod rom;
mod settings;
#[allow(dead_code)]
mod store;
mod tasks;
mod tracer;
mod xmem;

use std::time::Duration;

use channels::MemChannel;
use engine::{engine_channels, Engine};
use frontend::{BusFrontend, SimFrontend};
use hpil::IlMirror;
use rom::PageMap;
use settings::Settings;
use store::{MemImageStore, MemNvRam, NvRam, NVRAM_INIT_ADDR, NVRAM_INIT_MAGIC};
use tasks::{CoreChannels, CoreZero};
use tracer::TracerConfig;

// ─────────────────────────────────────────────────────────────────────────────
//  Entry point
// ─────────────────────────────────────────────────────────────────────────────

// Host build: the bus frontend is the in-process simulator and the five
// byte channels are memory-backed.  A firmware target supplies the PIO
// frontend and the CDC transports behind the same seams.

fn main() {
    env_logger::init();

    let mut nv = MemNvRam::new();
    let images = MemImageStore::new();

    // first boot of a blank NvRam: install defaults behind the magic
    let mut settings = Settings::new();
    settings.retrieve(&nv);
    if !settings.is_initialised() {
        log::info!("blank settings store, installing defaults");
        settings.set_default(&mut nv);
        nv.write_u16(NVRAM_INIT_ADDR, NVRAM_INIT_MAGIC);
    }

    let mut pages = PageMap::new();
    if nv.read_u16(NVRAM_INIT_ADDR) == NVRAM_INIT_MAGIC {
        pages.restore(&nv, &images);
    }

    let console = MemChannel::new(true);
    let tracer_chan = MemChannel::new(true);
    let hpil_wire = MemChannel::new(false);
    let il_scope = MemChannel::new(false);
    let printer_chan = MemChannel::new(false);

    let trace_cap = settings.get(settings::TRACER_MAINBUFFER).max(100) as usize;
    let tracer_config = TracerConfig::from_settings(&settings);
    let (queues, links) = engine_channels(trace_cap, 84);
    let mirror = IlMirror::new();

    let front = SimFrontend::new();
    let pins = front.pins();

    let engine = Engine::new(
        front,
        settings,
        pages,
        Box::new(nv.clone()),
        Box::new(images),
        Box::new(console.clone()),
        mirror.clone(),
        queues,
    );
    // the engine owns its thread for the rest of the process lifetime
    let _engine_thread = engine.spawn();

    let mut core = CoreZero::new(
        links,
        pins,
        mirror,
        tracer_config,
        CoreChannels {
            console: Box::new(console.clone()),
            tracer: Box::new(tracer_chan.clone()),
            hpil_wire: Box::new(hpil_wire.clone()),
            il_scope: Box::new(il_scope.clone()),
            printer: Box::new(printer_chan.clone()),
        },
    );

    log::info!("TULIP4041 core v{} up", env!("CARGO_PKG_VERSION"));
    loop {
        core.run_once();

        // the host harness surfaces the console on stdout
        let out = console.take_output_string();
        if !out.is_empty() {
            print!("{out}");
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

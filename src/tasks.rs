// Core-0 service loop.  Runs on the main thread, communicates with the
// cycle engine via the channels built in `engine_channels`.  Every task
// does a small bounded amount of work and returns, so the round-robin
// stays responsive.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::channels::ByteChannel;
use crate::commands::Command;
use crate::engine::{CoreLinks, EngineCmd};
use crate::frontend::PowerPins;
use crate::hp41::{PowerMode, IL_FRAME_IDY_C0, IL_FRAME_RFC};
use crate::hpil::IlMirror;
use crate::pilbox::{Pilbox, PilboxMode};
use crate::settings;
use crate::tracer::disasm::il_mnemonic;
use crate::tracer::{TraceDrain, TracerConfig};

const AUTO_IDY_PERIOD: Duration = Duration::from_millis(10);

/// Printer characters forwarded per task call.
const PRINT_BATCH: usize = 8;

/// The byte channels the service loop writes to.
pub struct CoreChannels {
    pub console: Box<dyn ByteChannel>,
    pub tracer: Box<dyn ByteChannel>,
    pub hpil_wire: Box<dyn ByteChannel>,
    pub il_scope: Box<dyn ByteChannel>,
    pub printer: Box<dyn ByteChannel>,
}

pub struct CoreZero {
    links: CoreLinks,
    pins: PowerPins,
    mirror: Arc<IlMirror>,
    chans: CoreChannels,
    pub pilbox: Pilbox,
    pub drain: TraceDrain,
    reboot_hook: Option<Box<dyn FnMut() + Send>>,

    power_mode: PowerMode,
    mode_since: Instant,
    idy_timer: Instant,
    /// Last CMD frame seen from the loop, for the RFC handshake.
    last_cmd: u16,
    scope_enabled: bool,
    pilbox_mode_seen: PilboxMode,
    tracer_connected: bool,
    hpil_connected: bool,
    printer_connected: bool,
}

impl CoreZero {
    pub fn new(
        links: CoreLinks,
        pins: PowerPins,
        mirror: Arc<IlMirror>,
        config: TracerConfig,
        chans: CoreChannels,
    ) -> Self {
        Self {
            links,
            pins,
            mirror,
            chans,
            pilbox: Pilbox::new(),
            drain: TraceDrain::new(config),
            reboot_hook: None,
            power_mode: PowerMode::DeepSleep,
            mode_since: Instant::now(),
            idy_timer: Instant::now(),
            last_cmd: 0,
            scope_enabled: true,
            pilbox_mode_seen: PilboxMode::Tdis,
            tracer_connected: false,
            hpil_connected: false,
            printer_connected: false,
        }
    }

    /// Install the reboot-to-bootloader action.
    pub fn set_reboot_hook(&mut self, hook: Box<dyn FnMut() + Send>) {
        self.reboot_hook = Some(hook);
    }

    /// One round of the cooperative loop.
    pub fn run_once(&mut self) {
        self.power_mode_task();
        self.trace_task();
        self.print_task();
        self.hpil_task();
    }

    // ── Power mode ────────────────────────────────────────────

    fn power_mode_task(&mut self) {
        let mode = PowerMode::from_pins(self.pins.pwo(), self.pins.sync());
        if mode != self.power_mode {
            let elapsed = self.mode_since.elapsed();
            self.console(&format!(
                "** HP41 Powermode: {:7} - previous mode {:7} held {}.{:03} secs",
                mode.label(),
                self.power_mode.label(),
                elapsed.as_secs(),
                elapsed.subsec_millis()
            ));
            log::info!("power mode {} -> {}", self.power_mode.label(), mode.label());
            self.power_mode = mode;
            self.mode_since = Instant::now();
        }
    }

    pub fn power_mode(&self) -> PowerMode {
        self.power_mode
    }

    // ── Tracer drain ──────────────────────────────────────────

    fn trace_task(&mut self) {
        if self.chans.tracer.connected() {
            if !self.tracer_connected {
                self.tracer_connected = true;
                self.console("  CDC Port 2 [tracer] connected");
                self.drain.config.enabled = true;
                self.chans.tracer.write_str("TRACER PORT connected, trace is enabled\n\r");
            } else if self.chans.tracer.read_byte().is_some() {
                // any keystroke on the tracer port pauses / resumes it
                self.drain.config.enabled = !self.drain.config.enabled;
                let state = if self.drain.config.enabled { "enabled" } else { "disabled" };
                self.chans.tracer.write_str(&format!("Trace is {state}\n\r"));
            }
        } else if self.tracer_connected {
            self.tracer_connected = false;
            self.drain.config.enabled = false;
            self.console("  CDC Port 2 [tracer] disconnected");
        }
        self.drain.run(&self.links.trace, self.chans.tracer.as_mut());
    }

    // ── Printer drain ─────────────────────────────────────────

    fn print_task(&mut self) {
        if self.chans.printer.connected() && !self.printer_connected {
            self.printer_connected = true;
            self.console("  CDC Port 5 [printer] connected");
        } else if !self.chans.printer.connected() && self.printer_connected {
            self.printer_connected = false;
            self.console("  CDC Port 5 [printer] disconnected");
        }

        for _ in 0..PRINT_BATCH {
            let Ok(byte) = self.links.print_rx.try_recv() else {
                break;
            };
            if self.chans.printer.connected() {
                self.chans.printer.write(&[byte]);
            }
        }
        self.chans.printer.flush();
    }

    // ── HP-IL pump ────────────────────────────────────────────

    fn hpil_task(&mut self) {
        if self.chans.hpil_wire.connected() && !self.hpil_connected {
            self.hpil_connected = true;
            self.console("  CDC Port 3 [HPIL] connected");
            if self.pilbox.mode == PilboxMode::Tdis {
                self.console("  WARNING: no virtual HP-IL device connected, HP-IL loop may be open");
            }
        } else if !self.chans.hpil_wire.connected() && self.hpil_connected {
            self.hpil_connected = false;
            self.console("  CDC Port 3 [HPIL] disconnected");
        }

        // frames the engine wants on the loop
        while let Ok(frame) = self.links.il_out_rx.try_recv() {
            self.send_frame(frame);
        }

        // frames arriving from the loop
        while let Some(frame) = self.pilbox.recv_frame(self.chans.hpil_wire.as_mut()) {
            self.receive_frame(frame);
        }

        if self.pilbox.mode != self.pilbox_mode_seen {
            self.pilbox_mode_seen = self.pilbox.mode;
            let text = match self.pilbox.mode {
                PilboxMode::Tdis => "TDIS / disconnected - HP-IL loop may be open!",
                PilboxMode::Con => "CON  / Controller ON - HP-IL loop is closed",
                PilboxMode::Coff => "COFF / Controller OFF - HP-IL loop is closed",
                PilboxMode::Cofi => "COFI / Controller OFF with IDY - HP-IL loop is closed",
            };
            self.console(&format!("  PILBox mode changed to {text}"));
        }

        // light sleep with AutoIDY armed: poll the loop every 10 ms
        if self.power_mode == PowerMode::LightSleep
            && self.mirror.auto_idy_enabled()
            && self.mirror.controller_active()
            && self.idy_timer.elapsed() >= AUTO_IDY_PERIOD
        {
            self.idy_timer = Instant::now();
            self.send_frame(IL_FRAME_IDY_C0);
        }
    }

    fn send_frame(&mut self, frame: u16) {
        self.scope(frame, true);
        self.pilbox.send_frame(self.chans.hpil_wire.as_mut(), frame);
    }

    /// Frame received from the loop: run the controller-side CMD/RFC
    /// handshake, then hand it to the engine.
    fn receive_frame(&mut self, mut frame: u16) {
        self.scope(frame, false);
        if self.mirror.controller_active() {
            if frame & 0x700 == 0x400 {
                // a CMD echo: answer RFC, keep the CMD for later
                self.last_cmd = frame;
                self.send_frame(IL_FRAME_RFC);
                return;
            }
            if frame == IL_FRAME_RFC {
                // the RFC completes the handshake for the held CMD
                frame = self.last_cmd;
            }
        }
        // non-blocking: a stuck engine must not stall the loop
        let _ = self.links.il_in_tx.try_send(frame);
    }

    fn scope(&mut self, frame: u16, out: bool) {
        if self.scope_enabled && self.chans.il_scope.connected() {
            let dir = if out { '>' } else { '<' };
            self.chans
                .il_scope
                .write_str(&format!(" {dir} {frame:03X} {}\n\r", il_mnemonic(frame)));
        }
    }

    pub fn set_scope_enabled(&mut self, on: bool) {
        self.scope_enabled = on;
    }

    fn console(&mut self, line: &str) {
        self.chans.console.write_str(line);
        self.chans.console.write_str("\r\n");
    }

    // ── Command surface ───────────────────────────────────────

    /// Route a high-level command.  Engine-owned state goes through the
    /// command queue; tracer filters apply right here.
    pub fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Reset => self.send_engine(EngineCmd::Wake),
            Command::RebootBootloader => {
                if let Some(hook) = self.reboot_hook.as_mut() {
                    hook();
                } else {
                    self.console("  no bootloader hook installed");
                }
            }
            Command::Plug { page, bank, offset } => {
                self.send_engine(EngineCmd::Plug { page, bank, offset })
            }
            Command::Unplug { page, bank } => self.send_engine(EngineCmd::Unplug { page, bank }),
            Command::Reserve { page } => self.send_engine(EngineCmd::Reserve { page }),
            Command::SetSticky { page, sticky } => {
                self.send_engine(EngineCmd::SetSticky { page, sticky })
            }
            Command::PrinterPower(on) => self.send_engine(EngineCmd::PrinterPower(on)),
            Command::PrinterMode(mode) => self.send_engine(EngineCmd::PrinterMode(mode)),
            Command::PrinterKeyPrint => self.send_engine(EngineCmd::PrinterKeyPrint),
            Command::PrinterKeyAdv => self.send_engine(EngineCmd::PrinterKeyAdv),
            Command::PrinterTogglePaper => self.send_engine(EngineCmd::PrinterTogglePaper),
            Command::HpilPlug(on) => self.send_engine(EngineCmd::HpilPlug(on)),
            Command::SetXmem(n) => self.send_engine(EngineCmd::SetXmem(n)),
            Command::TracerEnable(on) => {
                self.drain.config.enabled = on;
                self.send_engine(EngineCmd::SetSetting(settings::TRACER_ENABLED, on as u16));
            }
            Command::TracerFilter {
                sysrom,
                ilroms,
                sysloop,
            } => {
                self.drain.config.sysrom_on = sysrom;
                self.drain.config.ilroms_on = ilroms;
                self.drain.config.sysloop_on = sysloop;
                self.send_engine(EngineCmd::SetSetting(settings::TRACER_SYSROM_ON, sysrom as u16));
                self.send_engine(EngineCmd::SetSetting(settings::TRACER_ILROMS_ON, ilroms as u16));
                self.send_engine(EngineCmd::SetSetting(
                    settings::TRACER_SYSLOOP_ON,
                    sysloop as u16,
                ));
            }
            Command::SaveState => self.send_engine(EngineCmd::SaveState),
        }
    }

    fn send_engine(&mut self, cmd: EngineCmd) {
        if self.links.cmd_tx.try_send(cmd).is_err() {
            self.console("  engine busy, command dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::MemChannel;
    use crate::engine::engine_channels;
    use crate::pilbox::encode8;

    struct Rig {
        core: CoreZero,
        engine_q: crate::engine::EngineQueues,
        pins: PowerPins,
        mirror: Arc<IlMirror>,
        console: MemChannel,
        wire: MemChannel,
        scope: MemChannel,
        printer: MemChannel,
    }

    fn rig(wire_connected: bool) -> Rig {
        let (engine_q, links) = engine_channels(100, 8);
        let pins = PowerPins::new();
        let mirror = IlMirror::new();
        let console = MemChannel::new(true);
        let wire = MemChannel::new(wire_connected);
        let scope = MemChannel::new(false);
        let printer = MemChannel::new(true);
        let chans = CoreChannels {
            console: Box::new(console.clone()),
            tracer: Box::new(MemChannel::new(false)),
            hpil_wire: Box::new(wire.clone()),
            il_scope: Box::new(scope.clone()),
            printer: Box::new(printer.clone()),
        };
        let config = TracerConfig {
            enabled: true,
            dis_enabled: true,
            ilregs_on: false,
            fi_on: false,
            sysrom_on: true,
            ilroms_on: true,
            sysloop_on: true,
            pretrig: 8,
        };
        let core = CoreZero::new(links, pins.clone(), mirror.clone(), config, chans);
        Rig {
            core,
            engine_q,
            pins,
            mirror,
            console,
            wire,
            scope,
            printer,
        }
    }

    #[test]
    fn test_tdis_loopback_roundtrip() {
        // frame from the engine comes straight back on the inbound queue
        let mut r = rig(false);
        r.engine_q.il_out_tx.send(0x042).unwrap();
        r.core.run_once();
        assert_eq!(r.engine_q.il_in_rx.try_recv(), Ok(0x042));
    }

    #[test]
    fn test_cmd_rfc_handshake() {
        let mut r = rig(true);
        r.mirror.publish(crate::hpil::R0_CA, 0);
        // peer switches the tunnel out of TDIS first
        let (hi, lo) = encode8(crate::pilbox::FRAME_CON);
        r.wire.feed_input(&[hi, lo]);
        r.core.run_once();
        r.wire.take_output();

        // a CMD frame from the loop is answered with RFC, not forwarded
        let (hi, lo) = encode8(0x43F);
        r.wire.feed_input(&[hi, lo]);
        r.core.run_once();
        assert!(r.engine_q.il_in_rx.try_recv().is_err(), "CMD held back");
        let out = r.wire.take_output();
        assert_eq!(out.len(), 2);
        assert_eq!(crate::pilbox::decode8(out[0], out[1]), IL_FRAME_RFC);

        // the returning RFC is replaced by the held CMD
        let (hi, lo) = encode8(IL_FRAME_RFC);
        r.wire.feed_input(&[hi, lo]);
        r.core.run_once();
        assert_eq!(r.engine_q.il_in_rx.try_recv(), Ok(0x43F));
    }

    #[test]
    fn test_auto_idy_in_light_sleep() {
        let mut r = rig(false);
        r.pins.set_pwo(false);
        r.pins.set_sync(true); // light sleep
        r.mirror
            .publish(crate::hpil::R0_CA, crate::hpil::R3_AUTO_IDY);
        std::thread::sleep(Duration::from_millis(12));
        r.core.run_once(); // IDY goes out into the loopback
        r.core.run_once(); // and comes back in
        assert_eq!(r.engine_q.il_in_rx.try_recv(), Ok(IL_FRAME_IDY_C0));

        // not again within the 10 ms window
        r.core.run_once();
        r.core.run_once();
        assert!(r.engine_q.il_in_rx.try_recv().is_err());
    }

    #[test]
    fn test_print_drain_forwards_bytes() {
        let mut r = rig(false);
        r.engine_q.print_tx.send(0x41).unwrap();
        r.engine_q.print_tx.send(0xE0).unwrap();
        r.core.run_once();
        assert_eq!(r.printer.take_output(), vec![0x41, 0xE0]);
    }

    #[test]
    fn test_power_mode_reporting() {
        let mut r = rig(false);
        r.core.run_once();
        r.console.take_output();
        r.pins.set_pwo(true);
        r.core.run_once();
        let out = r.console.take_output_string();
        assert!(out.contains("RUNNING"), "{out}");
        assert_eq!(r.core.power_mode(), PowerMode::Running);
    }

    #[test]
    fn test_scope_line() {
        let mut r = rig(false);
        r.scope.set_connected(true);
        r.engine_q.il_out_tx.send(0x490).unwrap();
        r.core.run_once();
        let out = r.scope.take_output_string();
        assert!(out.contains("> 490 IFC"), "{out}");
    }

    #[test]
    fn test_command_routing() {
        let mut r = rig(false);
        r.core.handle_command(Command::PrinterKeyAdv);
        match r.engine_q.cmd_rx.try_recv() {
            Ok(EngineCmd::PrinterKeyAdv) => {}
            other => panic!("unexpected: {other:?}"),
        }

        r.core.handle_command(Command::TracerFilter {
            sysrom: false,
            ilroms: true,
            sysloop: false,
        });
        assert!(!r.core.drain.config.sysrom_on);
        assert!(!r.core.drain.config.sysloop_on);
        assert!(r.core.drain.config.ilroms_on);
    }

    #[test]
    fn test_reboot_hook() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let mut r = rig(false);
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        r.core
            .set_reboot_hook(Box::new(move || flag.store(true, Ordering::Relaxed)));
        r.core.handle_command(Command::RebootBootloader);
        assert!(fired.load(Ordering::Relaxed));
    }
}

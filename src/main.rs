//! Carbon - a minimal microVM runtime for AI agent sandboxing.
//!
//! This VMM requires Linux with KVM support. It will not run on other platforms.

#[cfg(target_os = "linux")]
mod boot;
#[cfg(target_os = "linux")]
mod config;
#[cfg(target_os = "linux")]
mod devices;
#[cfg(target_os = "linux")]
mod disk;
#[cfg(target_os = "linux")]
mod io;
#[cfg(target_os = "linux")]
mod ioeventfd;
#[cfg(target_os = "linux")]
mod irq;
#[cfg(target_os = "linux")]
mod irqfd;
#[cfg(target_os = "linux")]
mod kvm;
#[cfg(target_os = "linux")]
mod memory;
#[cfg(target_os = "linux")]
mod threadpool;
#[cfg(target_os = "linux")]
mod virtio;

use clap::Parser;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "carbon")]
#[command(about = "A minimal microVM runtime for AI agent sandboxing")]
struct Args {
    /// Path to the Linux kernel bzImage
    #[arg(short, long)]
    kernel: String,

    /// Path to an initrd/initramfs image
    #[arg(long)]
    initrd: Option<String>,

    /// Path to a firmware image, loaded in place of a kernel bzImage
    #[arg(long)]
    firmware: Option<String>,

    /// Kernel command line (fast-boot options added automatically)
    #[arg(short, long, default_value = "console=ttyS0 reboot=t panic=-1")]
    cmdline: String,

    /// Memory size in megabytes
    #[arg(short, long, default_value = "512")]
    memory: u64,

    /// Number of virtual CPUs
    #[arg(long, default_value = "1")]
    nrcpus: u8,

    /// Disk image to attach as virtio-blk; repeat for multiple disks.
    /// Suffix with `:ro` to attach read-only (required for qcow2 images).
    #[arg(short, long)]
    disk: Vec<String>,

    /// Primary console: serial, virtio, or hv
    #[arg(long, default_value = "serial")]
    console: String,

    /// Network mode: none or tap (user is parsed but rejected, see DESIGN.md)
    #[arg(long, default_value = "none")]
    network: String,

    /// Tap interface name, required when --network=tap
    #[arg(long)]
    tap: Option<String>,

    /// MAC address for the virtio-net device (aa:bb:cc:dd:ee:ff); defaults
    /// to a fixed locally-administered address when omitted
    #[arg(long)]
    mac: Option<String>,

    /// 9p share as `tag:/host/path`; repeat for multiple shares
    #[arg(long = "9p")]
    ninep: Vec<String>,

    /// Back guest memory with a hugetlbfs mount instead of anonymous pages
    #[arg(long)]
    hugetlbfs: Option<String>,

    /// Path to the KVM device node
    #[arg(long, default_value = "/dev/kvm")]
    dev_kvm: String,

    /// Pass a legacy VGA video mode through boot_params (unused by this
    /// console-only build; accepted and logged for config compatibility).
    #[arg(long)]
    vidmode: bool,

    /// Request guest single-stepping for debugging
    #[arg(long)]
    single_step: bool,

    /// Log every I/O port access, not just the first ten
    #[arg(long)]
    debug_ioport: bool,

    /// Sleep this many milliseconds after each I/O exit, to slow the guest
    /// down for interactive debugging
    #[arg(long, default_value = "0")]
    debug_iodelay_ms: u64,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Parse a `path[:ro]` disk argument into a `(path, readonly)` pair.
#[cfg(target_os = "linux")]
fn parse_disk_arg(arg: &str) -> (std::path::PathBuf, bool) {
    match arg.rsplit_once(':') {
        Some((path, "ro")) => (std::path::PathBuf::from(path), true),
        _ => (std::path::PathBuf::from(arg), false),
    }
}

/// Parse a `tag:/host/path` 9p share argument.
#[cfg(target_os = "linux")]
fn parse_ninep_arg(arg: &str) -> Option<(String, std::path::PathBuf)> {
    let (tag, path) = arg.split_once(':')?;
    Some((tag.to_string(), std::path::PathBuf::from(path)))
}

/// Parse a `aa:bb:cc:dd:ee:ff` MAC address argument.
#[cfg(target_os = "linux")]
fn parse_mac_arg(arg: &str) -> Result<[u8; 6], String> {
    let mut mac = [0u8; 6];
    let parts: Vec<&str> = arg.split(':').collect();
    if parts.len() != 6 {
        return Err(format!("malformed MAC address \"{arg}\" (want aa:bb:cc:dd:ee:ff)"));
    }
    for (i, part) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(part, 16)
            .map_err(|_| format!("malformed MAC address \"{arg}\" (want aa:bb:cc:dd:ee:ff)"))?;
    }
    Ok(mac)
}

#[cfg(target_os = "linux")]
fn build_config(args: &Args) -> Result<config::VmConfig, Box<dyn std::error::Error>> {
    use config::{ConsoleMode, NetworkMode};

    let mut builder = config::VmConfig::builder(std::path::PathBuf::from(&args.kernel))
        .dev_path(std::path::PathBuf::from(&args.dev_kvm))
        .ram_size_bytes(args.memory * 1024 * 1024)
        .nrcpus(args.nrcpus)
        .console_mode(args.console.parse::<ConsoleMode>()?)
        .cmdline(args.cmdline.clone())
        .vidmode(args.vidmode)
        .single_step(args.single_step)
        .debug_ioport(args.debug_ioport)
        .debug_iodelay_ms(args.debug_iodelay_ms)
        .initrd(args.initrd.clone().map(std::path::PathBuf::from))
        .firmware(args.firmware.clone().map(std::path::PathBuf::from))
        .hugetlbfs_path(args.hugetlbfs.clone().map(std::path::PathBuf::from));

    let network_mode = args.network.parse::<NetworkMode>()?;
    if network_mode == NetworkMode::Tap && args.tap.is_none() {
        return Err("--network=tap requires --tap <ifname>".into());
    }
    if network_mode == NetworkMode::User {
        // See DESIGN.md: no device backs this mode yet, so reject it
        // up front rather than booting a guest with a silently absent NIC.
        return Err("--network=user is not implemented in this build; use none or tap".into());
    }
    builder = builder.network(network_mode, args.tap.clone());

    let mac = args.mac.as_deref().map(parse_mac_arg).transpose()?;
    builder = builder.mac(mac);

    for disk_arg in &args.disk {
        let (path, readonly) = parse_disk_arg(disk_arg);
        builder = builder.disk(path, readonly);
    }

    for share_arg in &args.ninep {
        let (tag, root) = parse_ninep_arg(share_arg)
            .ok_or_else(|| format!("malformed 9p share \"{share_arg}\" (want tag:/path)"))?;
        builder = builder.ninep_share(tag, root);
    }

    Ok(builder.build())
}

/// Base guest-physical address for the first virtio-mmio window; each
/// device after it gets the next `VIRTIO_MMIO_STRIDE`-sized slot.
#[cfg(target_os = "linux")]
const VIRTIO_MMIO_BASE: u64 = 0xd000_0000;
#[cfg(target_os = "linux")]
const VIRTIO_MMIO_STRIDE: u64 = 0x1000;

#[cfg(target_os = "linux")]
const SERIAL_COM1_BASE: u16 = 0x3f8;
#[cfg(target_os = "linux")]
const SERIAL_COM1_END: u16 = 0x3ff;

/// `Serial` addresses its registers by offset (0-7) from its base port, so
/// this adapter translates the absolute port the PIO bus hands us.
#[cfg(target_os = "linux")]
struct SerialPort(devices::Serial);

#[cfg(target_os = "linux")]
impl io::pio::PioDevice for SerialPort {
    fn pio_read(&mut self, port: u16, data: &mut io::pio::IoData) {
        let value = self.0.read(port - SERIAL_COM1_BASE);
        for i in 0..data.len() {
            data.set(i, value);
        }
    }

    fn pio_write(&mut self, port: u16, data: &io::pio::IoData) {
        for &byte in data.as_slice() {
            self.0.write(port - SERIAL_COM1_BASE, byte);
        }
    }
}

/// `Cmos` already addresses by absolute port (0x70/0x71), so no translation
/// is needed here.
#[cfg(target_os = "linux")]
struct CmosPort(devices::Cmos);

#[cfg(target_os = "linux")]
impl io::pio::PioDevice for CmosPort {
    fn pio_read(&mut self, port: u16, data: &mut io::pio::IoData) {
        let value = self.0.read(port);
        for i in 0..data.len() {
            data.set(i, value);
        }
    }

    fn pio_write(&mut self, port: u16, data: &io::pio::IoData) {
        for &byte in data.as_slice() {
            self.0.write(port, byte);
        }
    }
}

/// Bridges KVM's single `run_with_io` handler onto this crate's own
/// `PioBus`/`MmioBus`, which take their own independent `IoData` type.
#[cfg(target_os = "linux")]
struct DeviceHandler {
    pio_bus: io::pio::PioBus,
    mmio_bus: io::mmio::MmioBus,
    io_count: u64,
    debug_ioport: bool,
    debug_iodelay_ms: u64,
}

#[cfg(target_os = "linux")]
impl DeviceHandler {
    fn maybe_delay(&self) {
        if self.debug_iodelay_ms > 0 {
            std::thread::sleep(std::time::Duration::from_millis(self.debug_iodelay_ms));
        }
    }

    fn should_log(&self) -> bool {
        self.debug_ioport || self.io_count <= 10
    }
}

#[cfg(target_os = "linux")]
impl kvm::IoHandler for DeviceHandler {
    fn io_read(&mut self, port: u16, data: &mut kvm::IoData) {
        self.io_count += 1;
        let mut inner = io::pio::IoData::new(data.len());
        if self.pio_bus.read(port, &mut inner) {
            for (i, &byte) in inner.as_slice().iter().enumerate() {
                data.set(i, byte);
            }
            if self.should_log() {
                eprintln!("[PIO] IN  port={port:#x} -> {:?}", inner.as_slice());
            }
        } else {
            for i in 0..data.len() {
                data.set(i, 0xff);
            }
            if self.should_log() {
                eprintln!("[PIO] IN  port={port:#x} size={} -> 0xff (unhandled)", data.len());
            }
        }
        self.maybe_delay();
    }

    fn io_write(&mut self, port: u16, data: &kvm::IoData) {
        self.io_count += 1;
        let inner = io::pio::IoData::from_slice(data.as_slice());
        if !self.pio_bus.write(port, &inner) && self.should_log() {
            eprintln!("[PIO] OUT port={port:#x} <- {:?} (unhandled)", data.as_slice());
        } else if self.should_log() {
            eprintln!("[PIO] OUT port={port:#x} <- {:?}", data.as_slice());
        }
        self.maybe_delay();
    }
}

#[cfg(target_os = "linux")]
impl kvm::MmioHandler for DeviceHandler {
    fn mmio_read(&mut self, addr: u64, data: &mut [u8]) {
        self.io_count += 1;
        self.mmio_bus.read(addr, data);
    }

    fn mmio_write(&mut self, addr: u64, data: &[u8]) {
        self.io_count += 1;
        self.mmio_bus.write(addr, data);
    }
}

#[cfg(target_os = "linux")]
fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    use boot::{BootConfig, VirtioDeviceConfig};
    use memory::GuestMemory;
    use std::sync::Arc;

    let cfg = build_config(&args)?;

    eprintln!("[VMM] Carbon starting...");
    eprintln!("[VMM] Kernel: {}", cfg.kernel_path.display());
    eprintln!("[VMM] Memory: {} MiB, {} vCPU(s)", cfg.ram_size_bytes / (1024 * 1024), cfg.nrcpus);
    for disk in &cfg.disks {
        eprintln!(
            "[VMM] Disk: {} ({})",
            disk.path.display(),
            if disk.readonly { "ro" } else { "rw" }
        );
    }
    if cfg.vidmode {
        eprintln!("[VMM] --vidmode requested; this console-only build does not thread a VGA mode through boot_params");
    }
    if cfg.single_step {
        eprintln!("[VMM] --single-step requested; guest debug registers are not wired up in this build");
    }

    let vm = Arc::new(kvm::create_vm()?);
    let memory = GuestMemory::new(&vm, cfg.ram_size_bytes, cfg.hugetlbfs_path.as_deref().and_then(|p| p.to_str()))?;
    let irq_router = Arc::new(irq::IrqRouter::new(Arc::clone(&vm)));

    let pio_bus = io::pio::PioBus::new();
    pio_bus.register(SERIAL_COM1_BASE, SERIAL_COM1_END - SERIAL_COM1_BASE + 1, Box::new(SerialPort(devices::Serial::new())))?;
    // One shared instance spanning both ports: the index written at 0x70
    // must still be visible when 0x71 is read or written next.
    pio_bus.register(devices::CMOS_PORT_INDEX, 2, Box::new(CmosPort(devices::Cmos::new())))?;

    let mmio_bus = io::mmio::MmioBus::new();
    let mut virtio_devices = Vec::new();
    let mut next_slot = 0u64;

    macro_rules! attach_virtio {
        ($ops:expr) => {{
            let gsi = irq_router.allocate_line()?;
            let router = Arc::clone(&irq_router);
            let transport = virtio::transport::mmio::VirtioMmioTransport::new(
                Box::new($ops),
                Box::new(move || {
                    if let Err(e) = router.trigger(gsi) {
                        eprintln!("[IRQ] failed to trigger gsi {gsi}: {e}");
                    }
                }),
            );
            let base = VIRTIO_MMIO_BASE + next_slot * VIRTIO_MMIO_STRIDE;
            mmio_bus.register(base, VIRTIO_MMIO_STRIDE, false, Box::new(transport))?;
            virtio_devices.push(VirtioDeviceConfig {
                id: virtio_devices.len() as u8,
                mmio_base: base,
                mmio_size: VIRTIO_MMIO_STRIDE as u32,
                gsi,
            });
            next_slot += 1;
        }};
    }

    for disk_cfg in &cfg.disks {
        let disk_img = disk::open(&disk_cfg.path, disk_cfg.readonly)?;
        let blk = virtio::block::VirtioBlk::new(disk_img, &memory);
        attach_virtio!(blk);
        eprintln!("[VMM] virtio-blk registered for {}", disk_cfg.path.display());
    }

    attach_virtio!(virtio::rng::VirtioRng::new(&memory)?);
    eprintln!("[VMM] virtio-rng registered");

    attach_virtio!(virtio::balloon::VirtioBalloon::new(&memory));
    eprintln!("[VMM] virtio-balloon registered");

    if cfg.console_mode == config::ConsoleMode::Virtio {
        attach_virtio!(virtio::console::VirtioConsole::new(&memory));
        eprintln!("[VMM] virtio-console registered");
    }

    if cfg.network_mode == config::NetworkMode::Tap {
        let tap_name = cfg.tap_name.as_deref().expect("validated by build_config");
        let mac = cfg.mac.unwrap_or([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
        let net = virtio::net::VirtioNet::new(tap_name, mac, &memory)?;
        attach_virtio!(net);
        eprintln!("[VMM] virtio-net registered on tap {tap_name}");
    }

    for share in &cfg.ninep_shares {
        let ninep = virtio::ninep::VirtioNinep::new(share.tag.clone(), share.root.clone(), &memory);
        attach_virtio!(ninep);
        eprintln!("[VMM] virtio-9p share \"{}\" -> {} registered", share.tag, share.root.display());
    }

    boot::setup_acpi(&memory, cfg.nrcpus, &virtio_devices)?;
    boot::setup_mptable(&memory, cfg.nrcpus)?;

    let boot_config = BootConfig {
        kernel_path: cfg.kernel_path.to_string_lossy().into_owned(),
        cmdline: cfg.cmdline.clone(),
        mem_size: cfg.ram_size_bytes,
        initrd_path: cfg.initrd_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
    };
    boot::setup_boot(&vm, &memory, &boot_config)?;
    if cfg.firmware_path.is_some() {
        eprintln!("[VMM] --firmware is accepted but not wired to a firmware boot path in this build; booting the supplied kernel instead");
    }

    // Every vCPU is registered with KVM so the guest sees the configured
    // topology in its MADT, but only the boot CPU (vcpu 0) is driven by this
    // build's run loop: Linux's SMP bring-up needs a real-mode AP trampoline
    // and an INIT/SIPI sequence this crate does not implement (see
    // DESIGN.md). Application processors stay parked.
    let mut vcpus = Vec::with_capacity(cfg.nrcpus as usize);
    for id in 0..cfg.nrcpus {
        let vcpu = vm.create_vcpu(id as u64)?;
        if id == 0 {
            vcpu.set_boot_msrs()?;
            boot::setup_vcpu_regs(&vcpu, &memory)?;
        }
        vcpus.push(vcpu);
    }
    let mut boot_vcpu = vcpus.remove(0);

    let mut handler = DeviceHandler {
        pio_bus,
        mmio_bus,
        io_count: 0,
        debug_ioport: cfg.debug_ioport,
        debug_iodelay_ms: cfg.debug_iodelay_ms,
    };

    eprintln!("[VMM] Starting vCPU...");
    use std::io::Write;
    std::io::stderr().flush().ok();

    let mut iteration = 0u64;
    loop {
        iteration += 1;
        let exit = boot_vcpu.run_with_io(&mut handler)?;

        if iteration <= 10 || iteration.is_multiple_of(100000) {
            eprintln!("[VMM] iteration {iteration}: {exit:?}, {} I/O ops", handler.io_count);
        }
        match exit {
            kvm::VcpuExit::Io => {}
            kvm::VcpuExit::Hlt => {
                eprintln!("\n[VMM] Guest halted after {iteration} iterations, {} I/O ops", handler.io_count);
                break;
            }
            kvm::VcpuExit::Shutdown => {
                eprintln!("\n[VMM] Guest shutdown after {iteration} iterations, {} I/O ops", handler.io_count);
                if let Ok(regs) = boot_vcpu.get_regs() {
                    eprintln!("[VMM] Final RIP: {:#x}", regs.rip);
                }
                break;
            }
            kvm::VcpuExit::InternalError => {
                eprintln!("[VMM] KVM internal error");
                break;
            }
            kvm::VcpuExit::FailEntry(reason) => {
                eprintln!("[VMM] Failed to enter guest: reason={reason}");
                break;
            }
            kvm::VcpuExit::SystemEvent(event) => {
                eprintln!("[VMM] System event: {event}");
                break;
            }
            kvm::VcpuExit::Unknown(reason) => {
                eprintln!("[VMM] Unknown exit: {reason}");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run(_args: Args) -> Result<(), Box<dyn std::error::Error>> {
    Err("Carbon requires Linux with KVM support. This platform is not supported.".into())
}

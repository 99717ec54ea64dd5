//! VM configuration record (spec §6's one configuration record), built the
//! way `virt-do-lumper`'s `config::VMMConfig` is built: a plain data struct
//! plus a builder, fed from a `clap`-derived CLI struct in `main.rs`.

use std::path::PathBuf;

/// How the guest's primary console is exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsoleMode {
    #[default]
    Serial,
    Virtio,
    Hv,
}

impl std::str::FromStr for ConsoleMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "serial" => Ok(ConsoleMode::Serial),
            "virtio" => Ok(ConsoleMode::Virtio),
            "hv" => Ok(ConsoleMode::Hv),
            other => Err(format!("unknown console mode \"{other}\" (want serial|virtio|hv)")),
        }
    }
}

/// How the guest reaches the network, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkMode {
    #[default]
    None,
    User,
    Tap,
}

impl std::str::FromStr for NetworkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(NetworkMode::None),
            "user" => Ok(NetworkMode::User),
            "tap" => Ok(NetworkMode::Tap),
            other => Err(format!("unknown network mode \"{other}\" (want none|user|tap)")),
        }
    }
}

/// One virtio-blk or virtio-scsi backing image.
#[derive(Debug, Clone)]
pub struct DiskConfig {
    pub path: PathBuf,
    pub readonly: bool,
}

/// One virtio-9p export: a host directory surfaced under `tag` in the guest.
#[derive(Debug, Clone)]
pub struct NinePShare {
    pub tag: String,
    pub root: PathBuf,
}

/// Kernel command line, capacity-bounded the way the teacher's
/// `CMDLINE_MAX_SIZE` constant bounds it (spec `layout::CMDLINE_MAX_SIZE`).
pub const CMDLINE_MAX_SIZE: usize = crate::boot::layout::CMDLINE_MAX_SIZE;

/// The VM configuration record from spec §6:
/// `{dev_path, ram_size_bytes, nrcpus, console_mode, network_mode, disks[],
/// 9p_shares[], kernel/initrd/firmware paths, cmdline, vidmode, single_step,
/// debug_ioport, debug_iodelay_ms, hugetlbfs_path}`.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub dev_path: PathBuf,
    pub ram_size_bytes: u64,
    pub nrcpus: u8,
    pub console_mode: ConsoleMode,
    pub network_mode: NetworkMode,
    pub tap_name: Option<String>,
    pub mac: Option<[u8; 6]>,
    pub disks: Vec<DiskConfig>,
    pub ninep_shares: Vec<NinePShare>,
    pub kernel_path: PathBuf,
    pub initrd_path: Option<PathBuf>,
    pub firmware_path: Option<PathBuf>,
    pub cmdline: String,
    pub vidmode: bool,
    pub single_step: bool,
    pub debug_ioport: bool,
    pub debug_iodelay_ms: u64,
    pub hugetlbfs_path: Option<PathBuf>,
}

impl VmConfig {
    pub fn builder(kernel_path: PathBuf) -> VmConfigBuilder {
        VmConfigBuilder::new(kernel_path)
    }
}

/// See `VmConfig` for an explanation of these fields.
#[derive(Debug)]
pub struct VmConfigBuilder {
    dev_path: PathBuf,
    ram_size_bytes: u64,
    nrcpus: u8,
    console_mode: ConsoleMode,
    network_mode: NetworkMode,
    tap_name: Option<String>,
    mac: Option<[u8; 6]>,
    disks: Vec<DiskConfig>,
    ninep_shares: Vec<NinePShare>,
    kernel_path: PathBuf,
    initrd_path: Option<PathBuf>,
    firmware_path: Option<PathBuf>,
    cmdline: String,
    vidmode: bool,
    single_step: bool,
    debug_ioport: bool,
    debug_iodelay_ms: u64,
    hugetlbfs_path: Option<PathBuf>,
}

impl VmConfigBuilder {
    pub fn new(kernel_path: PathBuf) -> Self {
        Self {
            dev_path: PathBuf::from("/dev/kvm"),
            ram_size_bytes: crate::boot::layout::DEFAULT_MEM_SIZE,
            nrcpus: 1,
            console_mode: ConsoleMode::Serial,
            network_mode: NetworkMode::None,
            tap_name: None,
            mac: None,
            disks: Vec::new(),
            ninep_shares: Vec::new(),
            kernel_path,
            initrd_path: None,
            firmware_path: None,
            cmdline: "console=ttyS0 reboot=t panic=-1".to_string(),
            vidmode: false,
            single_step: false,
            debug_ioport: false,
            debug_iodelay_ms: 0,
            hugetlbfs_path: None,
        }
    }

    pub fn dev_path(mut self, path: PathBuf) -> Self {
        self.dev_path = path;
        self
    }

    pub fn ram_size_bytes(mut self, size: u64) -> Self {
        self.ram_size_bytes = size;
        self
    }

    pub fn nrcpus(mut self, n: u8) -> Self {
        self.nrcpus = n.max(1);
        self
    }

    pub fn console_mode(mut self, mode: ConsoleMode) -> Self {
        self.console_mode = mode;
        self
    }

    pub fn network(mut self, mode: NetworkMode, tap_name: Option<String>) -> Self {
        self.network_mode = mode;
        self.tap_name = tap_name;
        self
    }

    pub fn mac(mut self, mac: Option<[u8; 6]>) -> Self {
        self.mac = mac;
        self
    }

    pub fn disk(mut self, path: PathBuf, readonly: bool) -> Self {
        self.disks.push(DiskConfig { path, readonly });
        self
    }

    pub fn ninep_share(mut self, tag: String, root: PathBuf) -> Self {
        self.ninep_shares.push(NinePShare { tag, root });
        self
    }

    pub fn initrd(mut self, path: Option<PathBuf>) -> Self {
        self.initrd_path = path;
        self
    }

    pub fn firmware(mut self, path: Option<PathBuf>) -> Self {
        self.firmware_path = path;
        self
    }

    pub fn cmdline(mut self, cmdline: String) -> Self {
        self.cmdline = cmdline;
        self
    }

    pub fn vidmode(mut self, v: bool) -> Self {
        self.vidmode = v;
        self
    }

    pub fn single_step(mut self, v: bool) -> Self {
        self.single_step = v;
        self
    }

    pub fn debug_ioport(mut self, v: bool) -> Self {
        self.debug_ioport = v;
        self
    }

    pub fn debug_iodelay_ms(mut self, ms: u64) -> Self {
        self.debug_iodelay_ms = ms;
        self
    }

    pub fn hugetlbfs_path(mut self, path: Option<PathBuf>) -> Self {
        self.hugetlbfs_path = path;
        self
    }

    pub fn build(self) -> VmConfig {
        VmConfig {
            dev_path: self.dev_path,
            ram_size_bytes: self.ram_size_bytes,
            nrcpus: self.nrcpus,
            console_mode: self.console_mode,
            network_mode: self.network_mode,
            tap_name: self.tap_name,
            mac: self.mac,
            disks: self.disks,
            ninep_shares: self.ninep_shares,
            kernel_path: self.kernel_path,
            initrd_path: self.initrd_path,
            firmware_path: self.firmware_path,
            cmdline: self.cmdline,
            vidmode: self.vidmode,
            single_step: self.single_step,
            debug_ioport: self.debug_ioport,
            debug_iodelay_ms: self.debug_iodelay_ms,
            hugetlbfs_path: self.hugetlbfs_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_to_one_cpu_and_serial_console() {
        let cfg = VmConfig::builder(PathBuf::from("vmlinuz")).build();
        assert_eq!(cfg.nrcpus, 1);
        assert_eq!(cfg.console_mode, ConsoleMode::Serial);
        assert_eq!(cfg.network_mode, NetworkMode::None);
        assert!(cfg.disks.is_empty());
    }

    #[test]
    fn builder_accumulates_multiple_disks_and_shares() {
        let cfg = VmConfig::builder(PathBuf::from("vmlinuz"))
            .disk(PathBuf::from("a.img"), false)
            .disk(PathBuf::from("b.qcow2"), true)
            .ninep_share("share0".into(), PathBuf::from("/srv/share0"))
            .build();
        assert_eq!(cfg.disks.len(), 2);
        assert!(cfg.disks[1].readonly);
        assert_eq!(cfg.ninep_shares[0].tag, "share0");
    }

    #[test]
    fn console_mode_parses_from_str() {
        assert_eq!("serial".parse::<ConsoleMode>().unwrap(), ConsoleMode::Serial);
        assert_eq!("virtio".parse::<ConsoleMode>().unwrap(), ConsoleMode::Virtio);
        assert!("bogus".parse::<ConsoleMode>().is_err());
    }
}

//! Flattened device tree (FDT) boot path for ARM/RISC-V guests.
//!
//! Not wired into the default x86_64 build (see `DESIGN.md`'s architecture
//! scope decision); kept as a real, testable module alongside `acpi` so the
//! boot-time external-interface surface has more than one architecture's
//! worth of representation. A real aarch64/riscv64 build would hand the
//! blob this produces to the kernel in a register (`x0` on aarch64, `a1` on
//! riscv64) instead of the ACPI RSDP pointer `setup_boot_params` writes for
//! x86_64.
//!
//! This emits the same information `acpi::setup_acpi` does -  memory size,
//! CPU count, and the virtio-mmio device list - as a DTB blob instead of
//! ACPI tables, following the node shape of `arm/fdt.c` and `riscv/fdt.c`
//! (`/memory`, `/cpus/cpu@N`, `/chosen`, `/virtio_mmio@ADDR` nodes) without
//! carrying over their helper names.

use super::VirtioDeviceConfig;

const FDT_MAGIC: u32 = 0xd00d_feed;
const FDT_VERSION: u32 = 17;
const FDT_LAST_COMP_VERSION: u32 = 16;

const FDT_BEGIN_NODE: u32 = 0x0000_0001;
const FDT_END_NODE: u32 = 0x0000_0002;
const FDT_PROP: u32 = 0x0000_0003;
const FDT_END: u32 = 0x0000_0009;

/// Builds a flattened device tree blob describing guest RAM, CPUs, the
/// kernel command line and the virtio-mmio device list.
///
/// Mirrors `acpi::setup_acpi`'s signature and role for the DT-booting
/// architectures; unlike ACPI this produces a single relocatable blob
/// rather than tables written directly into guest memory, since the FDT
/// address is passed to the kernel in a register rather than discovered
/// via a fixed-address pointer structure.
pub fn build_device_tree(
    mem_size: u64,
    num_cpus: u8,
    cmdline: &str,
    virtio_devices: &[VirtioDeviceConfig],
) -> Vec<u8> {
    let mut strings = StringBlock::new();
    let mut structure = Vec::new();

    begin_node(&mut structure, "");
    prop_u32(&mut structure, &mut strings, "#address-cells", 2);
    prop_u32(&mut structure, &mut strings, "#size-cells", 2);
    prop_str(&mut structure, &mut strings, "compatible", "linux,dummy-virt");

    begin_node(&mut structure, "chosen");
    prop_str(&mut structure, &mut strings, "bootargs", cmdline);
    end_node(&mut structure);

    begin_node(&mut structure, "memory@0");
    prop_str(&mut structure, &mut strings, "device_type", "memory");
    prop_u64_pair(&mut structure, &mut strings, "reg", 0, mem_size);
    end_node(&mut structure);

    begin_node(&mut structure, "cpus");
    prop_u32(&mut structure, &mut strings, "#address-cells", 1);
    prop_u32(&mut structure, &mut strings, "#size-cells", 0);
    for cpu in 0..num_cpus {
        begin_node(&mut structure, &format!("cpu@{cpu}"));
        prop_str(&mut structure, &mut strings, "device_type", "cpu");
        prop_u32(&mut structure, &mut strings, "reg", cpu as u32);
        end_node(&mut structure);
    }
    end_node(&mut structure);

    for dev in virtio_devices {
        begin_node(&mut structure, &format!("virtio_mmio@{:x}", dev.mmio_base));
        prop_str(&mut structure, &mut strings, "compatible", "virtio,mmio");
        prop_u64_pair(&mut structure, &mut strings, "reg", dev.mmio_base, dev.mmio_size as u64);
        prop_u32(&mut structure, &mut strings, "interrupts", dev.gsi);
        end_node(&mut structure);
    }

    end_node(&mut structure);
    structure.extend_from_slice(&FDT_END.to_be_bytes());

    assemble(structure, strings.into_bytes())
}

struct StringBlock {
    bytes: Vec<u8>,
    offsets: std::collections::HashMap<&'static str, u32>,
}

impl StringBlock {
    fn new() -> Self {
        Self { bytes: Vec::new(), offsets: std::collections::HashMap::new() }
    }

    /// Interns `name`, returning its byte offset in the string block. Every
    /// property name used by `build_device_tree` is a `'static` literal, so
    /// a single table dedupes them all (e.g. every node's `reg` property
    /// shares one string-block entry).
    fn intern(&mut self, name: &'static str) -> u32 {
        if let Some(&off) = self.offsets.get(name) {
            return off;
        }
        let off = self.bytes.len() as u32;
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        self.offsets.insert(name, off);
        off
    }

    fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

fn begin_node(structure: &mut Vec<u8>, name: &str) {
    structure.extend_from_slice(&FDT_BEGIN_NODE.to_be_bytes());
    structure.extend_from_slice(name.as_bytes());
    structure.push(0);
    pad4(structure);
}

fn end_node(structure: &mut Vec<u8>) {
    structure.extend_from_slice(&FDT_END_NODE.to_be_bytes());
}

fn prop_raw(structure: &mut Vec<u8>, strings: &mut StringBlock, name: &'static str, value: &[u8]) {
    structure.extend_from_slice(&FDT_PROP.to_be_bytes());
    structure.extend_from_slice(&(value.len() as u32).to_be_bytes());
    structure.extend_from_slice(&strings.intern(name).to_be_bytes());
    structure.extend_from_slice(value);
    pad4(structure);
}

fn prop_u32(structure: &mut Vec<u8>, strings: &mut StringBlock, name: &'static str, value: u32) {
    prop_raw(structure, strings, name, &value.to_be_bytes());
}

fn prop_u64_pair(structure: &mut Vec<u8>, strings: &mut StringBlock, name: &'static str, a: u64, b: u64) {
    let mut buf = Vec::with_capacity(16);
    buf.extend_from_slice(&a.to_be_bytes());
    buf.extend_from_slice(&b.to_be_bytes());
    prop_raw(structure, strings, name, &buf);
}

fn prop_str(structure: &mut Vec<u8>, strings: &mut StringBlock, name: &'static str, value: &str) {
    let mut buf = value.as_bytes().to_vec();
    buf.push(0);
    prop_raw(structure, strings, name, &buf);
}

fn pad4(buf: &mut Vec<u8>) {
    while !buf.len().is_multiple_of(4) {
        buf.push(0);
    }
}

fn assemble(structure: Vec<u8>, strings: Vec<u8>) -> Vec<u8> {
    const HEADER_SIZE: u32 = 40;
    let struct_off = HEADER_SIZE;
    let strings_off = struct_off + structure.len() as u32;
    let total_size = strings_off + strings.len() as u32;

    let mut blob = Vec::with_capacity(total_size as usize);
    blob.extend_from_slice(&FDT_MAGIC.to_be_bytes());
    blob.extend_from_slice(&total_size.to_be_bytes());
    blob.extend_from_slice(&struct_off.to_be_bytes());
    blob.extend_from_slice(&strings_off.to_be_bytes());
    blob.extend_from_slice(&HEADER_SIZE.to_be_bytes()); // off_mem_rsvmap: empty, right after header
    blob.extend_from_slice(&FDT_VERSION.to_be_bytes());
    blob.extend_from_slice(&FDT_LAST_COMP_VERSION.to_be_bytes());
    blob.extend_from_slice(&0u32.to_be_bytes()); // boot_cpuid_phys
    blob.extend_from_slice(&(strings.len() as u32).to_be_bytes());
    blob.extend_from_slice(&(structure.len() as u32).to_be_bytes());
    blob.extend_from_slice(&structure);
    blob.extend_from_slice(&strings);
    blob
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_match_blob_layout() {
        let blob = build_device_tree(256 * 1024 * 1024, 2, "console=ttyAMA0", &[]);
        assert_eq!(u32::from_be_bytes(blob[0..4].try_into().unwrap()), FDT_MAGIC);
        let total_size = u32::from_be_bytes(blob[4..8].try_into().unwrap());
        assert_eq!(total_size as usize, blob.len());
    }

    #[test]
    fn virtio_mmio_node_is_present_in_structure_block() {
        let dev = VirtioDeviceConfig { id: 0, mmio_base: 0xd000_0000, mmio_size: 0x1000, gsi: 16 };
        let blob = build_device_tree(128 * 1024 * 1024, 1, "console=ttyAMA0", &[dev]);
        let needle = b"virtio_mmio@d0000000";
        assert!(blob.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn string_block_dedupes_repeated_property_names() {
        let mut strings = StringBlock::new();
        let a = strings.intern("reg");
        let b = strings.intern("reg");
        assert_eq!(a, b);
    }
}

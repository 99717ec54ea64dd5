//! Interrupt routing (spec §2.6/§2.7, "GSI allocation table").
//!
//! Every device that can raise an interrupt is handed a GSI (Global System
//! Interrupt) number by [`IrqRouter::allocate_line`]. For the in-kernel
//! irqchip backends (x86 PIC/IOAPIC) that GSI doubles as the irqchip pin;
//! for MSI-capable transports (virtio-pci) [`IrqRouter::add_msix_route`]
//! instead points the GSI at an `(address, data)` MSI message. KVM replaces
//! its whole routing table on every `KVM_SET_GSI_ROUTING` call, so this
//! struct keeps the authoritative copy and re-submits it on every change.
//!
//! The controller-specific backends below (`pic_ioapic`, `gic`, `plic`,
//! `aia`) implement [`InterruptController`] so a single call site can raise
//! a line without caring which architecture it is running on; only the x86
//! backend is wired into the default build (see `DESIGN.md`).

pub mod pic_ioapic;

#[cfg(target_arch = "aarch64")]
pub mod gic;

#[cfg(target_arch = "riscv64")]
pub mod plic;

#[cfg(target_arch = "riscv64")]
pub mod aia;

use crate::kvm::{KvmError, VmFd};
use kvm_bindings::kvm_irq_routing_entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// First GSI handed out to devices. GSIs 0-15 are reserved for the legacy
/// PIC lines (serial, RTC, ...), matching the teacher's fixed IRQ numbers.
pub const GSI_BASE: u32 = 16;

#[derive(Error, Debug)]
pub enum IrqError {
    #[error("no GSIs left to allocate")]
    Exhausted,

    #[error("GSI {0} was never allocated")]
    UnknownGsi(u32),

    #[error(transparent)]
    Kvm(#[from] KvmError),
}

/// A backend capable of asserting/deasserting an interrupt line.
pub trait InterruptController: Send + Sync {
    fn raise(&self, gsi: u32) -> Result<(), IrqError>;
    fn lower(&self, gsi: u32) -> Result<(), IrqError>;
}

#[derive(Clone, Copy, Debug)]
enum Route {
    Irqchip,
    Msi { address: u64, data: u32 },
}

/// Owns GSI allocation and the KVM-visible routing table.
///
/// Holds its `VmFd` behind an `Arc` rather than a borrow so that an
/// `Arc<IrqRouter>` can be cloned into the `'static` closures a device's
/// `raise_irq` callback is stored as (`virtio::transport::{mmio,
/// pci_legacy, pci_modern}` all box that callback with no lifetime
/// parameter of their own).
pub struct IrqRouter {
    vm: Arc<VmFd>,
    next_gsi: Mutex<u32>,
    routes: Mutex<HashMap<u32, Route>>,
}

impl IrqRouter {
    pub fn new(vm: Arc<VmFd>) -> Self {
        Self {
            vm,
            next_gsi: Mutex::new(GSI_BASE),
            routes: Mutex::new(HashMap::new()),
        }
    }

    /// Hand out the next unused GSI and route it through the in-kernel
    /// irqchip (the common case for legacy and virtio-mmio devices).
    pub fn allocate_line(&self) -> Result<u32, IrqError> {
        let gsi = {
            let mut next = self.next_gsi.lock().unwrap();
            let gsi = *next;
            *next = next.checked_add(1).ok_or(IrqError::Exhausted)?;
            gsi
        };
        self.routes.lock().unwrap().insert(gsi, Route::Irqchip);
        self.commit()?;
        Ok(gsi)
    }

    /// Register an MSI route for `gsi` (must already be allocated), used by
    /// virtio-pci's MSI-X capability.
    pub fn add_msix_route(&self, gsi: u32, address: u64, data: u32) -> Result<(), IrqError> {
        let mut routes = self.routes.lock().unwrap();
        if !routes.contains_key(&gsi) {
            return Err(IrqError::UnknownGsi(gsi));
        }
        routes.insert(gsi, Route::Msi { address, data });
        drop(routes);
        self.commit()
    }

    /// Update an existing MSI route in place (MSI-X table write).
    pub fn update_msix_route(&self, gsi: u32, address: u64, data: u32) -> Result<(), IrqError> {
        self.add_msix_route(gsi, address, data)
    }

    /// Assert then immediately deassert `gsi` (an edge-triggered kick),
    /// matching the teacher's level of fidelity for legacy lines.
    pub fn trigger(&self, gsi: u32) -> Result<(), IrqError> {
        self.vm.set_irq_line(gsi, true)?;
        self.vm.set_irq_line(gsi, false)?;
        Ok(())
    }

    fn commit(&self) -> Result<(), IrqError> {
        let routes = self.routes.lock().unwrap();
        let entries: Vec<kvm_irq_routing_entry> = routes
            .iter()
            .map(|(&gsi, route)| match *route {
                Route::Irqchip => {
                    let mut e = kvm_irq_routing_entry {
                        gsi,
                        type_: VmFd::IRQ_ROUTING_IRQCHIP,
                        ..Default::default()
                    };
                    // Map GSI directly onto the matching IOAPIC pin; this
                    // keeps legacy GSIs < 24 usable as both PIC and IOAPIC
                    // pins the way the in-kernel irqchip expects.
                    e.u.irqchip.irqchip = 0;
                    e.u.irqchip.pin = gsi;
                    e
                }
                Route::Msi { address, data } => {
                    let mut e = kvm_irq_routing_entry {
                        gsi,
                        type_: VmFd::IRQ_ROUTING_MSI,
                        ..Default::default()
                    };
                    e.u.msi.address_lo = address as u32;
                    e.u.msi.address_hi = (address >> 32) as u32;
                    e.u.msi.data = data;
                    e
                }
            })
            .collect();
        self.vm.set_gsi_routing(&entries)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // IrqRouter needs a live VmFd (hence /dev/kvm) to commit routes, so its
    // allocation bookkeeping is exercised indirectly through
    // `pic_ioapic::tests` instead, which only need the GSI numbering.
}

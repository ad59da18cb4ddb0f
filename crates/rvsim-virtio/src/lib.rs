//! VirtIO-MMIO device models for a RISC-V instruction-set simulator.
//!
//! The simulator maps each device's 4 KiB register window into guest physical
//! address space and forwards bus accesses to [`mmio::VirtioMmioDevice`]. A
//! store to `QUEUE_NOTIFY` runs the whole request synchronously on the CPU's
//! store path: descriptor chains are walked in guest memory, the device logic
//! performs its backing I/O, the used ring is published and the interrupt
//! line raised, all before the store retires.
//!
//! Crate map:
//!
//! - [`memory`]: guest physical memory access, page-bounded
//! - [`irq`]: the level-triggered interrupt line seen by the transport
//! - [`queue`]: split-virtqueue engine (descriptor chains, used ring)
//! - [`mmio`]: the MMIO register file, dispatch loop and bus façade
//! - [`devices`]: device logic — block ([`devices::blk`]) and 9P
//!   ([`devices::p9`])
//! - [`plugin`]: `key=value` device arguments, wiring helpers, device-tree
//!   fragment generation

pub mod devices;
pub mod irq;
pub mod memory;
pub mod mmio;
pub mod plugin;
pub mod queue;

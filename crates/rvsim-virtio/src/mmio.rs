//! VirtIO-MMIO transport: register file, notification dispatch and the
//! bus-level load/store façade.
//!
//! Register offsets follow the virtio-mmio v2 layout. Control registers only
//! respond to 4-byte accesses; device configuration space at `0x100+`
//! supports 1/2/4-byte accesses. All guest-visible multi-byte values are
//! little-endian.

use tracing::{debug, trace};

use crate::devices::{DispatchOutcome, VirtioDevice};
use crate::irq::{InterruptState, IrqLine};
use crate::memory::GuestMemory;
use crate::queue::{warn_malformed, QueueCtx, QueueState, MAX_QUEUE, MAX_QUEUE_NUM};

pub const VIRTIO_MMIO_MAGIC_VALUE: u64 = 0x000;
pub const VIRTIO_MMIO_VERSION: u64 = 0x004;
pub const VIRTIO_MMIO_DEVICE_ID: u64 = 0x008;
pub const VIRTIO_MMIO_VENDOR_ID: u64 = 0x00c;
pub const VIRTIO_MMIO_DEVICE_FEATURES: u64 = 0x010;
pub const VIRTIO_MMIO_DEVICE_FEATURES_SEL: u64 = 0x014;
pub const VIRTIO_MMIO_DRIVER_FEATURES: u64 = 0x020;
pub const VIRTIO_MMIO_DRIVER_FEATURES_SEL: u64 = 0x024;
pub const VIRTIO_MMIO_QUEUE_SEL: u64 = 0x030;
pub const VIRTIO_MMIO_QUEUE_NUM_MAX: u64 = 0x034;
pub const VIRTIO_MMIO_QUEUE_NUM: u64 = 0x038;
pub const VIRTIO_MMIO_QUEUE_READY: u64 = 0x044;
pub const VIRTIO_MMIO_QUEUE_NOTIFY: u64 = 0x050;
pub const VIRTIO_MMIO_INTERRUPT_STATUS: u64 = 0x060;
pub const VIRTIO_MMIO_INTERRUPT_ACK: u64 = 0x064;
pub const VIRTIO_MMIO_STATUS: u64 = 0x070;
pub const VIRTIO_MMIO_QUEUE_DESC_LOW: u64 = 0x080;
pub const VIRTIO_MMIO_QUEUE_DESC_HIGH: u64 = 0x084;
pub const VIRTIO_MMIO_QUEUE_AVAIL_LOW: u64 = 0x090;
pub const VIRTIO_MMIO_QUEUE_AVAIL_HIGH: u64 = 0x094;
pub const VIRTIO_MMIO_QUEUE_USED_LOW: u64 = 0x0a0;
pub const VIRTIO_MMIO_QUEUE_USED_HIGH: u64 = 0x0a4;
pub const VIRTIO_MMIO_CONFIG_GENERATION: u64 = 0x0fc;
pub const VIRTIO_MMIO_CONFIG: u64 = 0x100;

pub const VIRTIO_MMIO_MAGIC: u32 = 0x7472_6976;
pub const VIRTIO_MMIO_VENDOR: u32 = 0xffff;

fn set_low32(addr: &mut u64, val: u32) {
    *addr = (*addr & !0xffff_ffff) | u64::from(val);
}

fn set_high32(addr: &mut u64, val: u32) {
    *addr = (*addr & 0xffff_ffff) | (u64::from(val) << 32);
}

/// The transport core: register state, queues and interrupt state wrapped
/// around one device model.
pub struct VirtioMmio<D: VirtioDevice> {
    device: D,
    status: u32,
    device_features_sel: u32,
    queue_sel: usize,
    queues: [QueueState; MAX_QUEUE],
    interrupt: InterruptState,
}

impl<D: VirtioDevice> VirtioMmio<D> {
    pub fn new(device: D, irq: Box<dyn IrqLine>) -> Self {
        Self {
            device,
            status: 0,
            device_features_sel: 0,
            queue_sel: 0,
            queues: [QueueState::default(); MAX_QUEUE],
            interrupt: InterruptState::new(irq),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn queue(&self, queue_idx: usize) -> &QueueState {
        &self.queues[queue_idx]
    }

    pub fn int_status(&self) -> u32 {
        self.interrupt.status()
    }

    /// Suppress automatic dispatch for `queue_idx`; the embedder drives the
    /// queue by calling [`VirtioMmio::notify`] itself.
    pub fn set_manual_recv(&mut self, queue_idx: usize, manual: bool) {
        self.queues[queue_idx].manual_recv = manual;
    }

    /// Full device reset, as triggered by a guest write of 0 to `STATUS`.
    pub fn reset(&mut self) {
        self.status = 0;
        self.queue_sel = 0;
        self.device_features_sel = 0;
        self.interrupt.reset();
        for queue in &mut self.queues {
            queue.reset();
        }
    }

    fn config_read(&self, offset: u64, size_log2: u32) -> u32 {
        let config = self.device.config_space();
        let width = 1usize << size_log2.min(2);
        let Some(range) = usize::try_from(offset)
            .ok()
            .and_then(|start| Some(start..start.checked_add(width)?))
        else {
            return 0;
        };
        match (size_log2, config.get(range)) {
            (0, Some(b)) => u32::from(b[0]),
            (1, Some(b)) => u32::from(u16::from_le_bytes([b[0], b[1]])),
            (2, Some(b)) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            _ => 0,
        }
    }

    fn config_write(&mut self, offset: u64, val: u32, size_log2: u32) {
        if size_log2 > 2 {
            return;
        }
        let width = 1usize << size_log2;
        let Some(range) = usize::try_from(offset)
            .ok()
            .and_then(|start| Some(start..start.checked_add(width)?))
        else {
            return;
        };
        let config = self.device.config_space_mut();
        let Some(dst) = config.get_mut(range) else {
            return;
        };
        dst.copy_from_slice(&val.to_le_bytes()[..width]);
        self.device.config_written();
    }

    /// Register read at 4-byte granularity (`size_log2` 0/1/2 for 1/2/4
    /// bytes). Control registers only respond to 4-byte accesses; everything
    /// else reads as 0.
    pub fn mmio_read(&mut self, offset: u64, size_log2: u32) -> u32 {
        if offset >= VIRTIO_MMIO_CONFIG {
            return self.config_read(offset - VIRTIO_MMIO_CONFIG, size_log2);
        }
        if size_log2 != 2 {
            return 0;
        }
        let val = match offset {
            VIRTIO_MMIO_MAGIC_VALUE => VIRTIO_MMIO_MAGIC,
            VIRTIO_MMIO_VERSION => 2,
            VIRTIO_MMIO_DEVICE_ID => self.device.device_id(),
            VIRTIO_MMIO_VENDOR_ID => VIRTIO_MMIO_VENDOR,
            VIRTIO_MMIO_DEVICE_FEATURES => match self.device_features_sel {
                0 => self.device.device_features(),
                // High feature word: only VIRTIO_F_VERSION_1.
                1 => 1,
                _ => 0,
            },
            VIRTIO_MMIO_DEVICE_FEATURES_SEL => self.device_features_sel,
            VIRTIO_MMIO_QUEUE_SEL => self.queue_sel as u32,
            VIRTIO_MMIO_QUEUE_NUM_MAX => MAX_QUEUE_NUM,
            VIRTIO_MMIO_QUEUE_NUM => self.queues[self.queue_sel].num,
            VIRTIO_MMIO_QUEUE_READY => self.queues[self.queue_sel].ready as u32,
            VIRTIO_MMIO_QUEUE_DESC_LOW => self.queues[self.queue_sel].desc_addr as u32,
            VIRTIO_MMIO_QUEUE_DESC_HIGH => (self.queues[self.queue_sel].desc_addr >> 32) as u32,
            VIRTIO_MMIO_QUEUE_AVAIL_LOW => self.queues[self.queue_sel].avail_addr as u32,
            VIRTIO_MMIO_QUEUE_AVAIL_HIGH => (self.queues[self.queue_sel].avail_addr >> 32) as u32,
            VIRTIO_MMIO_QUEUE_USED_LOW => self.queues[self.queue_sel].used_addr as u32,
            VIRTIO_MMIO_QUEUE_USED_HIGH => (self.queues[self.queue_sel].used_addr >> 32) as u32,
            VIRTIO_MMIO_INTERRUPT_STATUS => self.interrupt.status(),
            VIRTIO_MMIO_STATUS => self.status,
            VIRTIO_MMIO_CONFIG_GENERATION => 0,
            _ => 0,
        };
        trace!(target: "rvsim_virtio", offset, val, "mmio read");
        val
    }

    /// Register write. Needs guest memory because a `QUEUE_NOTIFY` write runs
    /// the dispatch loop inline.
    pub fn mmio_write(
        &mut self,
        mem: &mut dyn GuestMemory,
        offset: u64,
        val: u32,
        size_log2: u32,
    ) {
        if offset >= VIRTIO_MMIO_CONFIG {
            self.config_write(offset - VIRTIO_MMIO_CONFIG, val, size_log2);
            return;
        }
        if size_log2 != 2 {
            return;
        }
        trace!(target: "rvsim_virtio", offset, val, "mmio write");
        match offset {
            VIRTIO_MMIO_DEVICE_FEATURES_SEL => self.device_features_sel = val,
            VIRTIO_MMIO_QUEUE_SEL => {
                if (val as usize) < MAX_QUEUE {
                    self.queue_sel = val as usize;
                }
            }
            VIRTIO_MMIO_QUEUE_NUM => {
                if val.is_power_of_two() && val <= MAX_QUEUE_NUM {
                    self.queues[self.queue_sel].num = val;
                }
            }
            VIRTIO_MMIO_QUEUE_DESC_LOW => set_low32(&mut self.queues[self.queue_sel].desc_addr, val),
            VIRTIO_MMIO_QUEUE_DESC_HIGH => {
                set_high32(&mut self.queues[self.queue_sel].desc_addr, val)
            }
            VIRTIO_MMIO_QUEUE_AVAIL_LOW => {
                set_low32(&mut self.queues[self.queue_sel].avail_addr, val)
            }
            VIRTIO_MMIO_QUEUE_AVAIL_HIGH => {
                set_high32(&mut self.queues[self.queue_sel].avail_addr, val)
            }
            VIRTIO_MMIO_QUEUE_USED_LOW => set_low32(&mut self.queues[self.queue_sel].used_addr, val),
            VIRTIO_MMIO_QUEUE_USED_HIGH => {
                set_high32(&mut self.queues[self.queue_sel].used_addr, val)
            }
            VIRTIO_MMIO_STATUS => {
                self.status = val;
                if val == 0 {
                    debug!(target: "rvsim_virtio", "device reset");
                    self.reset();
                }
            }
            VIRTIO_MMIO_QUEUE_READY => self.queues[self.queue_sel].ready = val & 1 == 1,
            VIRTIO_MMIO_QUEUE_NOTIFY => {
                if (val as usize) < MAX_QUEUE {
                    self.notify(mem, val as usize);
                }
            }
            VIRTIO_MMIO_INTERRUPT_ACK => self.interrupt.acknowledge(val),
            // DRIVER_FEATURES / DRIVER_FEATURES_SEL are accepted and ignored.
            _ => {}
        }
    }

    /// Drain the available ring, dispatching each posted chain to the device.
    ///
    /// A `Busy` outcome stops the walk without consuming the entry, so the
    /// same chain is redelivered when the device restarts dispatch. Chains
    /// that fail measurement are skipped.
    pub fn notify(&mut self, mem: &mut dyn GuestMemory, queue_idx: usize) {
        if queue_idx >= MAX_QUEUE || self.queues[queue_idx].manual_recv {
            return;
        }

        let Self {
            device,
            queues,
            interrupt,
            ..
        } = self;
        let mut ctx = QueueCtx {
            queues,
            mem,
            interrupt,
        };

        let Ok(avail_idx) = ctx.avail_idx(queue_idx) else {
            return;
        };
        while ctx.queues[queue_idx].last_avail_idx != avail_idx {
            let cursor = ctx.queues[queue_idx].last_avail_idx;
            let Ok(desc_idx) = ctx.avail_entry(queue_idx, cursor) else {
                return;
            };
            match ctx.chain_sizes(queue_idx, desc_idx) {
                Ok((read_size, write_size)) => {
                    debug!(
                        target: "rvsim_virtio",
                        queue_idx, desc_idx, read_size, write_size, "dispatch"
                    );
                    let outcome =
                        device.recv_request(&mut ctx, queue_idx, desc_idx, read_size, write_size);
                    if outcome == DispatchOutcome::Busy {
                        break;
                    }
                }
                Err(err) => warn_malformed(queue_idx, desc_idx, err),
            }
            ctx.queues[queue_idx].last_avail_idx = cursor.wrapping_add(1);
        }
    }

    /// Re-entry path for completions delivered outside the dispatch loop.
    ///
    /// Runs `f` with the device and an engine context; when it names a queue,
    /// that queue is drained afterwards. The drain happens after `f` returns
    /// rather than inside it, so a completion that unblocks further requests
    /// trampolines instead of recursing.
    pub fn complete(
        &mut self,
        mem: &mut dyn GuestMemory,
        f: impl FnOnce(&mut D, &mut QueueCtx<'_>) -> Option<usize>,
    ) {
        let requeue = {
            let Self {
                device,
                queues,
                interrupt,
                ..
            } = self;
            let mut ctx = QueueCtx {
                queues,
                mem: &mut *mem,
                interrupt,
            };
            f(device, &mut ctx)
        };
        if let Some(queue_idx) = requeue {
            self.notify(mem, queue_idx);
        }
    }
}

/// Bus-visible adapter: converts the simulator's 1/2/4/8-byte accesses into
/// the transport's register protocol. Owns the guest-memory handle the
/// dispatch path uses.
pub struct VirtioMmioDevice<D: VirtioDevice, M: GuestMemory> {
    core: VirtioMmio<D>,
    mem: M,
}

impl<D: VirtioDevice, M: GuestMemory> VirtioMmioDevice<D, M> {
    pub fn new(core: VirtioMmio<D>, mem: M) -> Self {
        Self { core, mem }
    }

    pub fn core(&self) -> &VirtioMmio<D> {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut VirtioMmio<D> {
        &mut self.core
    }

    pub fn mem_mut(&mut self) -> &mut M {
        &mut self.mem
    }

    /// Bus load of 1, 2, 4 or 8 bytes at byte offset `addr` inside the
    /// device window. An 8-byte load is two consecutive word reads (low then
    /// high). Other lengths fail.
    pub fn load(&mut self, addr: u64, out: &mut [u8]) -> bool {
        match out.len() {
            1 => out[0] = self.core.mmio_read(addr, 0) as u8,
            2 => out.copy_from_slice(&(self.core.mmio_read(addr, 1) as u16).to_le_bytes()),
            4 => out.copy_from_slice(&self.core.mmio_read(addr, 2).to_le_bytes()),
            8 => {
                let lo = self.core.mmio_read(addr, 2);
                let hi = self.core.mmio_read(addr + 4, 2);
                let val = u64::from(lo) | (u64::from(hi) << 32);
                out.copy_from_slice(&val.to_le_bytes());
            }
            _ => return false,
        }
        true
    }

    /// Bus store, symmetric to [`VirtioMmioDevice::load`].
    pub fn store(&mut self, addr: u64, bytes: &[u8]) -> bool {
        match bytes.len() {
            1 => self
                .core
                .mmio_write(&mut self.mem, addr, u32::from(bytes[0]), 0),
            2 => {
                let val = u16::from_le_bytes([bytes[0], bytes[1]]);
                self.core.mmio_write(&mut self.mem, addr, u32::from(val), 1);
            }
            4 => {
                let val = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                self.core.mmio_write(&mut self.mem, addr, val, 2);
            }
            8 => {
                let val = u64::from_le_bytes(bytes.try_into().unwrap());
                self.core.mmio_write(&mut self.mem, addr, val as u32, 2);
                self.core
                    .mmio_write(&mut self.mem, addr + 4, (val >> 32) as u32, 2);
            }
            _ => return false,
        }
        true
    }
}

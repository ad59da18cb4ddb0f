use pretty_assertions::assert_eq;

use rvsim_storage::{BlockImage, MemBackend, RawImage, SnapshotImage, SECTOR_SIZE};
use rvsim_virtio::devices::blk::{
    BlockBackend, BlockIoStatus, VirtioBlk, VIRTIO_BLK_S_IOERR, VIRTIO_BLK_S_OK,
    VIRTIO_BLK_S_UNSUPP, VIRTIO_BLK_T_FLUSH, VIRTIO_BLK_T_IN, VIRTIO_BLK_T_OUT,
};
use rvsim_virtio::irq::SharedIrqLine;
use rvsim_virtio::memory::{write_u16_le, write_u32_le, write_u64_le, GuestRam};
use rvsim_virtio::mmio::{
    VirtioMmio, VIRTIO_MMIO_QUEUE_AVAIL_LOW, VIRTIO_MMIO_QUEUE_DESC_LOW, VIRTIO_MMIO_QUEUE_NOTIFY,
    VIRTIO_MMIO_QUEUE_NUM, VIRTIO_MMIO_QUEUE_READY, VIRTIO_MMIO_QUEUE_SEL,
    VIRTIO_MMIO_QUEUE_USED_LOW,
};
use rvsim_virtio::queue::{VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};

const DESC_TABLE: u64 = 0x1000;
const AVAIL_RING: u64 = 0x2000;
const USED_RING: u64 = 0x3000;
const HEADER: u64 = 0x4000;
const DATA: u64 = 0x5000;
const STATUS: u64 = 0x6000;

type BlkCore = VirtioMmio<VirtioBlk<Box<dyn BlockImage>>>;

fn patterned_image(sectors: usize) -> MemBackend {
    let mut bytes = vec![0u8; sectors * SECTOR_SIZE];
    for (i, chunk) in bytes.chunks_exact_mut(SECTOR_SIZE).enumerate() {
        chunk.fill(0xa0 + i as u8);
    }
    MemBackend::from_bytes(bytes)
}

fn setup(image: Box<dyn BlockImage>) -> (BlkCore, GuestRam, SharedIrqLine) {
    let line = SharedIrqLine::default();
    let mut core = VirtioMmio::new(VirtioBlk::new(image), Box::new(line.clone()));
    let mut ram = GuestRam::new(0x10000);

    core.mmio_write(&mut ram, VIRTIO_MMIO_QUEUE_SEL, 0, 2);
    core.mmio_write(&mut ram, VIRTIO_MMIO_QUEUE_NUM, 8, 2);
    core.mmio_write(&mut ram, VIRTIO_MMIO_QUEUE_DESC_LOW, DESC_TABLE as u32, 2);
    core.mmio_write(&mut ram, VIRTIO_MMIO_QUEUE_AVAIL_LOW, AVAIL_RING as u32, 2);
    core.mmio_write(&mut ram, VIRTIO_MMIO_QUEUE_USED_LOW, USED_RING as u32, 2);
    core.mmio_write(&mut ram, VIRTIO_MMIO_QUEUE_READY, 1, 2);

    (core, ram, line)
}

fn write_desc(ram: &mut GuestRam, index: u16, addr: u64, len: u32, flags: u16, next: u16) {
    let base = DESC_TABLE + u64::from(index) * 16;
    write_u64_le(ram, base, addr).unwrap();
    write_u32_le(ram, base + 8, len).unwrap();
    write_u16_le(ram, base + 12, flags).unwrap();
    write_u16_le(ram, base + 14, next).unwrap();
}

fn write_request_header(ram: &mut GuestRam, typ: u32, sector: u64) {
    write_u32_le(ram, HEADER, typ).unwrap();
    write_u32_le(ram, HEADER + 4, 0).unwrap(); // ioprio
    write_u64_le(ram, HEADER + 8, sector).unwrap();
}

fn post_and_notify<B: BlockBackend>(
    core: &mut VirtioMmio<VirtioBlk<B>>,
    ram: &mut GuestRam,
    position: u16,
    head: u16,
) {
    write_u16_le(ram, AVAIL_RING + 4 + u64::from(position & 7) * 2, head).unwrap();
    write_u16_le(ram, AVAIL_RING + 2, position + 1).unwrap();
    core.mmio_write(ram, VIRTIO_MMIO_QUEUE_NOTIFY, 0, 2);
}

fn used_idx(ram: &GuestRam) -> u16 {
    let b = ram.get_slice(USED_RING + 2, 2).unwrap();
    u16::from_le_bytes([b[0], b[1]])
}

fn used_entry(ram: &GuestRam, position: u16) -> (u32, u32) {
    let slot = USED_RING + 4 + u64::from(position & 7) * 8;
    let b = ram.get_slice(slot, 8).unwrap();
    (
        u32::from_le_bytes(b[0..4].try_into().unwrap()),
        u32::from_le_bytes(b[4..8].try_into().unwrap()),
    )
}

fn status_byte(ram: &GuestRam) -> u8 {
    ram.get_slice(STATUS, 1).unwrap()[0]
}

/// Chain layout used by the Linux driver: header (ro), data, status (wo).
fn build_read_chain(ram: &mut GuestRam, sector: u64, data_len: u32) {
    write_request_header(ram, VIRTIO_BLK_T_IN, sector);
    write_desc(ram, 0, HEADER, 16, VIRTQ_DESC_F_NEXT, 1);
    write_desc(ram, 1, DATA, data_len, VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE, 2);
    write_desc(ram, 2, STATUS, 1, VIRTQ_DESC_F_WRITE, 0);
}

fn build_write_chain(ram: &mut GuestRam, sector: u64, data_len: u32) {
    write_request_header(ram, VIRTIO_BLK_T_OUT, sector);
    write_desc(ram, 0, HEADER, 16, VIRTQ_DESC_F_NEXT, 1);
    write_desc(ram, 1, DATA, data_len, VIRTQ_DESC_F_NEXT, 2);
    write_desc(ram, 2, STATUS, 1, VIRTQ_DESC_F_WRITE, 0);
}

#[test]
fn read_single_sector() {
    let image = RawImage::open(patterned_image(8), false).unwrap();
    let (mut core, mut ram, line) = setup(Box::new(image));

    ram.write(STATUS, &[0xaa]).unwrap();
    build_read_chain(&mut ram, 0, SECTOR_SIZE as u32);
    post_and_notify(&mut core, &mut ram, 0, 0);

    assert_eq!(used_idx(&ram), 1);
    assert_eq!(used_entry(&ram, 0), (0, SECTOR_SIZE as u32 + 1));
    assert!(ram
        .get_slice(DATA, SECTOR_SIZE)
        .unwrap()
        .iter()
        .all(|&b| b == 0xa0));
    assert_eq!(status_byte(&ram), VIRTIO_BLK_S_OK);
    assert!(line.level());
}

#[test]
fn read_of_later_sector_returns_its_contents() {
    let image = RawImage::open(patterned_image(8), false).unwrap();
    let (mut core, mut ram, _line) = setup(Box::new(image));

    build_read_chain(&mut ram, 5, SECTOR_SIZE as u32);
    post_and_notify(&mut core, &mut ram, 0, 0);

    assert!(ram
        .get_slice(DATA, SECTOR_SIZE)
        .unwrap()
        .iter()
        .all(|&b| b == 0xa5));
    assert_eq!(status_byte(&ram), VIRTIO_BLK_S_OK);
}

#[test]
fn write_to_read_only_image_fails_with_ioerr() {
    let image = RawImage::open(patterned_image(8), true).unwrap();
    let (mut core, mut ram, _line) = setup(Box::new(image));

    ram.write(DATA, &[0x55; SECTOR_SIZE]).unwrap();
    build_write_chain(&mut ram, 0, SECTOR_SIZE as u32);
    post_and_notify(&mut core, &mut ram, 0, 0);

    assert_eq!(used_idx(&ram), 1);
    assert_eq!(used_entry(&ram, 0), (0, 1));
    assert_eq!(status_byte(&ram), VIRTIO_BLK_S_IOERR);

    // The image is untouched.
    let mut sector = vec![0u8; SECTOR_SIZE];
    core.device_mut()
        .backend_mut()
        .read_sectors(0, &mut sector)
        .unwrap();
    assert!(sector.iter().all(|&b| b == 0xa0));
}

#[test]
fn write_lands_in_the_image() {
    let image = RawImage::open(patterned_image(8), false).unwrap();
    let (mut core, mut ram, _line) = setup(Box::new(image));

    ram.write(DATA, &[0x5a; SECTOR_SIZE]).unwrap();
    build_write_chain(&mut ram, 3, SECTOR_SIZE as u32);
    post_and_notify(&mut core, &mut ram, 0, 0);

    assert_eq!(status_byte(&ram), VIRTIO_BLK_S_OK);
    let mut sector = vec![0u8; SECTOR_SIZE];
    core.device_mut()
        .backend_mut()
        .read_sectors(3, &mut sector)
        .unwrap();
    assert!(sector.iter().all(|&b| b == 0x5a));
}

#[test]
fn snapshot_image_reads_back_writes() {
    let image = SnapshotImage::open(patterned_image(8)).unwrap();
    let (mut core, mut ram, _line) = setup(Box::new(image));

    ram.write(DATA, &[0x77; SECTOR_SIZE]).unwrap();
    build_write_chain(&mut ram, 2, SECTOR_SIZE as u32);
    post_and_notify(&mut core, &mut ram, 0, 0);
    assert_eq!(status_byte(&ram), VIRTIO_BLK_S_OK);

    ram.write(DATA, &[0; SECTOR_SIZE]).unwrap();
    build_read_chain(&mut ram, 2, SECTOR_SIZE as u32);
    post_and_notify(&mut core, &mut ram, 1, 0);

    assert!(ram
        .get_slice(DATA, SECTOR_SIZE)
        .unwrap()
        .iter()
        .all(|&b| b == 0x77));
}

#[test]
fn read_past_capacity_reports_ioerr() {
    let image = RawImage::open(patterned_image(8), false).unwrap();
    let (mut core, mut ram, _line) = setup(Box::new(image));

    build_read_chain(&mut ram, 8, SECTOR_SIZE as u32);
    post_and_notify(&mut core, &mut ram, 0, 0);

    assert_eq!(used_idx(&ram), 1);
    assert_eq!(status_byte(&ram), VIRTIO_BLK_S_IOERR);
}

#[test]
fn flush_is_answered_with_unsupp() {
    let image = RawImage::open(patterned_image(8), false).unwrap();
    let (mut core, mut ram, _line) = setup(Box::new(image));

    ram.write(STATUS, &[0xaa]).unwrap();
    write_request_header(&mut ram, VIRTIO_BLK_T_FLUSH, 0);
    write_desc(&mut ram, 0, HEADER, 16, VIRTQ_DESC_F_NEXT, 1);
    write_desc(&mut ram, 1, STATUS, 1, VIRTQ_DESC_F_WRITE, 0);
    post_and_notify(&mut core, &mut ram, 0, 0);

    // The chain is consumed rather than left dangling in the ring.
    assert_eq!(used_idx(&ram), 1);
    assert_eq!(used_entry(&ram, 0), (0, 1));
    assert_eq!(status_byte(&ram), VIRTIO_BLK_S_UNSUPP);
}

#[test]
fn short_header_chain_is_dropped_without_completion() {
    let image = RawImage::open(patterned_image(8), false).unwrap();
    let (mut core, mut ram, line) = setup(Box::new(image));

    // Header descriptor shorter than the 16-byte request header.
    write_desc(&mut ram, 0, HEADER, 8, VIRTQ_DESC_F_NEXT, 1);
    write_desc(&mut ram, 1, STATUS, 1, VIRTQ_DESC_F_WRITE, 0);
    post_and_notify(&mut core, &mut ram, 0, 0);

    assert_eq!(used_idx(&ram), 0);
    assert!(!line.level());

    // The ring keeps moving: a well-formed request afterwards completes.
    build_read_chain(&mut ram, 0, SECTOR_SIZE as u32);
    post_and_notify(&mut core, &mut ram, 1, 0);
    assert_eq!(used_idx(&ram), 1);
    assert_eq!(status_byte(&ram), VIRTIO_BLK_S_OK);
}

/// Backend that never completes synchronously.
struct DeferredDisk;

impl BlockBackend for DeferredDisk {
    fn sector_count(&self) -> u64 {
        8
    }

    fn submit_read(&mut self, _sector: u64, _buf: &mut [u8]) -> BlockIoStatus {
        BlockIoStatus::Pending
    }

    fn submit_write(&mut self, _sector: u64, _buf: &[u8]) -> BlockIoStatus {
        BlockIoStatus::Pending
    }
}

#[test]
fn pending_request_backpressures_until_completed() {
    let line = SharedIrqLine::default();
    let mut core = VirtioMmio::new(VirtioBlk::new(DeferredDisk), Box::new(line.clone()));
    let mut ram = GuestRam::new(0x10000);

    core.mmio_write(&mut ram, VIRTIO_MMIO_QUEUE_SEL, 0, 2);
    core.mmio_write(&mut ram, VIRTIO_MMIO_QUEUE_NUM, 8, 2);
    core.mmio_write(&mut ram, VIRTIO_MMIO_QUEUE_DESC_LOW, DESC_TABLE as u32, 2);
    core.mmio_write(&mut ram, VIRTIO_MMIO_QUEUE_AVAIL_LOW, AVAIL_RING as u32, 2);
    core.mmio_write(&mut ram, VIRTIO_MMIO_QUEUE_USED_LOW, USED_RING as u32, 2);
    core.mmio_write(&mut ram, VIRTIO_MMIO_QUEUE_READY, 1, 2);

    // Two read requests, distinct chains.
    write_request_header(&mut ram, VIRTIO_BLK_T_IN, 0);
    write_desc(&mut ram, 0, HEADER, 16, VIRTQ_DESC_F_NEXT, 1);
    write_desc(&mut ram, 1, DATA, 512, VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE, 2);
    write_desc(&mut ram, 2, STATUS, 1, VIRTQ_DESC_F_WRITE, 0);
    write_desc(&mut ram, 3, HEADER, 16, VIRTQ_DESC_F_NEXT, 4);
    write_desc(&mut ram, 4, DATA + 0x800, 512, VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE, 5);
    write_desc(&mut ram, 5, STATUS + 0x10, 1, VIRTQ_DESC_F_WRITE, 0);

    // First request parks in the device.
    post_and_notify(&mut core, &mut ram, 0, 0);
    assert_eq!(used_idx(&ram), 0);
    assert!(!line.level());

    // The second backs up behind it.
    write_u16_le(&mut ram, AVAIL_RING + 4 + 2, 3).unwrap();
    write_u16_le(&mut ram, AVAIL_RING + 2, 2).unwrap();
    core.mmio_write(&mut ram, VIRTIO_MMIO_QUEUE_NOTIFY, 0, 2);
    assert_eq!(used_idx(&ram), 0);

    // Completion publishes the first chain and redelivers the second, which
    // parks in turn.
    core.complete(&mut ram, |dev, ctx| dev.complete_request(ctx, Ok(())));
    assert_eq!(used_idx(&ram), 1);
    assert_eq!(used_entry(&ram, 0), (0, 513));
    assert_eq!(status_byte(&ram), VIRTIO_BLK_S_OK);
    assert!(line.level());

    core.complete(&mut ram, |dev, ctx| dev.complete_request(ctx, Ok(())));
    assert_eq!(used_idx(&ram), 2);
    assert_eq!(used_entry(&ram, 1), (3, 513));
}

#[test]
fn multi_sector_read_spans_descriptors() {
    let image = RawImage::open(patterned_image(8), false).unwrap();
    let (mut core, mut ram, _line) = setup(Box::new(image));

    // Two sectors of payload split across two writable descriptors.
    write_request_header(&mut ram, VIRTIO_BLK_T_IN, 1);
    write_desc(&mut ram, 0, HEADER, 16, VIRTQ_DESC_F_NEXT, 1);
    write_desc(
        &mut ram,
        1,
        DATA,
        SECTOR_SIZE as u32,
        VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE,
        2,
    );
    write_desc(
        &mut ram,
        2,
        DATA + 0x800,
        SECTOR_SIZE as u32,
        VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE,
        3,
    );
    write_desc(&mut ram, 3, STATUS, 1, VIRTQ_DESC_F_WRITE, 0);
    post_and_notify(&mut core, &mut ram, 0, 0);

    assert_eq!(used_entry(&ram, 0), (0, 2 * SECTOR_SIZE as u32 + 1));
    assert!(ram
        .get_slice(DATA, SECTOR_SIZE)
        .unwrap()
        .iter()
        .all(|&b| b == 0xa1));
    assert!(ram
        .get_slice(DATA + 0x800, SECTOR_SIZE)
        .unwrap()
        .iter()
        .all(|&b| b == 0xa2));
    assert_eq!(status_byte(&ram), VIRTIO_BLK_S_OK);
}

//! Device plugin wiring: `key=value` argument parsing, image opening, device
//! construction and the generated device-tree fragment.
//!
//! The simulator hands each device plugin a list of `key=value` strings. The
//! block device takes `img=<path>` and `mode=ro|snapshot|rw` (default `rw`);
//! the 9P device takes `path=<host-dir>` (required) and `tag=<mount-tag>`
//! (default `/dev/root`).

use std::collections::HashMap;
use std::path::PathBuf;

use thiserror::Error;
use tracing::warn;

use rvsim_storage::{
    BlockImage, DiskError, FileBackend, ImageMode, RawImage, SnapshotImage,
};

use crate::devices::blk::VirtioBlk;
use crate::devices::p9::fs::FileService;
use crate::devices::p9::{MountTagTooLong, Virtio9p};
use crate::irq::IrqLine;
use crate::memory::GuestMemory;
use crate::mmio::{VirtioMmio, VirtioMmioDevice};

pub const VIRTIO_MMIO_WINDOW_SIZE: u64 = 0x1000;

pub const VIRTIO_BLK_BASE: u64 = 0x4001_0000;
pub const VIRTIO_BLK_IRQ: u32 = 1;

pub const VIRTIO_9P_BASE: u64 = 0x4001_1000;
pub const VIRTIO_9P_IRQ: u32 = 2;

pub const DEFAULT_MOUNT_TAG: &str = "/dev/root";

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("missing required device argument `{0}`")]
    MissingArgument(&'static str),

    #[error("9p root `{0}` is not a directory")]
    NotADirectory(PathBuf),

    #[error(transparent)]
    MountTag(#[from] MountTagTooLong),

    #[error("failed to open image: {0}")]
    Image(#[from] DiskError),
}

/// Split plugin arguments at the first `=`. Arguments without one are
/// dropped.
pub fn parse_device_args(args: &[String]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for arg in args {
        match arg.split_once('=') {
            Some((key, value)) => {
                map.insert(key.to_string(), value.to_string());
            }
            None => warn!(target: "rvsim_virtio", %arg, "ignoring malformed device argument"),
        }
    }
    map
}

/// Block device arguments: `img=<path>`, `mode=ro|snapshot|rw`.
#[derive(Debug, Clone)]
pub struct BlockArgs {
    pub img: PathBuf,
    pub mode: ImageMode,
}

impl BlockArgs {
    pub fn from_args(args: &HashMap<String, String>) -> Result<Self, SetupError> {
        let img = args
            .get("img")
            .ok_or(SetupError::MissingArgument("img"))?
            .into();
        let mode = args
            .get("mode")
            .map_or(ImageMode::ReadWrite, |m| ImageMode::from_arg(m));
        Ok(Self { img, mode })
    }
}

/// 9P device arguments: `path=<host-dir>`, `tag=<mount-tag>`.
#[derive(Debug, Clone)]
pub struct NinePArgs {
    pub path: PathBuf,
    pub tag: String,
}

impl NinePArgs {
    pub fn from_args(args: &HashMap<String, String>) -> Result<Self, SetupError> {
        let path: PathBuf = args
            .get("path")
            .ok_or(SetupError::MissingArgument("path"))?
            .into();
        if !path.is_dir() {
            return Err(SetupError::NotADirectory(path));
        }
        let tag = args
            .get("tag")
            .cloned()
            .unwrap_or_else(|| DEFAULT_MOUNT_TAG.to_string());
        Ok(Self { path, tag })
    }
}

/// Open the backing image named by `args` in the requested mode.
pub fn open_block_image(args: &BlockArgs) -> Result<Box<dyn BlockImage>, SetupError> {
    let image: Box<dyn BlockImage> = match args.mode {
        ImageMode::ReadWrite => {
            Box::new(RawImage::open(FileBackend::open(&args.img, true)?, false)?)
        }
        ImageMode::ReadOnly => {
            Box::new(RawImage::open(FileBackend::open(&args.img, false)?, true)?)
        }
        ImageMode::Snapshot => Box::new(SnapshotImage::open(FileBackend::open(&args.img, false)?)?),
    };
    Ok(image)
}

/// Build a bus-ready block device from parsed arguments.
pub fn virtio_block_device<M: GuestMemory>(
    args: &BlockArgs,
    irq: Box<dyn IrqLine>,
    mem: M,
) -> Result<VirtioMmioDevice<VirtioBlk<Box<dyn BlockImage>>, M>, SetupError> {
    let image = open_block_image(args)?;
    let core = VirtioMmio::new(VirtioBlk::new(image), irq);
    Ok(VirtioMmioDevice::new(core, mem))
}

/// Build a bus-ready 9P device over `svc`, advertising `tag` as the mount
/// tag.
pub fn virtio_9p_device<F: FileService, M: GuestMemory>(
    svc: F,
    tag: &str,
    irq: Box<dyn IrqLine>,
    mem: M,
) -> Result<VirtioMmioDevice<Virtio9p<F>, M>, SetupError> {
    let core = VirtioMmio::new(Virtio9p::new(svc, tag)?, irq);
    Ok(VirtioMmioDevice::new(core, mem))
}

/// Device-tree fragment for one virtio-mmio window.
pub fn device_tree_node(label: &str, base: u64, irq: u32) -> String {
    format!(
        "    {label}: virtio@{base:x} {{\n\
         \x20     compatible = \"virtio,mmio\";\n\
         \x20     interrupt-parent = <&PLIC>;\n\
         \x20     interrupts = <{irq}>;\n\
         \x20     reg = <0x{:x} 0x{:x} 0x{:x} 0x{:x}>;\n\
         \x20   }};\n",
        base >> 32,
        base & 0xffff_ffff,
        VIRTIO_MMIO_WINDOW_SIZE >> 32,
        VIRTIO_MMIO_WINDOW_SIZE & 0xffff_ffff,
    )
}

//! Linux implementations of the kernel backends.
//!
//! Loop devices go through `/dev/loop-control` (`LOOP_CTL_GET_FREE`) and
//! `LOOP_CONFIGURE`, with a `LOOP_SET_FD` + `LOOP_SET_STATUS64` fallback
//! for kernels that predate `LOOP_CONFIGURE`. Verity devices are driven by
//! raw `dm_ioctl` calls on `/dev/mapper/control`; mounts use `nix::mount`.
//!
//! Everything here requires privilege and real devices, so none of it is
//! unit-tested; the driver and engine are tested against the in-memory
//! fakes instead.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use capsule_core::database::{LiveMount, MountScanner, MountedRecord};
use nix::mount::{MntFlags, MsFlags};
use tracing::{debug, warn};

use super::{KernelError, LoopBackend, MountBackend, VerityBackend, VerityTable};

const LOOP_CONTROL: &str = "/dev/loop-control";
const DM_CONTROL: &str = "/dev/mapper/control";
const DM_DEVICE_DIR: &str = "/dev/mapper";

// drivers/block/loop.h
const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
const LOOP_SET_STATUS64: libc::c_ulong = 0x4C04;
const LOOP_CONFIGURE: libc::c_ulong = 0x4C0A;
const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;
const LO_FLAGS_READ_ONLY: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; 64],
    lo_crypt_name: [u8; 64],
    lo_encrypt_key: [u8; 32],
    lo_init: [u64; 2],
}

impl LoopInfo64 {
    fn zeroed() -> Self {
        // SAFETY: LoopInfo64 is a plain-old-data struct; the all-zeroes bit
        // pattern is a valid value for every field.
        unsafe { std::mem::zeroed() }
    }
}

#[repr(C)]
struct LoopConfig {
    fd: u32,
    block_size: u32,
    info: LoopInfo64,
    reserved: [u64; 8],
}

fn last_os_error() -> std::io::Error {
    std::io::Error::last_os_error()
}

/// Loop backend talking to `/dev/loop-control`.
#[derive(Debug, Default)]
pub struct LinuxLoop;

impl LoopBackend for LinuxLoop {
    fn attach(&self, image: &Path, offset: u64, size_limit: u64) -> Result<PathBuf, KernelError> {
        let loop_err = |context, source| KernelError::Loop {
            image: image.to_path_buf(),
            context,
            source,
        };

        let control = OpenOptions::new()
            .read(true)
            .write(true)
            .open(LOOP_CONTROL)
            .map_err(|source| KernelError::LoopExhausted { source })?;

        // SAFETY: control is a valid open fd; LOOP_CTL_GET_FREE takes no
        // argument and returns a free device index or -1.
        let index = unsafe { libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE) };
        if index < 0 {
            return Err(KernelError::LoopExhausted {
                source: last_os_error(),
            });
        }

        let device_path = PathBuf::from(format!("/dev/loop{index}"));
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&device_path)
            .map_err(|e| loop_err("open loop device", e))?;
        let backing = File::open(image).map_err(|e| loop_err("open backing image", e))?;

        let mut info = LoopInfo64::zeroed();
        info.lo_offset = offset;
        info.lo_sizelimit = size_limit;
        info.lo_flags = LO_FLAGS_READ_ONLY;
        let name_bytes = image.as_os_str().as_encoded_bytes();
        let n = name_bytes.len().min(info.lo_file_name.len() - 1);
        info.lo_file_name[..n].copy_from_slice(&name_bytes[..n]);

        let config = LoopConfig {
            fd: backing.as_raw_fd().try_into().unwrap_or(u32::MAX),
            block_size: 0,
            info,
            reserved: [0; 8],
        };

        // SAFETY: device is a valid open fd and config points at a
        // correctly laid out LoopConfig that outlives the call.
        let rc = unsafe { libc::ioctl(device.as_raw_fd(), LOOP_CONFIGURE, &raw const config) };
        if rc == 0 {
            debug!(device = %device_path.display(), image = %image.display(), "loop configured");
            return Ok(device_path);
        }

        let err = last_os_error();
        if !matches!(err.raw_os_error(), Some(libc::EINVAL | libc::ENOTTY)) {
            return Err(loop_err("LOOP_CONFIGURE", err));
        }

        // Older kernel: two-step setup.
        //
        // SAFETY: both fds are valid; LOOP_SET_FD takes the backing fd by
        // value and LOOP_SET_STATUS64 reads a LoopInfo64 that outlives the
        // call.
        let rc = unsafe {
            libc::ioctl(
                device.as_raw_fd(),
                LOOP_SET_FD,
                libc::c_ulong::try_from(backing.as_raw_fd()).unwrap_or_default(),
            )
        };
        if rc != 0 {
            return Err(loop_err("LOOP_SET_FD", last_os_error()));
        }
        // SAFETY: see above.
        let rc = unsafe { libc::ioctl(device.as_raw_fd(), LOOP_SET_STATUS64, &raw const info) };
        if rc != 0 {
            let status_err = last_os_error();
            // SAFETY: device is still a valid fd; clearing the fd undoes
            // the half-finished setup.
            unsafe { libc::ioctl(device.as_raw_fd(), LOOP_CLR_FD) };
            return Err(loop_err("LOOP_SET_STATUS64", status_err));
        }

        debug!(device = %device_path.display(), image = %image.display(), "loop configured (legacy path)");
        Ok(device_path)
    }

    fn detach(&self, device: &Path) -> Result<(), KernelError> {
        let handle = File::open(device).map_err(|source| KernelError::Loop {
            image: device.to_path_buf(),
            context: "open loop device for detach",
            source,
        })?;
        // SAFETY: handle is a valid open fd; LOOP_CLR_FD takes no argument.
        let rc = unsafe { libc::ioctl(handle.as_raw_fd(), LOOP_CLR_FD) };
        if rc != 0 {
            return Err(KernelError::Loop {
                image: device.to_path_buf(),
                context: "LOOP_CLR_FD",
                source: last_os_error(),
            });
        }
        Ok(())
    }
}

// include/uapi/linux/dm-ioctl.h
const DM_VERSION: [u32; 3] = [4, 0, 0];
const DM_NAME_LEN: usize = 128;
const DM_UUID_LEN: usize = 129;
const DM_READONLY_FLAG: u32 = 1;

const DM_DEV_CREATE_CMD: u8 = 3;
const DM_DEV_REMOVE_CMD: u8 = 4;
const DM_DEV_SUSPEND_CMD: u8 = 6;
const DM_TABLE_LOAD_CMD: u8 = 9;

#[repr(C)]
struct DmIoctl {
    version: [u32; 3],
    data_size: u32,
    data_start: u32,
    target_count: u32,
    open_count: i32,
    flags: u32,
    event_nr: u32,
    padding: u32,
    dev: u64,
    name: [u8; DM_NAME_LEN],
    uuid: [u8; DM_UUID_LEN],
    data: [u8; 7],
}

#[repr(C)]
struct DmTargetSpec {
    sector_start: u64,
    length: u64,
    status: i32,
    next: u32,
    target_type: [u8; 16],
}

/// `_IOWR(0xfd, cmd, struct dm_ioctl)`.
const fn dm_ioctl_code(cmd: u8) -> libc::c_ulong {
    const IOC_READ: libc::c_ulong = 2;
    const IOC_WRITE: libc::c_ulong = 1;
    ((IOC_READ | IOC_WRITE) << 30)
        | ((std::mem::size_of::<DmIoctl>() as libc::c_ulong) << 16)
        | (0xfd << 8)
        | cmd as libc::c_ulong
}

fn dm_header(name: &str, flags: u32) -> DmIoctl {
    // SAFETY: DmIoctl is plain-old-data; all-zeroes is valid.
    let mut header: DmIoctl = unsafe { std::mem::zeroed() };
    header.version = DM_VERSION;
    header.data_size = u32::try_from(std::mem::size_of::<DmIoctl>()).unwrap_or(u32::MAX);
    header.data_start = header.data_size;
    header.flags = flags;
    let bytes = name.as_bytes();
    let n = bytes.len().min(DM_NAME_LEN - 1);
    header.name[..n].copy_from_slice(&bytes[..n]);
    header
}

fn dm_run(control: &File, cmd: u8, buffer: &mut [u8], name: &str, context: &'static str)
    -> Result<(), KernelError>
{
    // SAFETY: buffer starts with a DmIoctl header whose data_size covers
    // the whole buffer, and it outlives the call.
    let rc = unsafe { libc::ioctl(control.as_raw_fd(), dm_ioctl_code(cmd), buffer.as_mut_ptr()) };
    if rc != 0 {
        return Err(KernelError::Verity {
            name: name.to_string(),
            context,
            source: last_os_error(),
        });
    }
    Ok(())
}

fn header_to_bytes(header: &DmIoctl) -> Vec<u8> {
    // SAFETY: DmIoctl is repr(C) plain-old-data; viewing it as bytes is
    // well-defined.
    let view = unsafe {
        std::slice::from_raw_parts(
            std::ptr::from_ref(header).cast::<u8>(),
            std::mem::size_of::<DmIoctl>(),
        )
    };
    view.to_vec()
}

/// Verity backend driving `/dev/mapper/control` directly.
#[derive(Debug, Default)]
pub struct LinuxVerity;

impl LinuxVerity {
    fn open_control(name: &str) -> Result<File, KernelError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(DM_CONTROL)
            .map_err(|source| KernelError::Verity {
                name: name.to_string(),
                context: "open /dev/mapper/control",
                source,
            })
    }
}

impl VerityBackend for LinuxVerity {
    fn create(
        &self,
        name: &str,
        data_device: &Path,
        table: &VerityTable,
    ) -> Result<PathBuf, KernelError> {
        let control = Self::open_control(name)?;

        // Step 1: create the (suspended, empty) device.
        let mut create = header_to_bytes(&dm_header(name, DM_READONLY_FLAG));
        dm_run(&control, DM_DEV_CREATE_CMD, &mut create, name, "DM_DEV_CREATE")?;

        // Step 2: load the verity table. The target spec and its parameter
        // string are appended after the header; data_size covers the whole
        // payload.
        let device = data_device.display();
        let params = format!(
            "1 {device} {device} {} {} {} {} {} {} {}",
            table.data_block_size,
            table.hash_block_size,
            table.data_blocks,
            table.hash_start_block,
            table.algorithm,
            table.root_digest,
            table.salt,
        );
        let sectors = table.data_blocks * u64::from(table.data_block_size) / 512;

        let mut spec: DmTargetSpec = {
            // SAFETY: DmTargetSpec is plain-old-data; all-zeroes is valid.
            unsafe { std::mem::zeroed() }
        };
        spec.sector_start = 0;
        spec.length = sectors;
        spec.target_type[..b"verity".len()].copy_from_slice(b"verity");

        let header_size = std::mem::size_of::<DmIoctl>();
        let spec_size = std::mem::size_of::<DmTargetSpec>();
        // Parameter string is nul-terminated and padded to 8 bytes.
        let params_size = (params.len() + 1 + 7) & !7;

        let mut header = dm_header(name, DM_READONLY_FLAG);
        header.data_size = u32::try_from(header_size + spec_size + params_size)
            .map_err(|_| KernelError::Verity {
                name: name.to_string(),
                context: "verity table too large",
                source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
            })?;
        header.target_count = 1;

        let mut load = header_to_bytes(&header);
        // SAFETY: DmTargetSpec is repr(C) plain-old-data.
        let spec_view = unsafe {
            std::slice::from_raw_parts(
                std::ptr::from_ref(&spec).cast::<u8>(),
                spec_size,
            )
        };
        load.extend_from_slice(spec_view);
        load.extend_from_slice(params.as_bytes());
        load.resize(header_size + spec_size + params_size, 0);
        dm_run(&control, DM_TABLE_LOAD_CMD, &mut load, name, "DM_TABLE_LOAD")?;

        // Step 3: resume activates the loaded table.
        let mut resume = header_to_bytes(&dm_header(name, 0));
        if let Err(e) = dm_run(&control, DM_DEV_SUSPEND_CMD, &mut resume, name, "DM_DEV_RESUME") {
            let _ = self.remove(name);
            return Err(e);
        }

        debug!(name, "verity device created");
        Ok(Path::new(DM_DEVICE_DIR).join(name))
    }

    fn remove(&self, name: &str) -> Result<(), KernelError> {
        let control = Self::open_control(name)?;
        let mut remove = header_to_bytes(&dm_header(name, 0));
        dm_run(&control, DM_DEV_REMOVE_CMD, &mut remove, name, "DM_DEV_REMOVE")
    }
}

/// Mount backend using `nix::mount`.
#[derive(Debug, Default)]
pub struct LinuxMount;

impl MountBackend for LinuxMount {
    fn mount(&self, device: &Path, target: &Path, fstype: &str) -> Result<(), KernelError> {
        let flags =
            MsFlags::MS_RDONLY | MsFlags::MS_NOATIME | MsFlags::MS_NODEV | MsFlags::MS_DIRSYNC;
        nix::mount::mount(Some(device), target, Some(fstype), flags, None::<&str>).map_err(
            |errno| KernelError::Mount {
                target: target.to_path_buf(),
                context: "mount",
                source: std::io::Error::from_raw_os_error(errno as i32),
            },
        )
    }

    fn unmount(&self, target: &Path) -> Result<(), KernelError> {
        nix::mount::umount2(target, MntFlags::empty()).map_err(|errno| KernelError::Mount {
            target: target.to_path_buf(),
            context: "umount",
            source: std::io::Error::from_raw_os_error(errno as i32),
        })
    }
}

/// Startup reconciliation scanner: reassembles capsule mounts from
/// `/proc/self/mountinfo`, the loop sysfs tree and the device-mapper sysfs
/// tree.
#[derive(Debug)]
pub struct LinuxMountScanner {
    capsule_root: PathBuf,
}

impl LinuxMountScanner {
    /// A scanner that only reports mounts under `capsule_root`.
    #[must_use]
    pub fn new(capsule_root: impl Into<PathBuf>) -> Self {
        Self {
            capsule_root: capsule_root.into(),
        }
    }

    fn live_mount(&self, mount_point: PathBuf, device: &str) -> Option<LiveMount> {
        let stem = mount_point.file_name()?.to_str()?;
        let (name, version) = parse_versioned_name(stem)?;

        let (loop_device, verity_device) = if device.starts_with("/dev/loop") {
            (PathBuf::from(device), String::new())
        } else {
            let dm_node = dm_node_for(device)?;
            let verity_name = read_sysfs(&format!("/sys/block/{dm_node}/dm/name"))?;
            let slave = first_slave(&dm_node)?;
            (PathBuf::from(format!("/dev/{slave}")), verity_name)
        };

        let loop_name = loop_device.file_name()?.to_str()?.to_string();
        let backing = read_sysfs(&format!("/sys/block/{loop_name}/loop/backing_file"))?;

        Some(LiveMount {
            package_name: name.to_string(),
            record: MountedRecord {
                version,
                loop_device,
                image_path: PathBuf::from(backing),
                mount_point,
                verity_device,
            },
        })
    }
}

impl MountScanner for LinuxMountScanner {
    fn scan(&self) -> Result<Vec<LiveMount>, String> {
        let text = std::fs::read_to_string("/proc/self/mountinfo")
            .map_err(|e| format!("cannot read mountinfo: {e}"))?;

        let mut mounts = Vec::new();
        for line in text.lines() {
            let Some((mount_point, device)) = parse_mountinfo_line(line) else {
                continue;
            };
            if !mount_point.starts_with(&self.capsule_root) {
                continue;
            }
            match self.live_mount(mount_point, &device) {
                Some(live) => mounts.push(live),
                None => warn!(line, "unparseable capsule mount, leaving it alone"),
            }
        }
        Ok(mounts)
    }
}

/// Extracts (mount point, source device) from one mountinfo line.
///
/// Format: `id parent major:minor root MOUNT_POINT opts [optional...] -
/// fstype SOURCE superopts`, with octal escapes in path fields.
fn parse_mountinfo_line(line: &str) -> Option<(PathBuf, String)> {
    let (head, tail) = line.split_once(" - ")?;
    let mount_point = head.split(' ').nth(4)?;
    let source = tail.split(' ').nth(1)?;
    Some((
        PathBuf::from(unescape_octal(mount_point)),
        unescape_octal(source),
    ))
}

/// Splits `<name>@<version>` mount-point stems.
fn parse_versioned_name(stem: &str) -> Option<(&str, u64)> {
    let (name, version) = stem.rsplit_once('@')?;
    version.parse().ok().map(|v| (name, v))
}

/// Undoes mountinfo's `\ooo` escaping (space, tab, newline, backslash).
fn unescape_octal(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let mut digits = String::new();
        while digits.len() < 3 {
            match chars.peek() {
                Some(d) if d.is_digit(8) => {
                    digits.push(*d);
                    chars.next();
                }
                _ => break,
            }
        }
        let decoded = (digits.len() == 3)
            .then(|| u32::from_str_radix(&digits, 8).ok())
            .flatten()
            .and_then(char::from_u32);
        match decoded {
            Some(decoded) => out.push(decoded),
            None => {
                // Not a full escape: keep the text as it appeared.
                out.push('\\');
                out.push_str(&digits);
            }
        }
    }
    out
}

/// Resolves `/dev/mapper/<name>` or `/dev/dm-N` to its `dm-N` node name.
fn dm_node_for(device: &str) -> Option<String> {
    if let Some(node) = device.strip_prefix("/dev/").filter(|d| d.starts_with("dm-")) {
        return Some(node.to_string());
    }
    let wanted = device.strip_prefix("/dev/mapper/")?;
    for entry in std::fs::read_dir("/sys/block").ok()? {
        let entry = entry.ok()?;
        let node = entry.file_name().to_str()?.to_string();
        if !node.starts_with("dm-") {
            continue;
        }
        if read_sysfs(&format!("/sys/block/{node}/dm/name")).as_deref() == Some(wanted) {
            return Some(node);
        }
    }
    None
}

/// First slave block device of a device-mapper node (the loop device under
/// a verity target).
fn first_slave(dm_node: &str) -> Option<String> {
    let mut slaves: Vec<String> = std::fs::read_dir(format!("/sys/block/{dm_node}/slaves"))
        .ok()?
        .filter_map(|entry| Some(entry.ok()?.file_name().to_str()?.to_string()))
        .collect();
    slaves.sort();
    slaves.into_iter().next()
}

fn read_sysfs(path: &str) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim_end().to_string())
}

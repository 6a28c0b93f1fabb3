//! Mount-wide fanotify subscription and the raw record format it delivers.

use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use compio::net::PollFd;
use nix::errno::Errno;
use nix::sys::fanotify::{EventFFlags, Fanotify as Group, InitFlags, MarkFlags, MaskFlags};
use snafu::prelude::*;
use tracing::{debug, warn};

use crate::filesystem::sys::{SyscallError, retry_transient};

pub const FANOTIFY_METADATA_VERSION: u8 = 3;

/// Directory entries were added, removed or renamed. This mask bit comes
/// from a kernel patch and is not part of the upstream ABI.
pub const FAN_MODIFY_DIR: u64 = 0x0004_0000;
pub const FAN_Q_OVERFLOW: u64 = 0x0000_4000;
pub const FAN_ONDIR: u64 = 0x4000_0000;
pub const FAN_NOFD: RawFd = -1;

/// Size of `struct fanotify_event_metadata`.
pub const METADATA_LEN: usize = 24;

/// One record as laid out in the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    pub version: u8,
    pub mask: u64,
    pub fd: RawFd,
}

impl EventRecord {
    /// Takes ownership of the record's descriptor.
    ///
    /// # Safety
    ///
    /// `fd` must be a descriptor the kernel handed out with this record that
    /// nothing else owns.
    pub unsafe fn into_notification(self) -> Notification<OwnedFd> {
        let object = (self.fd >= 0).then(|| unsafe { OwnedFd::from_raw_fd(self.fd) });
        Notification {
            version: self.version,
            mask: self.mask,
            object,
        }
    }
}

/// Splits a read buffer into records.
///
/// Parsing stops at the first record whose length does not fit the
/// remaining buffer; the descriptors of the records returned are the
/// caller's to close.
pub fn parse_records(buffer: &[u8]) -> Result<Vec<EventRecord>, FanotifyError> {
    let mut records = Vec::new();
    let mut offset = 0;
    while buffer.len() - offset >= METADATA_LEN {
        let header = &buffer[offset..offset + METADATA_LEN];
        let event_len = u32::from_ne_bytes([header[0], header[1], header[2], header[3]]) as usize;
        ensure!(
            event_len >= METADATA_LEN && event_len <= buffer.len() - offset,
            TruncatedSnafu {
                offset,
                event_len,
                available: buffer.len() - offset,
            }
        );
        let mut mask = [0u8; 8];
        mask.copy_from_slice(&header[8..16]);
        records.push(EventRecord {
            version: header[4],
            mask: u64::from_ne_bytes(mask),
            fd: RawFd::from_ne_bytes([header[16], header[17], header[18], header[19]]),
        });
        offset += event_len;
    }
    if offset != buffer.len() {
        warn!(
            "Ignoring {} trailing bytes after the last fanotify record",
            buffer.len() - offset
        );
    }
    Ok(records)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    DirectoryModified,
    Overflow,
    Other,
}

/// A decoded record owning its object handle, if any.
#[derive(Debug)]
pub struct Notification<O> {
    pub version: u8,
    pub mask: u64,
    pub object: Option<O>,
}

impl<O> Notification<O> {
    pub fn kind(&self) -> NotificationKind {
        if self.mask & FAN_MODIFY_DIR != 0 && self.object.is_some() {
            NotificationKind::DirectoryModified
        } else if self.mask & FAN_Q_OVERFLOW != 0 {
            NotificationKind::Overflow
        } else {
            NotificationKind::Other
        }
    }
}

pub type Batch<O> = Vec<Notification<O>>;

/// A non-blocking fanotify group read on the runtime's own thread.
///
/// Records the watcher has not read yet stay in the kernel queue, so a slow
/// consumer ends in a queue overflow record rather than unbounded memory.
pub struct Fanotify {
    group: PollFd<Group>,
    buffer: Vec<u8>,
}

impl Fanotify {
    pub fn init(unlimited_queue: bool, buffer_size: usize) -> Result<Self, FanotifyError> {
        let mut flags = InitFlags::FAN_CLASS_NOTIF | InitFlags::FAN_CLOEXEC | InitFlags::FAN_NONBLOCK;
        if unlimited_queue {
            flags |= InitFlags::FAN_UNLIMITED_QUEUE;
        }
        let event_flags = EventFFlags::O_RDONLY | EventFFlags::O_CLOEXEC | EventFFlags::O_LARGEFILE;
        let group =
            retry_transient("fanotify_init", || Group::init(flags, event_flags)).context(InitSnafu)?;
        let group = PollFd::new(group).context(RegisterSnafu)?;
        debug!("Initialised fanotify (unlimited queue: {unlimited_queue})");
        Ok(Self {
            group,
            buffer: vec![0; buffer_size.max(METADATA_LEN)],
        })
    }

    /// Subscribes to directory modifications on the whole mount containing
    /// `root`.
    pub fn mark_mount(&self, root: BorrowedFd<'_>) -> Result<(), FanotifyError> {
        let mask = MaskFlags::from_bits_retain(FAN_MODIFY_DIR | FAN_ONDIR);
        retry_transient("fanotify_mark", || {
            self.group.mark(
                MarkFlags::FAN_MARK_ADD | MarkFlags::FAN_MARK_MOUNT,
                mask,
                root,
                None::<&Path>,
            )
        })
        .context(MarkSnafu)
    }

    /// Waits until the group is readable and reads one buffer's worth of
    /// records.
    pub async fn read_batch(&mut self) -> Result<Batch<OwnedFd>, FanotifyError> {
        let len = loop {
            self.group.read_ready().await.context(WaitSnafu)?;
            match nix::unistd::read(self.group.as_fd(), &mut self.buffer) {
                Ok(len) => break len,
                Err(Errno::EAGAIN | Errno::EINTR) => continue,
                Err(errno) => return Err(SyscallError::new("read", errno)).context(ReadSnafu),
            }
        };

        let records = parse_records(&self.buffer[..len])?;
        debug!("Read {} fanotify records", records.len());
        Ok(records
            .into_iter()
            .map(|record| unsafe { record.into_notification() })
            .collect())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FanotifyError {
    #[snafu(display("Failed to create the fanotify group"))]
    Init { source: SyscallError },
    #[snafu(display("Failed to register the fanotify group with the runtime"))]
    Register { source: std::io::Error },
    #[snafu(display("Failed to mark the mount for directory notifications"))]
    Mark { source: SyscallError },
    #[snafu(display("Failed waiting for notifications"))]
    Wait { source: std::io::Error },
    #[snafu(display("Failed to read notifications"))]
    Read { source: SyscallError },
    #[snafu(display(
        "Record at offset {offset} claims {event_len} bytes but only {available} are available"
    ))]
    Truncated {
        offset: usize,
        event_len: usize,
        available: usize,
    },
}

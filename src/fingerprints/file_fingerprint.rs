use bincode::{Decode, Encode};

/// Timestamps closer than this are considered equal. Filesystems that store
/// coarser timestamps than nanoseconds round differently across stat paths.
pub const TIME_EPSILON: f64 = 1e-4;

/// Size and timestamps of an object, used to decide whether its content may
/// have changed since it was last looked at.
#[derive(Debug, Clone, Copy, PartialEq, Default, Encode, Decode)]
pub struct FileFingerprint {
    pub size: u64,
    pub mtime: f64,
    pub ctime: f64,
}

impl FileFingerprint {
    /// Converts a `timespec`-style pair into fractional seconds.
    pub fn seconds(seconds: i64, nanoseconds: i64) -> f64 {
        seconds as f64 + nanoseconds as f64 / 1e9
    }

    pub fn diverges_from(&self, other: &FileFingerprint) -> bool {
        self.size != other.size
            || (self.mtime - other.mtime).abs() > TIME_EPSILON
            || (self.ctime - other.ctime).abs() > TIME_EPSILON
    }
}

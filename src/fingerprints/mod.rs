mod file_fingerprint;
mod fingerprint_store;

pub use file_fingerprint::FileFingerprint;
pub use fingerprint_store::FingerprintStore;

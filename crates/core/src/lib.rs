//! Core emulator primitives and traits.

pub mod logging;
pub mod memmap;
pub mod scheduler;

/// Description of a mount point (media slot) that a system supports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPointInfo {
    /// Unique identifier for this mount point (e.g., "BIOS", "Cartridge")
    pub id: String,
    /// User-friendly name for display
    pub name: String,
    /// File extensions accepted by this mount point
    pub extensions: Vec<String>,
    /// Whether this mount point is required for the system to function
    pub required: bool,
}

/// A high-level System trait tying components together.
pub trait System {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Reset the machine. `powering_up` distinguishes a cold start from a
    /// soft reset.
    fn reset(&mut self, powering_up: bool);

    /// Run one video frame and return the CPU cycles it consumed.
    fn run_frame(&mut self) -> Result<u32, Self::Error>;

    /// Capture the machine state. Media contents (BIOS, discs) are not
    /// included, only identifying hashes.
    fn take_snapshot(&self) -> Result<Vec<u8>, Self::Error>;

    /// Restore a snapshot taken with the same media mounted.
    fn apply_snapshot(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    fn supports_snapshots(&self) -> bool {
        false
    }

    /// Get the list of mount points this system supports
    fn mount_points(&self) -> Vec<MountPointInfo>;

    /// Load media into a specific mount point
    fn mount(&mut self, mount_point_id: &str, data: &[u8]) -> Result<(), Self::Error>;

    /// Unload media from a specific mount point
    fn unmount(&mut self, mount_point_id: &str) -> Result<(), Self::Error>;

    /// Check if a mount point has media loaded
    fn is_mounted(&self, mount_point_id: &str) -> bool;
}

use std::path::Path;
use std::time::Duration;

use crate::memory::MemorySize;
use crate::process::{execute, ProcessSpec};
use crate::qemu::SUSPEND_TAG;
use crate::{Result, VmError};

const QEMU_IMG_TIMEOUT: Duration = Duration::from_secs(60);

/// qemu-img access for an instance's disk image, injected so tests can
/// run without the real tool.
pub trait ImageOps: Send + Sync {
    /// Whether the image currently holds a suspended machine snapshot.
    fn has_suspend_snapshot(&self, image: &Path) -> bool;

    /// Drop the suspend snapshot from the image.
    fn delete_suspend_snapshot(&self, image: &Path) -> Result<()>;

    /// Grow the image to `new_size`.
    fn resize(&self, image: &Path, new_size: MemorySize) -> Result<()>;
}

/// Production [`ImageOps`] backed by the `qemu-img` binary.
pub struct QemuImg;

impl QemuImg {
    fn run(&self, args: Vec<String>, image: &Path) -> Result<String> {
        let output = execute(&ProcessSpec::new("qemu-img", args), QEMU_IMG_TIMEOUT);
        if !output.state.completed_normally() {
            return Err(VmError::io(
                image,
                std::io::Error::other(format!(
                    "qemu-img failed: {}",
                    first_line(&output.stderr_utf8())
                )),
            ));
        }
        Ok(output.stdout_utf8())
    }
}

impl ImageOps for QemuImg {
    fn has_suspend_snapshot(&self, image: &Path) -> bool {
        let args = vec![
            "snapshot".to_string(),
            "-l".to_string(),
            image.display().to_string(),
        ];
        match self.run(args, image) {
            Ok(listing) => listing_contains_tag(&listing, SUSPEND_TAG),
            Err(e) => {
                // An unreadable listing means no usable snapshot.
                tracing::warn!(image = %image.display(), "could not list snapshots: {e}");
                false
            }
        }
    }

    fn delete_suspend_snapshot(&self, image: &Path) -> Result<()> {
        let args = vec![
            "snapshot".to_string(),
            "-d".to_string(),
            SUSPEND_TAG.to_string(),
            image.display().to_string(),
        ];
        self.run(args, image).map(|_| ())
    }

    fn resize(&self, image: &Path, new_size: MemorySize) -> Result<()> {
        // A readable `info` confirms the image is a usable qcow2 before
        // growing it.
        let info_args = vec![
            "info".to_string(),
            "--output=json".to_string(),
            image.display().to_string(),
        ];
        self.run(info_args, image)?;

        let args = vec![
            "resize".to_string(),
            image.display().to_string(),
            new_size.as_bytes().to_string(),
        ];
        self.run(args, image).map(|_| ())
    }
}

/// Scan `qemu-img snapshot -l` output for a snapshot tag. The listing is
/// a header followed by `ID TAG VM_SIZE DATE VM_CLOCK` rows.
pub fn listing_contains_tag(listing: &str, tag: &str) -> bool {
    listing
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("ID"))
        .skip(1)
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|candidate| candidate == tag)
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("").trim()
}

//! Writing a loaded image's segments back to a file.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use tracing::debug;

use crate::binary::{Binary, Range};
use crate::error::{Error, Result};

impl Binary {
    /// Writes every segment's current (possibly patched) contents to a new
    /// file at its recorded file offset.
    ///
    /// The destination is created or truncated. Segments are written
    /// independently, producing a sparse file matching the original layout.
    /// Any short write is fatal.
    pub fn store<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut file = File::create(path).map_err(|e| Error::FileWrite {
            path: path.to_path_buf(),
            source: e,
        })?;

        for seg in self.segments() {
            if seg.filesize == 0 {
                continue;
            }
            let bytes = self.resolve_addr(Range::new(seg.vmaddr, seg.filesize))?;
            file.seek(SeekFrom::Start(seg.fileoff))
                .and_then(|_| file.write_all(bytes))
                .map_err(|e| Error::FileWrite {
                    path: path.to_path_buf(),
                    source: e,
                })?;
            debug!(segment = seg.name(), fileoff = seg.fileoff, size = seg.filesize, "stored");
        }
        Ok(())
    }
}

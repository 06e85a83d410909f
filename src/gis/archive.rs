//! Bounded reads from uploaded ZIP archives (KMZ, zipped shapefiles).

use std::io::{Cursor, Read};

use crate::error::GisError;

/// Maximum decompressed bytes to read from a single archive member.
pub const MAX_MEMBER_BYTES: u64 = 256 * 1024 * 1024;

pub type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

pub fn open(bytes: &[u8]) -> Result<Archive<'_>, GisError> {
    Ok(zip::ZipArchive::new(Cursor::new(bytes))?)
}

/// Resource-fork and macOS metadata entries carry no data.
pub fn is_junk(name: &str) -> bool {
    let base = name.rsplit('/').next().unwrap_or(name);
    name.starts_with("__MACOSX/") || name.contains("/__MACOSX/") || base.starts_with("._")
}

/// File member names, in archive order, without directories or junk.
pub fn member_names(archive: &Archive<'_>) -> Vec<String> {
    archive
        .file_names()
        .filter(|n| !n.ends_with('/') && !is_junk(n))
        .map(str::to_string)
        .collect()
}

pub fn read_member(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, GisError> {
    let entry = archive.by_name(name)?;
    let mut out = Vec::new();
    entry.take(MAX_MEMBER_BYTES + 1).read_to_end(&mut out)?;
    if out.len() as u64 > MAX_MEMBER_BYTES {
        return Err(GisError::MemberTooLarge {
            name: name.to_string(),
            limit: MAX_MEMBER_BYTES,
        });
    }
    Ok(out)
}

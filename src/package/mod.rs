/// Package codec: writes and reads the archive body.
///
/// The body is a framed record stream wrapped in the compression envelope.
/// Each record is `(relative path, item kind, [length, payload])`; a record
/// with a null path terminates the stream and is the only legal EOF.
///
/// Create is two-pass: records go to an anonymous temp file first so the
/// envelope header can carry the exact uncompressed length ahead of the
/// body. Extract streams records straight out of the decompressor and
/// refuses any path that would resolve outside the target root.
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::envelope;
use crate::error::{Result, SetupError};
use crate::wire::{FrameReader, FrameWriter};

/// Hard cap on the encoded byte length of a record path.
pub const MAX_PATH_LEN: usize = 32_767;

/// Archive record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    File = 0,
    Folder = 1,
}

impl ItemKind {
    fn from_wire(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ItemKind::File),
            1 => Ok(ItemKind::Folder),
            other => Err(SetupError::InvalidFormat(format!(
                "invalid item kind: {other}"
            ))),
        }
    }
}

/// Filesystem modes applied to extracted entries on POSIX systems.
#[derive(Debug, Clone, Copy)]
pub struct ExtractOptions {
    pub dir_mode: u32,
    pub file_mode: u32,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            dir_mode: 0o755,
            file_mode: 0o644,
        }
    }
}

/// Counters from a completed extraction.
#[derive(Debug, Default)]
pub struct ExtractStats {
    pub files: usize,
    pub folders: usize,
    pub bytes: u64,
}

/// Pack the tree under `base` into `out`.
///
/// Directory entries are visited depth-first in name order, so identical
/// trees produce identical archives. Returns the uncompressed body length,
/// which also lands in the envelope header.
pub fn create(base: &Path, out: &Path, cancel: &CancellationToken) -> Result<u64> {
    if !base.is_dir() {
        return Err(SetupError::Usage(format!(
            "package base is not a directory: {}",
            base.display()
        )));
    }

    let mut body = FrameWriter::new(BufWriter::new(tempfile::tempfile()?));
    body.write_version()?;
    pack_dir(base, base, &mut body, cancel)?;
    // Null-path sentinel: the one legal end of stream.
    body.write_string_opt(None)?;
    body.flush()?;

    let mut temp = body
        .into_inner()
        .into_inner()
        .map_err(|e| SetupError::Io(e.into_error()))?;
    let uncompressed_len = temp.seek(SeekFrom::End(0))?;
    temp.seek(SeekFrom::Start(0))?;

    let output = File::create(out)?;
    envelope::write_envelope(&mut temp, output, uncompressed_len)?;

    debug!(
        package = %out.display(),
        uncompressed_len,
        "Package written"
    );
    Ok(uncompressed_len)
}

/// Emit records for one directory level, recursing into subdirectories.
fn pack_dir<W: Write>(
    root: &Path,
    dir: &Path,
    body: &mut FrameWriter<W>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        if cancel.is_cancelled() {
            return Err(SetupError::Cancelled);
        }

        let path = entry.path();
        let file_type = entry.file_type()?;
        let rel = wire_path(root, &path)?;

        if file_type.is_dir() {
            body.write_string(&rel)?;
            body.write_enum(ItemKind::Folder as u8)?;
            pack_dir(root, &path, body, cancel)?;
        } else if file_type.is_file() {
            let mut file = File::open(&path)?;
            let len = file.metadata()?.len();

            body.write_string(&rel)?;
            body.write_enum(ItemKind::File as u8)?;
            body.write_i64(len as i64)?;
            let copied = io::copy(&mut std::io::Read::by_ref(&mut file).take(len), body.writer())?;
            if copied != len {
                return Err(SetupError::Io(io::Error::other(format!(
                    "file truncated while packaging: {}",
                    path.display()
                ))));
            }
        } else {
            warn!(path = %path.display(), "Skipping special filesystem entry");
        }
    }
    Ok(())
}

/// Relative forward-slash wire form of `path`, which must live under `root`.
fn wire_path(root: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(root).map_err(|_| {
        SetupError::Usage(format!(
            "entry is not under the package base: {}",
            path.display()
        ))
    })?;

    let mut parts = Vec::new();
    for component in rel.components() {
        let part = component
            .as_os_str()
            .to_str()
            .ok_or_else(|| SetupError::Usage(format!("non-UTF-8 path: {}", path.display())))?;
        parts.push(part);
    }
    let wire = parts.join("/");
    if wire.len() > MAX_PATH_LEN {
        return Err(SetupError::Usage(format!("path too long: {wire}")));
    }
    Ok(wire)
}

/// Unpack an archive stream into `target`.
///
/// The target root is created and canonicalized first; every record path is
/// sanitized and re-checked against that root before anything is written.
/// Duplicate paths overwrite earlier ones; ordering on the wire is the
/// ordering on disk.
pub fn extract<R: Read>(
    source: R,
    target: &Path,
    options: &ExtractOptions,
    cancel: &CancellationToken,
) -> Result<ExtractStats> {
    fs::create_dir_all(target)?;
    let root = target.canonicalize()?;

    let (header, decompressor) = envelope::read_envelope(source)?;
    if let Some(len) = header.uncompressed_len {
        debug!(uncompressed_len = len, "Extracting package");
    }

    let mut body = FrameReader::new(BufReader::new(decompressor));
    body.read_version()?;

    let mut stats = ExtractStats::default();
    loop {
        if cancel.is_cancelled() {
            return Err(SetupError::Cancelled);
        }

        let path = match body.read_string_opt(MAX_PATH_LEN)? {
            Some(path) => path,
            None => break,
        };
        let kind = ItemKind::from_wire(body.read_enum(0..=1)?)?;

        let rel = sanitize_path(&path)?;
        let dest = root.join(&rel);
        if !dest.starts_with(&root) {
            return Err(SetupError::PathTraversal(path));
        }

        match kind {
            ItemKind::Folder => {
                fs::create_dir_all(&dest)?;
                set_mode(&dest, options.dir_mode)?;
                stats.folders += 1;
            }
            ItemKind::File => {
                let len = body.read_i64()?;
                if len < 0 {
                    return Err(SetupError::InvalidFormat(format!(
                        "negative file length: {len}"
                    )));
                }
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }

                let mut file = File::create(&dest)?;
                let copied = io::copy(&mut body.reader().take(len as u64), &mut file)
                    .map_err(|e| match e.kind() {
                        io::ErrorKind::InvalidData => {
                            SetupError::InvalidFormat(format!("corrupt stream: {e}"))
                        }
                        _ => SetupError::Io(e),
                    })?;
                if copied != len as u64 {
                    return Err(SetupError::InvalidFormat(
                        "truncated file payload".to_string(),
                    ));
                }
                file.flush()?;
                set_mode(&dest, options.file_mode)?;
                stats.files += 1;
                stats.bytes += len as u64;
            }
        }
    }

    debug!(
        files = stats.files,
        folders = stats.folders,
        bytes = stats.bytes,
        "Extraction complete"
    );
    Ok(stats)
}

/// Validate a record path and turn it into a relative `PathBuf`.
///
/// Legal paths are relative, forward-slash separated, free of `..`, drive
/// anchors, backslashes, NUL, and empty or `.` components.
fn sanitize_path(path: &str) -> Result<PathBuf> {
    if path.is_empty() {
        return Err(SetupError::InvalidFormat("empty record path".to_string()));
    }
    if path.contains('\0') {
        return Err(SetupError::InvalidFormat(
            "NUL byte in record path".to_string(),
        ));
    }
    if path.starts_with('/') {
        return Err(SetupError::PathTraversal(path.to_string()));
    }

    let mut rel = PathBuf::new();
    for component in path.split('/') {
        match component {
            "" | "." => {
                return Err(SetupError::InvalidFormat(format!(
                    "non-canonical record path: {path}"
                )))
            }
            ".." => return Err(SetupError::PathTraversal(path.to_string())),
            part if part.contains(':') || part.contains('\\') => {
                return Err(SetupError::PathTraversal(path.to_string()))
            }
            part => rel.push(part),
        }
    }
    Ok(rel)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    /// Build a sample tree: a.txt, empty/, sub/b.bin.
    fn sample_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.bin"), [0x00u8, 0x01, 0x02]).unwrap();
        dir
    }

    /// Hand-craft an archive from raw (path, kind, payload) records.
    fn build_archive(records: &[(&str, ItemKind, &[u8])]) -> Vec<u8> {
        let mut body = FrameWriter::new(Vec::new());
        body.write_version().unwrap();
        for (path, kind, payload) in records {
            body.write_string(path).unwrap();
            body.write_enum(*kind as u8).unwrap();
            if *kind == ItemKind::File {
                body.write_i64(payload.len() as i64).unwrap();
                body.writer().extend_from_slice(payload);
            }
        }
        body.write_string_opt(None).unwrap();
        let bytes = body.into_inner();

        let mut out = Vec::new();
        envelope::write_envelope(&mut Cursor::new(&bytes), &mut out, bytes.len() as u64).unwrap();
        out
    }

    #[test]
    fn test_create_extract_roundtrip() {
        let source = sample_tree();
        let pkg_dir = TempDir::new().unwrap();
        let pkg = pkg_dir.path().join("tree.pkg");

        let len = create(source.path(), &pkg, &token()).unwrap();
        assert!(len > 0);

        let target = TempDir::new().unwrap();
        let stats = extract(
            File::open(&pkg).unwrap(),
            target.path(),
            &ExtractOptions::default(),
            &token(),
        )
        .unwrap();

        assert_eq!(stats.files, 2);
        assert_eq!(stats.folders, 2);
        assert_eq!(stats.bytes, 8);
        assert_eq!(fs::read(target.path().join("a.txt")).unwrap(), b"hello");
        assert_eq!(
            fs::read(target.path().join("sub/b.bin")).unwrap(),
            [0x00, 0x01, 0x02]
        );
        assert!(target.path().join("empty").is_dir());
    }

    #[test]
    fn test_create_is_deterministic() {
        let source = sample_tree();
        let out = TempDir::new().unwrap();
        let a = out.path().join("a.pkg");
        let b = out.path().join("b.pkg");
        create(source.path(), &a, &token()).unwrap();
        create(source.path(), &b, &token()).unwrap();
        assert_eq!(fs::read(a).unwrap(), fs::read(b).unwrap());
    }

    #[test]
    fn test_zero_length_file_preserved() {
        let source = TempDir::new().unwrap();
        fs::write(source.path().join("nothing"), b"").unwrap();
        let out = TempDir::new().unwrap();
        let pkg = out.path().join("zero.pkg");
        create(source.path(), &pkg, &token()).unwrap();

        let target = TempDir::new().unwrap();
        let stats = extract(
            File::open(&pkg).unwrap(),
            target.path(),
            &ExtractOptions::default(),
            &token(),
        )
        .unwrap();
        assert_eq!(stats.files, 1);
        assert_eq!(stats.bytes, 0);
        assert_eq!(fs::read(target.path().join("nothing")).unwrap(), b"");
    }

    #[test]
    fn test_traversal_dotdot_rejected() {
        let archive = build_archive(&[("../evil", ItemKind::File, b"boom")]);
        let target = TempDir::new().unwrap();
        let result = extract(
            Cursor::new(archive),
            &target.path().join("x"),
            &ExtractOptions::default(),
            &token(),
        );
        assert!(matches!(result, Err(SetupError::PathTraversal(_))));
        assert!(!target.path().join("evil").exists());
    }

    #[test]
    fn test_traversal_absolute_rejected() {
        let archive = build_archive(&[("/etc/evil", ItemKind::File, b"boom")]);
        let target = TempDir::new().unwrap();
        let result = extract(
            Cursor::new(archive),
            target.path(),
            &ExtractOptions::default(),
            &token(),
        );
        assert!(matches!(result, Err(SetupError::PathTraversal(_))));
    }

    #[test]
    fn test_traversal_drive_anchor_rejected() {
        for path in ["C:/evil", "a\\b"] {
            let archive = build_archive(&[(path, ItemKind::File, b"boom")]);
            let target = TempDir::new().unwrap();
            let result = extract(
                Cursor::new(archive),
                target.path(),
                &ExtractOptions::default(),
                &token(),
            );
            assert!(matches!(result, Err(SetupError::PathTraversal(_))), "{path}");
        }
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut body = FrameWriter::new(Vec::new());
        body.write_version().unwrap();
        body.write_string("f").unwrap();
        body.write_enum(ItemKind::File as u8).unwrap();
        body.write_i64(-1).unwrap();
        let bytes = body.into_inner();
        let mut archive = Vec::new();
        envelope::write_envelope(&mut Cursor::new(&bytes), &mut archive, bytes.len() as u64)
            .unwrap();

        let target = TempDir::new().unwrap();
        let result = extract(
            Cursor::new(archive),
            target.path(),
            &ExtractOptions::default(),
            &token(),
        );
        assert!(matches!(result, Err(SetupError::InvalidFormat(_))));
    }

    #[test]
    fn test_missing_sentinel_rejected() {
        // Well-formed record but no null-path terminator.
        let mut body = FrameWriter::new(Vec::new());
        body.write_version().unwrap();
        body.write_string("f").unwrap();
        body.write_enum(ItemKind::File as u8).unwrap();
        body.write_i64(0).unwrap();
        let bytes = body.into_inner();
        let mut archive = Vec::new();
        envelope::write_envelope(&mut Cursor::new(&bytes), &mut archive, bytes.len() as u64)
            .unwrap();

        let target = TempDir::new().unwrap();
        let result = extract(
            Cursor::new(archive),
            target.path(),
            &ExtractOptions::default(),
            &token(),
        );
        assert!(matches!(result, Err(SetupError::InvalidFormat(_))));
    }

    #[test]
    fn test_duplicate_path_overwrites() {
        let archive = build_archive(&[
            ("f.txt", ItemKind::File, b"first"),
            ("f.txt", ItemKind::File, b"second"),
        ]);
        let target = TempDir::new().unwrap();
        extract(
            Cursor::new(archive),
            target.path(),
            &ExtractOptions::default(),
            &token(),
        )
        .unwrap();
        assert_eq!(fs::read(target.path().join("f.txt")).unwrap(), b"second");
    }

    #[test]
    fn test_tampered_package_rejected() {
        let source = sample_tree();
        let out = TempDir::new().unwrap();
        let pkg = out.path().join("t.pkg");
        create(source.path(), &pkg, &token()).unwrap();

        let mut bytes = fs::read(&pkg).unwrap();
        // Flip a byte inside the compressed region, past the 10-byte header.
        let mid = 10 + (bytes.len() - 10) / 2;
        bytes[mid] ^= 0xFF;

        let target = TempDir::new().unwrap();
        let result = extract(
            Cursor::new(bytes),
            target.path(),
            &ExtractOptions::default(),
            &token(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_cancelled_extraction() {
        let archive = build_archive(&[("f.txt", ItemKind::File, b"data")]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let target = TempDir::new().unwrap();
        let result = extract(
            Cursor::new(archive),
            target.path(),
            &ExtractOptions::default(),
            &cancel,
        );
        assert!(matches!(result, Err(SetupError::Cancelled)));
    }

    #[test]
    fn test_sanitize_path_rules() {
        assert!(sanitize_path("a/b/c.txt").is_ok());
        assert!(matches!(
            sanitize_path("a/../b"),
            Err(SetupError::PathTraversal(_))
        ));
        assert!(matches!(
            sanitize_path(""),
            Err(SetupError::InvalidFormat(_))
        ));
        assert!(matches!(
            sanitize_path("a//b"),
            Err(SetupError::InvalidFormat(_))
        ));
        assert!(matches!(
            sanitize_path("./a"),
            Err(SetupError::InvalidFormat(_))
        ));
    }
}

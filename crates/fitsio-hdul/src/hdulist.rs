//! The HDU list: a FITS file as an ordered, editable sequence of HDUs.
//!
//! Opening a file scans it once and keeps only headers and offsets; payloads
//! are read on first access. [`HduList::flush`] picks the cheapest write that
//! is safe for the open mode:
//!
//! * `Append`: new HDUs are written after the end of the file.
//! * `Update`, nothing changed size: edited headers, assigned payloads and
//!   byte patches are written over their old blocks.
//! * `Update`, something changed size: the whole list is written to a
//!   temporary file beside the original, which then atomically replaces it.
//!   Payloads that were never loaded are streamed across unread.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::block::{data_padding, padded_byte_len};
use crate::checksum::{self, ChecksumStatus};
use crate::error::{Error, Result};
use crate::hdu::{Hdu, HduKind};
use crate::header::{Anchor, Header};
use crate::io::{copy_range, stream_len};
use crate::options::Options;
use crate::scan::scan;
use crate::value::Value;
use crate::verify::{self, Finding, VerifyOption};

/// How the backing file may be changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// No mutation at all.
    ReadOnly,
    /// Only new HDUs may be added, at the end; existing bytes stay untouched.
    Append,
    /// Any edit.
    Update,
}

/// Where an HDU lives in its backing file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub file: Option<PathBuf>,
    pub header_offset: u64,
    pub data_offset: u64,
    /// Unpadded payload length.
    pub data_length: u64,
    /// Header blocks plus padded data blocks.
    pub span: u64,
    /// The next flush cannot rewrite this HDU in place.
    pub resized: bool,
}

/// An ordered list of HDUs, optionally backed by a file.
#[derive(Debug)]
pub struct HduList {
    path: Option<PathBuf>,
    file: Option<File>,
    mode: OpenMode,
    hdus: Vec<Hdu>,
    options: Options,
    /// HDUs were inserted, removed or replaced since the last write.
    restructured: bool,
    warnings: Vec<String>,
}

impl Default for HduList {
    fn default() -> Self {
        HduList::with_options(Options::default())
    }
}

impl HduList {
    /// An empty list with no backing file.
    pub fn new() -> Self {
        HduList::default()
    }

    /// An empty in-memory list. It can be filled and written with
    /// [`HduList::writeto`]; [`HduList::flush`] has nothing to write to.
    pub fn with_options(options: Options) -> Self {
        HduList {
            path: None,
            file: None,
            mode: OpenMode::Update,
            hdus: Vec::new(),
            options,
            restructured: false,
            warnings: Vec::new(),
        }
    }

    /// Open and scan `path` with default [`Options`].
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<HduList> {
        HduList::open_with(path, mode, Options::default())
    }

    /// Open and scan `path`. In `Append` mode a missing file is not an error:
    /// the list starts empty and the file is created by the first flush.
    pub fn open_with(path: impl AsRef<Path>, mode: OpenMode, options: Options) -> Result<HduList> {
        let path = path.as_ref().to_path_buf();
        let file = match mode {
            OpenMode::ReadOnly => Some(File::open(&path)?),
            OpenMode::Update => Some(OpenOptions::new().read(true).write(true).open(&path)?),
            OpenMode::Append => match OpenOptions::new().read(true).write(true).open(&path) {
                Ok(file) => Some(file),
                Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            },
        };

        let mut list = HduList {
            path: Some(path),
            file,
            mode,
            hdus: Vec::new(),
            options,
            restructured: false,
            warnings: Vec::new(),
        };
        if let Some(file) = list.file.as_mut() {
            let found = scan(file, &list.options)?;
            list.hdus = found.hdus;
            list.warnings = found.warnings;
        }
        debug!(
            path = %list.path_display(),
            ?mode,
            hdus = list.hdus.len(),
            warnings = list.warnings.len(),
            "opened HDU list"
        );
        Ok(list)
    }

    // ── Inspection ──

    /// Number of HDUs.
    pub fn len(&self) -> usize {
        self.hdus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hdus.is_empty()
    }

    /// The mode the list was opened in.
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// The backing file, `None` for lists built in memory.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The HDU at `index`.
    pub fn get(&self, index: usize) -> Option<&Hdu> {
        self.hdus.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Hdu> {
        self.hdus.iter()
    }

    /// Problems recovered from while scanning the backing file.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Index of the HDU named `name` (case-insensitive; index 0 also answers
    /// to `PRIMARY`), narrowed by `EXTVER` when `ver` is given.
    pub fn index_of(&self, name: &str, ver: Option<i64>) -> Result<usize> {
        let matches: Vec<usize> = self
            .hdus
            .iter()
            .enumerate()
            .filter(|(i, hdu)| {
                let named = hdu.name().eq_ignore_ascii_case(name)
                    || (*i == 0 && name.eq_ignore_ascii_case("PRIMARY"));
                named && ver.is_none_or(|v| hdu.ver() == v)
            })
            .map(|(i, _)| i)
            .collect();
        match matches.as_slice() {
            [index] => Ok(*index),
            [] => Err(Error::HduNotFound(match ver {
                Some(v) => format!("{name}, version {v}"),
                None => name.to_string(),
            })),
            _ => Err(Error::HduNotFound(format!(
                "{name} is ambiguous ({} HDUs carry it); give a version",
                matches.len()
            ))),
        }
    }

    /// Offsets and span of one HDU.
    pub fn fileinfo(&self, index: usize) -> Result<FileInfo> {
        let hdu = self.hdu(index)?;
        Ok(FileInfo {
            file: self.path.clone(),
            header_offset: hdu.header_offset,
            data_offset: hdu.data_offset,
            data_length: hdu.data_length,
            span: hdu.header_span + hdu.padded_data_length,
            resized: hdu.is_resized(),
        })
    }

    /// One line per HDU under a column heading.
    pub fn summary(&self) -> String {
        let mut out = format!("Filename: {}\n", self.path_display());
        out.push_str("No. Name        Type        Cards   Dimensions\n");
        for (index, hdu) in self.hdus.iter().enumerate() {
            out.push_str(&hdu.summary(index));
            out.push('\n');
        }
        out
    }

    /// Whether the next flush must rewrite the whole file.
    pub fn is_resized(&self) -> bool {
        self.restructured || self.hdus.iter().any(Hdu::is_resized)
    }

    // ── HDU-level edits ──

    /// Add an HDU at the end. A first HDU that is an image extension becomes
    /// a primary image; a later primary image becomes an image extension.
    pub fn append(&mut self, hdu: Hdu) -> Result<()> {
        if self.mode == OpenMode::ReadOnly {
            return Err(Error::ReadOnly("append an HDU".into()));
        }
        let hdu = self.adopt(hdu, self.hdus.len())?;
        self.hdus.push(hdu);
        self.restructured = true;
        Ok(())
    }

    /// Insert an HDU before `index`. Inserting at 0 demotes the current
    /// primary image to an image extension.
    pub fn insert(&mut self, index: usize, hdu: Hdu) -> Result<()> {
        self.require_update("insert an HDU")?;
        if index > self.hdus.len() {
            return Err(Error::HduNotFound(format!("index {index}")));
        }
        if index == self.hdus.len() {
            return self.append(hdu);
        }
        let hdu = self.adopt(hdu, index)?;
        if index == 0 && self.hdus[0].kind == HduKind::Primary {
            self.hdus[0].make_extension()?;
        }
        self.hdus.insert(index, hdu);
        self.restructured = true;
        Ok(())
    }

    /// Remove and return the HDU at `index`. Its payload is included only if
    /// it had been loaded.
    pub fn delete(&mut self, index: usize) -> Result<Hdu> {
        self.require_update("delete an HDU")?;
        self.hdu(index)?;
        let removed = self.hdus.remove(index);
        if index == 0 {
            if let Some(first) = self.hdus.first_mut() {
                if first.kind == HduKind::Image {
                    first.make_primary()?;
                }
            }
        }
        self.restructured = true;
        debug!(index, remaining = self.hdus.len(), "deleted HDU");
        Ok(removed)
    }

    /// Put `hdu` in place of the HDU at `index` and return the old one.
    pub fn replace(&mut self, index: usize, hdu: Hdu) -> Result<Hdu> {
        self.require_update("replace an HDU")?;
        self.hdu(index)?;
        let hdu = self.adopt(hdu, index)?;
        let old = std::mem::replace(&mut self.hdus[index], hdu);
        self.restructured = true;
        Ok(old)
    }

    /// A detached deep copy of the HDU at `index` with its payload loaded,
    /// ready to be added to any list.
    pub fn hdu_copy(&mut self, index: usize) -> Result<Hdu> {
        self.load(index)?;
        let source = &self.hdus[index];
        let mut copy = Hdu::new(source.header.copy(), source.payload.clone().unwrap_or_default());
        copy.kind = source.kind.clone();
        Ok(copy)
    }

    // ── Header and payload edits ──

    /// Mutable access to a header. Fails in read-only mode and, in append
    /// mode, for HDUs already in the file.
    pub fn header_mut(&mut self, index: usize) -> Result<&mut Header> {
        self.require_mutable(index, "edit the header")?;
        Ok(&mut self.hdus[index].header)
    }

    /// The payload of HDU `index`, read from the file on first access.
    pub fn data(&mut self, index: usize) -> Result<&[u8]> {
        self.load(index)?;
        Ok(self.hdus[index].payload.as_deref().unwrap_or(&[]))
    }

    /// Replace the payload. The header's size keywords must agree by the time
    /// the list is written.
    pub fn set_data(&mut self, index: usize, data: Vec<u8>) -> Result<()> {
        self.require_mutable(index, "replace the data")?;
        self.hdus[index].assign(data);
        Ok(())
    }

    /// Raw bytes `offset..offset + len` of the payload of HDU `index`,
    /// without loading the whole payload.
    pub fn read_at(&mut self, index: usize, offset: u64, len: usize) -> Result<Vec<u8>> {
        let HduList { file, hdus, .. } = self;
        let hdu = hdus
            .get(index)
            .ok_or_else(|| Error::HduNotFound(format!("index {index}")))?;
        let end = checked_range(hdu, index, offset, len)?;
        if let Some(payload) = &hdu.payload {
            return Ok(payload[offset as usize..end as usize].to_vec());
        }
        let mut bytes = crate::io::read_at(backing(file, index)?, hdu.data_offset + offset, len)?;
        overlay(&mut bytes, offset, &hdu.patches);
        Ok(bytes)
    }

    /// Overwrite payload bytes starting at `offset`. The write is queued and
    /// reaches the file on the next flush.
    pub fn write_at(&mut self, index: usize, offset: u64, bytes: &[u8]) -> Result<()> {
        self.require_mutable(index, "write data")?;
        let hdu = &mut self.hdus[index];
        let end = checked_range(hdu, index, offset, bytes.len())?;
        if let Some(payload) = hdu.payload.as_mut() {
            payload[offset as usize..end as usize].copy_from_slice(bytes);
        }
        if !hdu.dirty {
            hdu.patches.push((offset, bytes.to_vec()));
        }
        Ok(())
    }

    // ── Verification ──

    /// Check every HDU against its kind's requirements. Fix options repair
    /// the list in memory; the repairs are written by the next flush.
    pub fn verify(&mut self, option: VerifyOption) -> Result<Vec<Finding>> {
        if option.fixes() && self.mode == OpenMode::ReadOnly {
            return Err(Error::ReadOnly("apply verification fixes".into()));
        }
        let before = self.hdus.len();
        let frozen = self.frozen();
        let findings = verify::enforce(&mut self.hdus, &self.options.registry, option, frozen)?;
        if self.hdus.len() != before {
            self.restructured = true;
        }
        Ok(findings)
    }

    /// Compare the stored `DATASUM`/`CHECKSUM` of HDU `index` with its bytes.
    pub fn verify_checksum(&mut self, index: usize) -> Result<ChecksumStatus> {
        let HduList { file, hdus, .. } = self;
        let hdu = hdus
            .get(index)
            .ok_or_else(|| Error::HduNotFound(format!("index {index}")))?;
        let header_sum = if hdu.new || hdu.header.is_modified() {
            checksum::checksum_bytes(&hdu.header.to_bytes())
        } else {
            checksum::stream_sum(backing(file, index)?, hdu.header_offset, hdu.header_span)?
        };
        let datasum = match &hdu.payload {
            Some(payload) => checksum::checksum_bytes(payload),
            None => checksum::stream_sum(backing(file, index)?, hdu.data_offset, hdu.data_length)?,
        };
        Ok(checksum::check(&hdu.header, header_sum, datasum))
    }

    // ── Writing ──

    /// Write pending changes to the backing file.
    ///
    /// Returns the findings of the output verification, including every
    /// repair a fix option made before writing.
    pub fn flush(&mut self) -> Result<Vec<Finding>> {
        if self.mode == OpenMode::ReadOnly {
            debug!("read-only HDU list, nothing to flush");
            return Ok(Vec::new());
        }
        let Some(path) = self.path.clone() else {
            debug!("in-memory HDU list, nothing to flush");
            return Ok(Vec::new());
        };
        let findings = self.prepare(self.frozen())?;
        match self.mode {
            OpenMode::Append => self.flush_append(&path)?,
            _ if self.is_resized() => self.flush_resized(&path)?,
            _ => self.flush_in_place()?,
        }
        Ok(findings)
    }

    /// Flush (unless read-only) and release the file.
    pub fn close(mut self) -> Result<Vec<Finding>> {
        let findings = self.flush()?;
        debug!(path = %self.path_display(), "closed HDU list");
        Ok(findings)
    }

    /// Write the whole list to `path`, whatever the open mode. Fails with
    /// [`Error::FileExists`] if `path` exists and `overwrite` is false.
    ///
    /// Writing over the list's own file swaps the backing handle to the new
    /// file and rescans it, as an in-place flush would.
    pub fn writeto(&mut self, path: impl AsRef<Path>, overwrite: bool) -> Result<Vec<Finding>> {
        let path = path.as_ref();
        if !overwrite && path.exists() {
            return Err(Error::FileExists(path.to_path_buf()));
        }
        let replaces_backing = self.file.is_some()
            && self.path.as_deref().is_some_and(|own| same_file(own, path));
        let findings = self.prepare(0)?;

        let tmp = self.write_temp(path)?;
        let file = if overwrite {
            if let Ok(meta) = fs::metadata(path) {
                warn!(path = %path.display(), "overwriting existing file");
                fs::set_permissions(tmp.path(), meta.permissions())?;
            }
            tmp.persist(path)?
        } else {
            tmp.persist_noclobber(path).map_err(|e| {
                if e.error.kind() == io::ErrorKind::AlreadyExists {
                    Error::FileExists(path.to_path_buf())
                } else {
                    Error::Io(e.error)
                }
            })?
        };
        debug!(path = %path.display(), hdus = self.hdus.len(), "wrote HDU list");
        if replaces_backing {
            self.file = Some(file);
            self.rescan()?;
        }
        Ok(findings)
    }

    // ── Internals ──

    fn hdu(&self, index: usize) -> Result<&Hdu> {
        self.hdus
            .get(index)
            .ok_or_else(|| Error::HduNotFound(format!("index {index}")))
    }

    fn path_display(&self) -> String {
        self.path
            .as_ref()
            .map_or_else(|| String::from("(in memory)"), |p| p.display().to_string())
    }

    /// Leading HDUs that were already in the file in append mode.
    fn frozen(&self) -> usize {
        match self.mode {
            OpenMode::Append => self.hdus.iter().filter(|h| !h.new).count(),
            _ => 0,
        }
    }

    fn require_update(&self, what: &str) -> Result<()> {
        match self.mode {
            OpenMode::Update => Ok(()),
            OpenMode::ReadOnly => Err(Error::ReadOnly(what.to_string())),
            OpenMode::Append => Err(Error::ReadOnly(format!(
                "{what}: append mode only adds HDUs at the end"
            ))),
        }
    }

    fn require_mutable(&self, index: usize, what: &str) -> Result<()> {
        let hdu = self.hdu(index)?;
        match self.mode {
            OpenMode::ReadOnly => Err(Error::ReadOnly(format!("{what} of HDU {index}"))),
            OpenMode::Append if !hdu.new => Err(Error::ReadOnly(format!(
                "{what} of HDU {index}: it is already in the file and append mode leaves it untouched"
            ))),
            _ => Ok(()),
        }
    }

    /// Prepare an incoming HDU for `position`.
    fn adopt(&self, mut hdu: Hdu, position: usize) -> Result<Hdu> {
        if hdu.payload.is_none() {
            return Err(Error::Structural(
                "HDU payload is not loaded; take it with hdu_copy".into(),
            ));
        }
        hdu.header.set_case_sensitive(self.options.case_sensitive);
        if !hdu.kind.is_corrupted() {
            hdu.kind = HduKind::classify(&hdu.header, &self.options.registry);
        }
        if position == 0 {
            if hdu.kind == HduKind::Image {
                hdu.make_primary()?;
            }
        } else if hdu.kind == HduKind::Primary {
            hdu.make_extension()?;
        }
        let length = hdu.payload.as_ref().map_or(0, |p| p.len() as u64);
        hdu.new = true;
        hdu.dirty = true;
        hdu.patches.clear();
        hdu.header_offset = 0;
        hdu.header_span = 0;
        hdu.data_offset = 0;
        hdu.data_length = length;
        hdu.padded_data_length = padded_byte_len(length);
        Ok(hdu)
    }

    fn load(&mut self, index: usize) -> Result<()> {
        let HduList { file, hdus, .. } = self;
        let hdu = hdus
            .get_mut(index)
            .ok_or_else(|| Error::HduNotFound(format!("index {index}")))?;
        if hdu.payload.is_some() {
            return Ok(());
        }
        let len = usize::try_from(hdu.data_length)
            .map_err(|_| Error::Size(format!("HDU {index} payload does not fit in memory")))?;
        let mut data = crate::io::read_at(backing(file, index)?, hdu.data_offset, len)?;
        overlay(&mut data, 0, &hdu.patches);
        debug!(index, bytes = len, "loaded payload");
        hdu.payload = Some(data);
        Ok(())
    }

    /// Everything that must happen before the first byte is written:
    /// verification, size checks, `EXTEND` and checksums.
    fn prepare(&mut self, frozen: usize) -> Result<Vec<Finding>> {
        for hdu in self.hdus.iter_mut().skip(frozen) {
            if !hdu.kind.is_corrupted() {
                hdu.kind = HduKind::classify(&hdu.header, &self.options.registry);
            }
        }

        let before = self.hdus.len();
        let findings = verify::enforce(
            &mut self.hdus,
            &self.options.registry,
            self.options.output_verify,
            frozen,
        )?;
        if self.hdus.len() != before {
            self.restructured = true;
        }

        self.check_sizes(frozen)?;
        if frozen == 0 {
            self.ensure_extend()?;
        }
        if self.options.checksum {
            self.stamp_checksums(frozen)?;
        }
        Ok(findings)
    }

    fn check_sizes(&self, frozen: usize) -> Result<()> {
        for (index, hdu) in self.hdus.iter().enumerate().skip(frozen) {
            let touched = hdu.new || hdu.dirty || hdu.header.is_modified();
            if !touched || hdu.kind.is_corrupted() {
                continue;
            }
            let Some(layout) = self.options.registry.layout(hdu.kind.tag()) else {
                continue;
            };
            let declared = layout.data_size(&hdu.header)?;
            let actual = hdu.payload.as_ref().map_or(hdu.data_length, |p| p.len() as u64);
            if declared != actual {
                return Err(Error::Size(format!(
                    "HDU {index}: header declares {declared} data bytes, payload has {actual}"
                )));
            }
        }
        Ok(())
    }

    /// A primary header followed by extensions must say `EXTEND = T`.
    fn ensure_extend(&mut self) -> Result<()> {
        if self.hdus.len() < 2 {
            return Ok(());
        }
        let first = &mut self.hdus[0];
        if !matches!(first.kind, HduKind::Primary | HduKind::Groups) {
            return Ok(());
        }
        if first.header.value("EXTEND") == Some(Value::Logical(true)) {
            return Ok(());
        }
        let naxis = first
            .header
            .value("NAXIS")
            .and_then(|v| v.as_integer())
            .unwrap_or(0);
        let last_axis = if naxis > 0 {
            format!("NAXIS{naxis}")
        } else {
            String::from("NAXIS")
        };
        let anchor = first
            .header
            .contains(last_axis.as_str())
            .then_some(Anchor::After(&last_axis));
        first.header.update("EXTEND", true, None, anchor)?;
        debug!("set EXTEND = T in the primary header");
        Ok(())
    }

    fn stamp_checksums(&mut self, frozen: usize) -> Result<()> {
        for index in frozen..self.hdus.len() {
            let hdu = &self.hdus[index];
            let rewritten = hdu.new
                || hdu.dirty
                || hdu.header.is_modified()
                || !hdu.patches.is_empty();
            if !rewritten || hdu.kind.is_corrupted() {
                continue;
            }
            if !hdu.patches.is_empty() {
                self.load(index)?;
            }
            let HduList { file, hdus, .. } = self;
            let hdu = &mut hdus[index];
            let datasum = match &hdu.payload {
                Some(payload) => checksum::checksum_bytes(payload),
                None => {
                    checksum::stream_sum(backing(file, index)?, hdu.data_offset, hdu.data_length)?
                }
            };
            checksum::stamp(&mut hdu.header, datasum)?;
        }
        Ok(())
    }

    fn flush_append(&mut self, path: &Path) -> Result<()> {
        if !self.hdus.iter().any(|h| h.new) {
            return Ok(());
        }
        if self.file.is_none() {
            self.file = Some(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)?,
            );
        }
        let HduList { file, hdus, .. } = self;
        let file = backing(file, hdus.len())?;
        let mut offset = stream_len(file)?;
        let mut appended = 0usize;
        for hdu in hdus.iter_mut().filter(|h| h.new) {
            let header = hdu.header.to_bytes();
            let data = hdu.payload.as_deref().unwrap_or(&[]);
            crate::io::write_at(file, offset, &header)?;
            file.write_all(data)?;
            file.write_all(&data_padding(data.len() as u64))?;
            hdu.mark_written(offset, header.len() as u64);
            offset = hdu.data_offset + hdu.padded_data_length;
            appended += 1;
        }
        file.sync_all()?;
        self.restructured = false;
        debug!(path = %path.display(), appended, "flushed by appending");
        Ok(())
    }

    fn flush_in_place(&mut self) -> Result<()> {
        let HduList { file, hdus, .. } = self;
        let file = backing(file, 0)?;
        let mut touched = 0usize;
        for hdu in hdus.iter_mut() {
            let mut changed = false;
            if hdu.header.is_modified() {
                crate::io::write_at(file, hdu.header_offset, &hdu.header.to_bytes())?;
                changed = true;
            }
            if hdu.dirty {
                let data = hdu.payload.as_deref().unwrap_or(&[]);
                crate::io::write_at(file, hdu.data_offset, data)?;
                file.write_all(&data_padding(data.len() as u64))?;
                changed = true;
            } else {
                for (offset, bytes) in &hdu.patches {
                    crate::io::write_at(file, hdu.data_offset + offset, bytes)?;
                    changed = true;
                }
            }
            if changed {
                touched += 1;
            }
            let (header_offset, header_span) = (hdu.header_offset, hdu.header_span);
            hdu.mark_written(header_offset, header_span);
        }
        file.sync_data()?;
        debug!(touched, "flushed in place");
        Ok(())
    }

    fn flush_resized(&mut self, path: &Path) -> Result<()> {
        let tmp = self.write_temp(path)?;
        if let Ok(meta) = fs::metadata(path) {
            fs::set_permissions(tmp.path(), meta.permissions())?;
        }
        let file = tmp.persist(path)?;
        debug!(path = %path.display(), "replaced file with rewritten copy");
        self.file = Some(file);
        self.rescan()
    }

    /// Serialize the whole list into a synced temporary file in the directory
    /// of `path`.
    fn write_temp(&mut self, path: &Path) -> Result<NamedTempFile> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut tmp = tempfile::Builder::new()
            .prefix(".fitsio-hdul-")
            .suffix(".tmp")
            .tempfile_in(&dir)?;
        self.serialize_into(tmp.as_file_mut())?;
        tmp.as_file().sync_all()?;
        Ok(tmp)
    }

    fn serialize_into<W: Write>(&mut self, out: &mut W) -> Result<()> {
        // Queued patches only reach a copy through the loaded payload.
        for index in 0..self.hdus.len() {
            if !self.hdus[index].patches.is_empty() {
                self.load(index)?;
            }
        }

        let HduList { file, hdus, .. } = self;
        for (index, hdu) in hdus.iter().enumerate() {
            if hdu.new || hdu.header.is_modified() {
                out.write_all(&hdu.header.to_bytes())?;
            } else {
                copy_range(backing(file, index)?, hdu.header_offset, hdu.header_span, out)?;
            }
            match &hdu.payload {
                Some(data) => {
                    out.write_all(data)?;
                    out.write_all(&data_padding(data.len() as u64))?;
                }
                None => {
                    copy_range(backing(file, index)?, hdu.data_offset, hdu.data_length, out)?;
                    out.write_all(&data_padding(hdu.data_length))?;
                }
            }
        }
        out.flush()?;
        Ok(())
    }

    /// Rebuild every descriptor from the freshly written file, keeping
    /// payloads that were already in memory.
    fn rescan(&mut self) -> Result<()> {
        let file = backing(&mut self.file, 0)?;
        let found = scan(file, &self.options)?;
        let mut hdus = found.hdus;
        if hdus.len() == self.hdus.len() {
            for (fresh, old) in hdus.iter_mut().zip(self.hdus.iter_mut()) {
                if old
                    .payload
                    .as_ref()
                    .is_some_and(|p| p.len() as u64 == fresh.data_length)
                {
                    fresh.payload = old.payload.take();
                }
            }
        } else {
            warn!(
                written = self.hdus.len(),
                scanned = hdus.len(),
                "rewritten file scans to a different number of HDUs"
            );
        }
        self.hdus = hdus;
        self.warnings = found.warnings;
        self.restructured = false;
        Ok(())
    }
}

impl<'a> IntoIterator for &'a HduList {
    type Item = &'a Hdu;
    type IntoIter = std::slice::Iter<'a, Hdu>;

    fn into_iter(self) -> Self::IntoIter {
        self.hdus.iter()
    }
}

/// Whether `a` and `b` name the same existing file.
fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn backing(file: &mut Option<File>, index: usize) -> Result<&mut File> {
    file.as_mut()
        .ok_or_else(|| Error::Structural(format!("HDU {index} has no backing file")))
}

/// End of `offset..offset + len` within the payload of `hdu`.
fn checked_range(hdu: &Hdu, index: usize, offset: u64, len: usize) -> Result<u64> {
    let available = hdu.payload.as_ref().map_or(hdu.data_length, |p| p.len() as u64);
    offset
        .checked_add(len as u64)
        .filter(|&end| end <= available)
        .ok_or_else(|| {
            Error::Size(format!(
                "bytes {offset}..+{len} lie outside the {available}-byte data of HDU {index}"
            ))
        })
}

/// Copy the parts of queued patches that fall inside a buffer holding the
/// payload bytes starting at `start`.
fn overlay(buf: &mut [u8], start: u64, patches: &[(u64, Vec<u8>)]) {
    let end = start + buf.len() as u64;
    for (offset, bytes) in patches {
        let patch_end = offset + bytes.len() as u64;
        let lo = (*offset).max(start);
        let hi = patch_end.min(end);
        if lo >= hi {
            continue;
        }
        let dst = (lo - start) as usize..(hi - start) as usize;
        let src = (lo - offset) as usize..(hi - offset) as usize;
        buf[dst].copy_from_slice(&bytes[src]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::Card;

    fn image(name: &str, data: Vec<u8>) -> Hdu {
        let header = Header::from_cards(vec![
            Card::new("XTENSION", "IMAGE", None).unwrap(),
            Card::new("BITPIX", 8, None).unwrap(),
            Card::new("NAXIS", 1, None).unwrap(),
            Card::new("NAXIS1", data.len() as i64, None).unwrap(),
            Card::new("PCOUNT", 0, None).unwrap(),
            Card::new("GCOUNT", 1, None).unwrap(),
            Card::new("EXTNAME", name, None).unwrap(),
        ]);
        Hdu::new(header, data)
    }

    #[test]
    fn overlay_clips_to_buffer() {
        let mut buf = vec![0u8; 4];
        overlay(&mut buf, 10, &[(8, vec![1, 2, 3]), (13, vec![9, 9]), (20, vec![5])]);
        assert_eq!(buf, [3, 0, 0, 9]);
    }

    #[test]
    fn in_memory_list_edits() {
        let mut list = HduList::new();
        list.append(image("FIRST", vec![1; 8])).unwrap();
        assert_eq!(list.get(0).unwrap().kind(), &HduKind::Primary);
        list.append(Hdu::empty_primary().unwrap()).unwrap();
        assert_eq!(list.get(1).unwrap().kind(), &HduKind::Image);

        list.insert(0, image("NEW", vec![2; 4])).unwrap();
        assert_eq!(list.get(0).unwrap().kind(), &HduKind::Primary);
        assert_eq!(list.get(1).unwrap().kind(), &HduKind::Image);
        assert_eq!(list.index_of("first", None).unwrap(), 1);

        let removed = list.delete(0).unwrap();
        assert_eq!(removed.name(), "NEW");
        assert_eq!(list.get(0).unwrap().kind(), &HduKind::Primary);
        assert!(list.flush().is_ok());
    }

    #[test]
    fn index_of_versions() {
        let mut list = HduList::new();
        list.append(Hdu::empty_primary().unwrap()).unwrap();
        for ver in [1, 2] {
            let mut hdu = image("SCI", vec![0; 2]);
            hdu.header.update("EXTVER", ver, None, None).unwrap();
            list.append(hdu).unwrap();
        }
        assert_eq!(list.index_of("primary", None).unwrap(), 0);
        assert_eq!(list.index_of("SCI", Some(2)).unwrap(), 2);
        assert!(matches!(list.index_of("SCI", None), Err(Error::HduNotFound(_))));
        assert!(matches!(list.index_of("ERR", None), Err(Error::HduNotFound(_))));
    }

    #[test]
    fn byte_ranges_on_loaded_payload() {
        let mut list = HduList::new();
        list.append(image("X", (0..10).collect())).unwrap();
        list.write_at(0, 2, &[99, 98]).unwrap();
        assert_eq!(list.read_at(0, 1, 3).unwrap(), [1, 99, 98]);
        assert!(matches!(list.read_at(0, 8, 4), Err(Error::Size(_))));
        assert!(matches!(list.write_at(0, 9, &[0, 0]), Err(Error::Size(_))));
    }

    #[test]
    fn size_mismatch_is_caught_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = HduList::new();
        list.append(image("X", vec![0; 10])).unwrap();
        list.set_data(0, vec![0; 11]).unwrap();
        let err = list.writeto(dir.path().join("out.fits"), false).unwrap_err();
        assert!(matches!(err, Error::Size(_)));
        assert!(!dir.path().join("out.fits").exists());
    }

    #[test]
    fn extend_is_added_for_extensions() {
        let mut list = HduList::new();
        let mut primary = Hdu::empty_primary().unwrap();
        primary.header.delete("EXTEND").unwrap();
        list.append(primary).unwrap();
        list.append(image("A", vec![0; 3])).unwrap();
        list.prepare(0).unwrap();
        let header = list.get(0).unwrap().header();
        assert_eq!(header.value("EXTEND"), Some(Value::Logical(true)));
        assert_eq!(header.index_of("EXTEND"), Some(3));
    }

    #[test]
    fn unloaded_hdu_cannot_be_adopted() {
        let mut hdu = image("X", vec![0; 2]);
        hdu.payload = None;
        let mut list = HduList::new();
        assert!(matches!(list.append(hdu), Err(Error::Structural(_))));
    }
}

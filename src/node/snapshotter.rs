//! Incremental hashed mirror of a node's data directory.
//!
//! The snapshotter keeps track of files on disk and their hashes. The
//! mirror (`dst`) exists because hashing must operate on an mtime-stable
//! view: source files are hard-linked into the mirror, so the mirror
//! keeps the bytes alive even while the source keeps mutating, and all
//! hashing reads the mirror.
//!
//! The caller serializes access; one operation owns the snapshotter at a
//! time and holds it across `snapshot` and the subsequent upload or
//! download run.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use log::debug;
use walkdir::WalkDir;

use crate::common::ipc::{SnapshotFile, SnapshotHash, SnapshotState};
use crate::common::progress::ProgressHandle;
use crate::tools;

/// Optional hook to drop paths a product never wants snapshotted.
pub type PathFilter = fn(Vec<String>) -> Vec<String>;

pub struct Snapshotter {
    src: PathBuf,
    dst: PathBuf,
    glob_set: GlobSet,
    path_filter: Option<PathFilter>,
    embed_limit: u64,
    relative_path_to_snapshotfile: BTreeMap<String, SnapshotFile>,
    hexdigest_to_snapshotfiles: HashMap<String, Vec<SnapshotFile>>,
}

impl Snapshotter {
    pub fn new(
        src: PathBuf,
        dst: PathBuf,
        globs: &[String],
        path_filter: Option<PathFilter>,
        embed_limit: u64,
    ) -> Result<Self, Error> {
        let mut builder = GlobSetBuilder::new();
        for glob in globs {
            // literal separators keep "*" from crossing directories,
            // matching shell glob semantics
            builder.add(
                GlobBuilder::new(glob)
                    .literal_separator(true)
                    .build()
                    .map_err(|err| format_err!("invalid glob {:?}: {}", glob, err))?,
            );
        }
        Ok(Self {
            src,
            dst,
            glob_set: builder.build()?,
            path_filter,
            embed_limit,
            relative_path_to_snapshotfile: BTreeMap::new(),
            hexdigest_to_snapshotfiles: HashMap::new(),
        })
    }

    pub fn src(&self) -> &Path {
        &self.src
    }

    pub fn dst(&self) -> &Path {
        &self.dst
    }

    pub fn snapshotfiles(&self) -> &BTreeMap<String, SnapshotFile> {
        &self.relative_path_to_snapshotfile
    }

    pub fn snapshotfiles_for_hexdigest(&self, hexdigest: &str) -> &[SnapshotFile] {
        self.hexdigest_to_snapshotfiles
            .get(hexdigest)
            .map(|files| files.as_slice())
            .unwrap_or(&[])
    }

    fn list_files(&self, basepath: &Path) -> Result<Vec<String>, Error> {
        let mut result = BTreeSet::new();
        for entry in WalkDir::new(basepath).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                // a racing delete under the walker is not an error
                Err(err) if err.io_error().map(|io| io.kind())
                    == Some(std::io::ErrorKind::NotFound) =>
                {
                    continue
                }
                Err(err) => {
                    return Err(format_err!("listing {:?} failed: {}", basepath, err))
                }
            };
            // symlinks are skipped; only regular files are snapshotted
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(basepath)
                .expect("walkdir yielded entry outside root");
            let relative = match relative.to_str() {
                Some(relative) => relative.to_string(),
                None => continue,
            };
            if self.glob_set.is_match(&relative) {
                result.insert(relative);
            }
        }
        let result: Vec<String> = result.into_iter().collect();
        match self.path_filter {
            Some(filter) => Ok(filter(result)),
            None => Ok(result),
        }
    }

    fn list_dirs_and_files(&self, basepath: &Path) -> Result<(Vec<String>, Vec<String>), Error> {
        let files = self.list_files(basepath)?;
        let mut dirs = BTreeSet::new();
        for file in &files {
            if let Some(parent) = Path::new(file).parent() {
                if !parent.as_os_str().is_empty() {
                    dirs.insert(parent.to_str().unwrap().to_string());
                }
            }
        }
        Ok((dirs.into_iter().collect(), files))
    }

    fn add_snapshotfile(&mut self, snapshotfile: SnapshotFile) {
        if let Some(old) = self
            .relative_path_to_snapshotfile
            .get(&snapshotfile.relative_path)
            .cloned()
        {
            self.remove_snapshotfile(&old);
        }
        if !snapshotfile.hexdigest.is_empty() {
            self.hexdigest_to_snapshotfiles
                .entry(snapshotfile.hexdigest.clone())
                .or_insert_with(Vec::new)
                .push(snapshotfile.clone());
        }
        self.relative_path_to_snapshotfile
            .insert(snapshotfile.relative_path.clone(), snapshotfile);
    }

    fn remove_snapshotfile(&mut self, snapshotfile: &SnapshotFile) {
        self.relative_path_to_snapshotfile
            .remove(&snapshotfile.relative_path);
        if !snapshotfile.hexdigest.is_empty() {
            if let Some(files) = self.hexdigest_to_snapshotfiles.get_mut(&snapshotfile.hexdigest) {
                if let Some(pos) = files.iter().position(|file| file == snapshotfile) {
                    files.remove(pos);
                }
            }
        }
    }

    fn snapshotfile_from_path(&self, relative_path: &str) -> Result<SnapshotFile, Error> {
        let src_path = self.src.join(relative_path);
        let meta = fs::metadata(&src_path)
            .map_err(|err| format_err!("unable to stat {:?}: {}", src_path, err))?;
        Ok(SnapshotFile {
            relative_path: relative_path.to_string(),
            mtime_ns: meta.mtime() * 1_000_000_000 + meta.mtime_nsec(),
            file_size: meta.size(),
            hexdigest: String::new(),
            content_b64: None,
        })
    }

    /// Bring the mirror up to date with the source and rehash whatever
    /// changed. Returns the number of changes; 0 means no-op.
    pub fn snapshot(&mut self, progress: &ProgressHandle) -> Result<u64, Error> {
        progress.start(3);
        let mut changes = 0;

        let (src_dirs, src_files) = self.list_dirs_and_files(&self.src)?;
        let (dst_dirs, dst_files) = self.list_dirs_and_files(&self.dst)?;

        // create missing directories
        let dst_dir_set: HashSet<&String> = dst_dirs.iter().collect();
        for dir in &src_dirs {
            if dst_dir_set.contains(dir) {
                continue;
            }
            fs::create_dir_all(self.dst.join(dir))?;
            changes += 1;
        }
        progress.add_success(1);

        // remove files which are no longer in the source
        let src_file_set: HashSet<&String> = src_files.iter().collect();
        for file in &dst_files {
            if src_file_set.contains(file) {
                continue;
            }
            if let Some(snapshotfile) = self.relative_path_to_snapshotfile.get(file).cloned() {
                self.remove_snapshotfile(&snapshotfile);
            }
            fs::remove_file(self.dst.join(file))?;
            changes += 1;
        }
        progress.add_success(1);

        // hard-link new source files into the mirror
        let dst_file_set: HashSet<&String> = dst_files.iter().collect();
        for file in &src_files {
            if dst_file_set.contains(file) {
                continue;
            }
            fs::hard_link(self.src.join(file), self.dst.join(file))?;
            changes += 1;
        }
        progress.add_success(1);

        // extra mirror directories are left in place; they are harmless

        let mut snapshotfiles = Vec::new();
        for relative_path in &src_files {
            let mut candidate = self.snapshotfile_from_path(relative_path)?;
            if let Some(old) = self.relative_path_to_snapshotfile.get(relative_path) {
                candidate.hexdigest = old.hexdigest.clone();
                candidate.content_b64 = old.content_b64.clone();
                if old == &candidate {
                    debug!("{} is unchanged", relative_path);
                    continue;
                }
            }
            snapshotfiles.push(candidate);
        }

        progress.add_total(snapshotfiles.len() as u64);
        for mut snapshotfile in snapshotfiles {
            let dst_path = self.dst.join(&snapshotfile.relative_path);
            if snapshotfile.file_size <= self.embed_limit {
                snapshotfile.hexdigest = String::new();
                snapshotfile.content_b64 = Some(base64::encode(fs::read(&dst_path)?));
            } else {
                snapshotfile.hexdigest = tools::hash_hexdigest_file(&dst_path)?;
                snapshotfile.content_b64 = None;
            }
            self.add_snapshotfile(snapshotfile);
            changes += 1;
            progress.add_success(1);
        }
        progress.done();
        Ok(changes)
    }

    /// Drop all bookkeeping; the next snapshot rebuilds from disk.
    /// Needed after a clear, where files vanish from the source and the
    /// mirror at once and the incremental pass would never see them.
    pub fn reset(&mut self) {
        self.relative_path_to_snapshotfile.clear();
        self.hexdigest_to_snapshotfiles.clear();
    }

    /// Unique (hexdigest, size) set of the current snapshot; embedded
    /// files have no digest and are not blobs.
    pub fn get_snapshot_hashes(&self) -> Vec<SnapshotHash> {
        let mut hashes: Vec<SnapshotHash> = self
            .hexdigest_to_snapshotfiles
            .iter()
            .filter(|(_, files)| !files.is_empty())
            .map(|(hexdigest, files)| SnapshotHash {
                hexdigest: hexdigest.clone(),
                size: files[0].file_size,
            })
            .collect();
        hashes.sort_by(|a, b| a.hexdigest.cmp(&b.hexdigest));
        hashes
    }

    /// All files ordered by relative path; the ordering is part of the
    /// manifest wire contract.
    pub fn get_snapshot_state(&self) -> SnapshotState {
        SnapshotState {
            files: self.relative_path_to_snapshotfile.values().cloned().collect(),
        }
    }
}

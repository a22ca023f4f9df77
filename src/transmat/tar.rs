use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{Read, Write};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Error, IoResultExt, Result, SiloAttempt};
use crate::fshash::{fill_bucket, scan_tree, MemoryBucket};
use crate::fspatch;
use crate::hash::CommitId;
use crate::transmat::{
    must_be_kind, Arena, MaterializeOptions, Transmat, TransmatKind, Workspace,
};
use crate::types::{Metadata, NodeType};
use crate::warehouse::{open_warehouse, SiloUri};

pub const KIND: &str = "tar";

/// transmat storing trees as deterministic tar streams
///
/// the format: entries in canonical walk order, PAX headers carrying exact
/// nanosecond mtimes, numeric uid/gid only, no global header, 512-byte
/// blocking. because the stream is re-hashed through fshash after unpack,
/// tars can live on any blob store while the canonical-tree invariant holds.
pub struct TarTransmat {
    kind: TransmatKind,
    workspace: Workspace,
}

impl TarTransmat {
    pub fn new(work_path: &Path) -> Result<Self> {
        Ok(Self {
            kind: TransmatKind::new(KIND)?,
            workspace: Workspace::open(work_path)?,
        })
    }
}

impl Transmat for TarTransmat {
    fn kind(&self) -> &TransmatKind {
        &self.kind
    }

    fn materialize(
        &self,
        kind: &TransmatKind,
        commit: &CommitId,
        silos: &[SiloUri],
        options: &MaterializeOptions,
    ) -> Result<Arena> {
        must_be_kind(&self.kind, kind)?;

        let mut tried = Vec::new();
        for uri in silos {
            options.cancel.check()?;

            // probe phase: any failure here falls through to the next silo
            let stream = match open_warehouse(uri)
                .and_then(|wh| wh.ping().map(|()| wh))
                .and_then(|wh| wh.get_stream(commit))
            {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(silo = %uri, reason = %e, "silo unavailable, skipping");
                    tried.push(SiloAttempt {
                        uri: uri.as_str().to_string(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            info!(silo = %uri, "tar: streaming archive");
            options.report_progress(0.0);

            // fetch phase: the stream is open, no more failover
            let staging = self.workspace.staging_dir()?;
            let dest = staging.path().join("tree");
            fs::create_dir(&dest).with_path(&dest)?;
            unpack_tar(stream, &dest, options)?;

            let observed = scan_tree(&dest, &options.filters, &options.cancel)?;
            if observed != *commit && !options.accept_hash_mismatch {
                return Err(Error::HashMismatch {
                    expected: commit.clone(),
                    observed,
                });
            }

            let final_path = self.workspace.promote(&dest, &observed)?;
            options.report_progress(1.0);
            info!(silo = %uri, hash = %observed, "tar: materialize complete");
            return Ok(Arena::owned(final_path, observed));
        }

        Err(Error::WarehouseUnavailable {
            during: "fetch",
            tried,
        })
    }

    fn scan(
        &self,
        kind: &TransmatKind,
        subject: &Path,
        silos: &[SiloUri],
        options: &MaterializeOptions,
    ) -> Result<CommitId> {
        must_be_kind(&self.kind, kind)?;

        let mut bucket = MemoryBucket::new();
        fill_bucket(subject, None, &mut bucket, &options.filters, &options.cancel)?;
        let commit = bucket.tree_digest();

        // publish to the first writable silo
        for uri in silos {
            options.cancel.check()?;
            let warehouse = match open_warehouse(uri).and_then(|wh| wh.ping().map(|()| wh)) {
                Ok(wh) => wh,
                Err(e) => {
                    debug!(silo = %uri, reason = %e, "silo not writable, skipping");
                    continue;
                }
            };

            let mut put = warehouse.put_stream(&commit)?;
            let emit_result = emit_tar(subject, &bucket, &mut put)
                .and_then(|()| put.commit());
            if let Err(e) = emit_result {
                // mid-stream failure: do not fail over, the silo may hold
                // partial data under a temp name
                return Err(Error::WarehouseUnavailable {
                    during: "save",
                    tried: vec![SiloAttempt {
                        uri: uri.as_str().to_string(),
                        reason: e.to_string(),
                    }],
                });
            }
            info!(silo = %uri, hash = %commit, "tar: archive published");
            break;
        }

        Ok(commit)
    }
}

/// serialize a walked bucket as a deterministic tar stream
fn emit_tar(subject: &Path, bucket: &MemoryBucket, out: impl Write) -> Result<()> {
    let mut builder = tar::Builder::new(out);

    for (index, record) in bucket.records().iter().enumerate() {
        let meta = &record.meta;

        // exact mtime travels in a PAX record; the ustar field only holds
        // non-negative whole seconds
        let mut pax = vec![("mtime".to_string(), format_pax_time(meta.mtime_ns))];

        let mut header = tar::Header::new_ustar();
        header.set_mode(meta.mode);
        header.set_uid(meta.uid as u64);
        header.set_gid(meta.gid as u64);
        header.set_mtime(meta.mtime_ns.div_euclid(1_000_000_000).max(0) as u64);

        let tar_path = match meta.node_type {
            NodeType::Dir => {
                if meta.path.is_empty() {
                    "./".to_string()
                } else {
                    format!("{}/", meta.path)
                }
            }
            _ => meta.path.clone(),
        };
        if header.set_path(&tar_path).is_err() {
            // name exceeds ustar limits; carry it in a PAX record instead
            pax.push(("path".to_string(), tar_path.clone()));
            header
                .set_path(format!("longpath.{}", index))
                .map_err(|e| Error::Internal(format!("tar path fallback: {}", e)))?;
        }

        match meta.node_type {
            NodeType::Dir => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
            }
            NodeType::Symlink => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                if header.set_link_name(&meta.link_target).is_err() {
                    pax.push(("linkpath".to_string(), meta.link_target.clone()));
                }
            }
            NodeType::Regular => {
                header.set_entry_type(tar::EntryType::Regular);
            }
        }

        append_pax_header(&mut builder, index, &pax)?;

        match meta.node_type {
            NodeType::Regular => {
                let disk_path = subject.join(&meta.path);
                let file = File::open(&disk_path).with_path(&disk_path)?;
                let len = file.metadata().with_path(&disk_path)?.len();
                header.set_size(len);
                header.set_cksum();
                builder
                    .append(&header, file)
                    .with_path(&disk_path)?;
            }
            _ => {
                header.set_cksum();
                builder.append(&header, std::io::empty()).map_err(|e| {
                    Error::Internal(format!("tar append for {:?}: {}", meta.path, e))
                })?;
            }
        }
    }

    let out = builder
        .into_inner()
        .map_err(|e| Error::Internal(format!("tar finish: {}", e)))?;
    drop(out);
    Ok(())
}

/// append one PAX extended header entry covering the next real entry
fn append_pax_header(
    builder: &mut tar::Builder<impl Write>,
    index: usize,
    records: &[(String, String)],
) -> Result<()> {
    let mut data = Vec::new();
    for (key, value) in records {
        data.extend_from_slice(&pax_record(key, value));
    }

    let mut header = tar::Header::new_ustar();
    header.set_entry_type(tar::EntryType::XHeader);
    header
        .set_path(format!("PaxHeaders.0/{}", index))
        .map_err(|e| Error::Internal(format!("pax header path: {}", e)))?;
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_size(data.len() as u64);
    header.set_cksum();
    builder
        .append(&header, data.as_slice())
        .map_err(|e| Error::Internal(format!("pax header append: {}", e)))?;
    Ok(())
}

/// one PAX record: "<len> <key>=<value>\n" where len counts the whole record
fn pax_record(key: &str, value: &str) -> Vec<u8> {
    let payload_len = 1 + key.len() + 1 + value.len() + 1;
    let mut total = payload_len + 1;
    loop {
        let digits = total.to_string().len();
        if digits + payload_len == total {
            break;
        }
        total = digits + payload_len;
    }
    format!("{} {}={}\n", total, key, value).into_bytes()
}

/// render nanoseconds as a PAX time value: "<secs>.<9-digit-fraction>"
fn format_pax_time(mtime_ns: i64) -> String {
    format!(
        "{}.{:09}",
        mtime_ns.div_euclid(1_000_000_000),
        mtime_ns.rem_euclid(1_000_000_000)
    )
}

/// inverse of `format_pax_time`; tolerates a missing fraction
fn parse_pax_time(value: &str) -> Option<i64> {
    let (secs, frac) = match value.split_once('.') {
        Some((s, f)) => (s, f),
        None => (value, ""),
    };
    let secs: i64 = secs.parse().ok()?;
    let mut nanos: i64 = 0;
    if !frac.is_empty() {
        let mut digits = frac.to_string();
        digits.truncate(9);
        while digits.len() < 9 {
            digits.push('0');
        }
        nanos = digits.parse().ok()?;
    }
    Some(secs.checked_mul(1_000_000_000)?.checked_add(nanos)?)
}

/// unpack a tar stream into `dest`, restoring filtered metadata
///
/// directory mtimes are applied deepest-first after all entries landed,
/// since writing children perturbs them.
fn unpack_tar(reader: impl Read, dest: &Path, options: &MaterializeOptions) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    let mut dir_metas: Vec<Metadata> = Vec::new();

    let entries = archive
        .entries()
        .map_err(|e| Error::DataCorruption(format!("bad tar: {}", e)))?;
    for entry in entries {
        options.cancel.check()?;
        let mut entry = entry.map_err(|e| Error::DataCorruption(format!("bad tar: {}", e)))?;

        // PAX overrides for exact mtime and over-length names
        let mut pax_mtime = None;
        let mut pax_path = None;
        let mut pax_link = None;
        if let Ok(Some(extensions)) = entry.pax_extensions() {
            for ext in extensions.flatten() {
                match (ext.key(), ext.value()) {
                    (Ok("mtime"), Ok(v)) => pax_mtime = parse_pax_time(v),
                    (Ok("path"), Ok(v)) => pax_path = Some(v.to_string()),
                    (Ok("linkpath"), Ok(v)) => pax_link = Some(v.to_string()),
                    _ => {}
                }
            }
        }

        let raw_path = match pax_path {
            Some(p) => p,
            None => entry
                .path()
                .map_err(|e| Error::DataCorruption(format!("bad tar path: {}", e)))?
                .to_string_lossy()
                .into_owned(),
        };
        let rel_path = normalize_entry_path(&raw_path)?;

        let header = entry.header();
        let mode = header
            .mode()
            .map_err(|e| Error::DataCorruption(format!("bad tar mode: {}", e)))?
            & 0o7777;
        let uid = header
            .uid()
            .map_err(|e| Error::DataCorruption(format!("bad tar uid: {}", e)))? as u32;
        let gid = header
            .gid()
            .map_err(|e| Error::DataCorruption(format!("bad tar gid: {}", e)))? as u32;
        let mtime_ns = match pax_mtime {
            Some(ns) => ns,
            None => {
                let secs = header
                    .mtime()
                    .map_err(|e| Error::DataCorruption(format!("bad tar mtime: {}", e)))?;
                (secs as i64).saturating_mul(1_000_000_000)
            }
        };

        let node_type = match header.entry_type() {
            tar::EntryType::Directory => NodeType::Dir,
            tar::EntryType::Regular => NodeType::Regular,
            tar::EntryType::Symlink => NodeType::Symlink,
            other => {
                return Err(Error::DataCorruption(format!(
                    "tar entry {:?} has unsupported type {:?}",
                    rel_path, other
                )))
            }
        };

        let link_target = if node_type == NodeType::Symlink {
            match pax_link {
                Some(target) => target,
                None => entry
                    .link_name()
                    .map_err(|e| Error::DataCorruption(format!("bad tar link: {}", e)))?
                    .ok_or_else(|| {
                        Error::DataCorruption(format!("symlink {:?} has no target", rel_path))
                    })?
                    .to_string_lossy()
                    .into_owned(),
            }
        } else {
            String::new()
        };

        let mut meta = Metadata {
            path: rel_path.clone(),
            node_type,
            mode,
            uid,
            gid,
            mtime_ns,
            link_target,
        };
        options.filters.apply(&mut meta);

        let disk_path = if rel_path.is_empty() {
            dest.to_path_buf()
        } else {
            dest.join(&rel_path)
        };

        match node_type {
            NodeType::Dir => {
                if !rel_path.is_empty() {
                    fs::create_dir_all(&disk_path).with_path(&disk_path)?;
                }
                dir_metas.push(meta);
            }
            NodeType::Regular => {
                if let Some(parent) = disk_path.parent() {
                    fs::create_dir_all(parent).with_path(parent)?;
                }
                let mut file = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&disk_path)
                    .with_path(&disk_path)?;
                std::io::copy(&mut entry, &mut file)
                    .map_err(|e| Error::DataCorruption(format!("truncated tar data: {}", e)))?;
                drop(file);
                fspatch::lchown_if_needed(&disk_path, meta.uid, meta.gid)?;
                fs::set_permissions(&disk_path, Permissions::from_mode(meta.mode))
                    .with_path(&disk_path)?;
                fspatch::utimens(&disk_path, meta.mtime_ns)?;
            }
            NodeType::Symlink => {
                symlink(&meta.link_target, &disk_path).with_path(&disk_path)?;
                fspatch::lchown_if_needed(&disk_path, meta.uid, meta.gid)?;
                fspatch::lutimens(&disk_path, meta.mtime_ns)?;
            }
        }
    }

    // deepest directories first, the root last
    dir_metas.sort_by_key(|m| std::cmp::Reverse(m.path.matches('/').count() + !m.path.is_empty() as usize));
    for meta in &dir_metas {
        let disk_path = if meta.path.is_empty() {
            dest.to_path_buf()
        } else {
            dest.join(&meta.path)
        };
        fspatch::lchown_if_needed(&disk_path, meta.uid, meta.gid)?;
        fs::set_permissions(&disk_path, Permissions::from_mode(meta.mode)).with_path(&disk_path)?;
        fspatch::utimens(&disk_path, meta.mtime_ns)?;
    }

    Ok(())
}

/// canonicalize a tar member name to the walker's relative path form,
/// refusing anything that would escape the unpack root
fn normalize_entry_path(raw: &str) -> Result<String> {
    let trimmed = raw
        .trim_start_matches("./")
        .trim_end_matches('/');
    if trimmed.is_empty() || trimmed == "." {
        return Ok(String::new());
    }
    let path = PathBuf::from(trimmed);
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err(Error::DataCorruption(format!(
                    "tar entry name {:?} escapes the unpack root",
                    raw
                )))
            }
        }
    }
    Ok(trimmed.to_string())
}

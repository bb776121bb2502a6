use image::ImageFormat;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::NamedTempFile;
use uuid::Uuid;
use veriface_core::store::validate_identity;
use veriface_core::{
    Descriptor, DescriptorRecord, DescriptorStore, Image, Payload, PayloadKind, StoreError,
};

const METADATA_EXT: &str = "json";
const TOMBSTONE_SUFFIX: &str = ".deleted";

fn payload_ext(kind: PayloadKind) -> &'static str {
    match kind {
        PayloadKind::Descriptor => "f32",
        PayloadKind::Image => "jpg",
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Directory-per-identity store.
///
/// Every file is written through a temp file in the identity directory and
/// renamed into place. The metadata rename is the commit point; readers
/// only look at metadata.
pub struct FsDescriptorStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FsDescriptorStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_err(&root))?;
        tracing::info!(root = %root.display(), "descriptor store opened");
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn identity_dir(&self, identity: &str) -> Result<PathBuf, StoreError> {
        validate_identity(identity)?;
        Ok(self.root.join(identity))
    }

    /// Writer lock for one identity.
    fn identity_lock(&self, identity: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(identity.to_string()).or_default().clone()
    }

    /// Forget the writer lock of a deleted identity unless another caller
    /// still holds a clone of it.
    fn release_lock(&self, identity: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let ours = locks.get(identity).is_some_and(|l| Arc::ptr_eq(l, &lock));
        // Map entry plus `lock`
        if ours && Arc::strong_count(&lock) == 2 {
            locks.remove(identity);
        }
    }

    /// Remove every record in `dir`, then the directory itself. Caller holds
    /// the identity lock.
    fn remove_all(dir: &Path) -> Result<usize, StoreError> {
        let mut removed = 0;
        for record in read_records(dir)? {
            if Self::remove_record(dir, record.record_id)? {
                removed += 1;
            }
        }

        // Only succeeds once nothing is left behind
        if fs::remove_dir(dir).is_ok() {
            tracing::debug!(dir = %dir.display(), "identity directory removed");
        }
        Ok(removed)
    }

    /// Uncommit and remove one record. Caller holds the identity lock.
    fn remove_record(dir: &Path, record_id: Uuid) -> Result<bool, StoreError> {
        let metadata = dir.join(format!("{record_id}.{METADATA_EXT}"));
        let tombstone = dir.join(format!(".{record_id}.{METADATA_EXT}{TOMBSTONE_SUFFIX}"));

        match fs::rename(&metadata, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(io_err(&metadata)(e)),
        }

        let payloads = [PayloadKind::Descriptor, PayloadKind::Image]
            .map(|kind| dir.join(format!("{record_id}.{}", payload_ext(kind))));
        for payload in &payloads {
            match fs::remove_file(payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    if let Err(restore) = fs::rename(&tombstone, &metadata) {
                        tracing::error!(
                            record_id = %record_id,
                            error = %restore,
                            "failed to restore record metadata"
                        );
                    }
                    return Err(io_err(payload)(e));
                }
            }
        }

        fs::remove_file(&tombstone).map_err(io_err(&tombstone))?;

        if let Some(left) = std::iter::once(&metadata).chain(&payloads).find(|p| p.exists()) {
            return Err(StoreError::Io {
                path: left.clone(),
                source: io::Error::new(
                    io::ErrorKind::Other,
                    "record file still present after delete",
                ),
            });
        }
        Ok(true)
    }
}

/// Write `bytes` to `dest` via a synced temp file in `dir`.
fn write_atomic(dir: &Path, dest: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err(dir))?;
    tmp.write_all(bytes).map_err(io_err(dest))?;
    tmp.as_file().sync_all().map_err(io_err(dest))?;
    tmp.persist(dest).map_err(|e| io_err(dest)(e.error))?;
    Ok(())
}

fn encode_jpeg(image: &Image) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)?;
    Ok(buf)
}

/// Committed records in one identity directory, oldest first.
fn read_records(dir: &Path) -> Result<Vec<DescriptorRecord>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(dir)(e)),
    };

    let mut records = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_err(dir))?;
        let path = entry.path();
        let is_metadata = entry
            .file_name()
            .to_str()
            .is_some_and(|name| !name.starts_with('.') && name.ends_with(".json"));
        if !is_metadata {
            continue;
        }

        let parsed = fs::read(&path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| {
                serde_json::from_slice::<DescriptorRecord>(&bytes).map_err(|e| e.to_string())
            });
        match parsed {
            Ok(record) => records.push(record),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    %error,
                    "skipping unreadable record metadata"
                )
            }
        }
    }

    sort_records(&mut records);
    Ok(records)
}

fn sort_records(records: &mut [DescriptorRecord]) {
    records.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.record_id.cmp(&b.record_id))
    });
}

impl DescriptorStore for FsDescriptorStore {
    fn enroll(
        &self,
        identity: &str,
        payload: &Payload,
        source_model: &str,
    ) -> Result<DescriptorRecord, StoreError> {
        let dir = self.identity_dir(identity)?;
        let lock = self.identity_lock(identity);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let record_id = Uuid::new_v4();
        let kind = payload.kind();
        let bytes = match payload {
            Payload::Descriptor(d) => d.to_le_bytes(),
            Payload::Image(img) => encode_jpeg(img)?,
        };
        let record = DescriptorRecord {
            record_id,
            identity: identity.to_string(),
            created_at: chrono::Utc::now(),
            filename: format!("{record_id}.{}", payload_ext(kind)),
            kind,
            source_model: source_model.to_string(),
            dimensions: payload.dimensions(),
        };
        let metadata = serde_json::to_vec_pretty(&record)?;

        let payload_path = dir.join(&record.filename);
        write_atomic(&dir, &payload_path, &bytes)?;

        let metadata_path = dir.join(format!("{record_id}.{METADATA_EXT}"));
        if let Err(e) = write_atomic(&dir, &metadata_path, &metadata) {
            if let Err(cleanup) = fs::remove_file(&payload_path) {
                tracing::error!(
                    path = %payload_path.display(),
                    error = %cleanup,
                    "failed to remove orphaned payload"
                );
            }
            return Err(e);
        }

        tracing::info!(
            identity,
            record_id = %record_id,
            kind = ?kind,
            source_model,
            bytes = bytes.len(),
            "record enrolled"
        );
        Ok(record)
    }

    fn list(&self, identity: &str) -> Result<Vec<DescriptorRecord>, StoreError> {
        read_records(&self.identity_dir(identity)?)
    }

    fn list_all(&self) -> Result<Vec<DescriptorRecord>, StoreError> {
        let entries = fs::read_dir(&self.root).map_err(io_err(&self.root))?;

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err(&self.root))?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.')
                || validate_identity(&name).is_err()
                || !entry.path().is_dir()
            {
                continue;
            }
            records.extend(read_records(&entry.path())?);
        }

        sort_records(&mut records);
        Ok(records)
    }

    fn load(&self, record: &DescriptorRecord) -> Result<Payload, StoreError> {
        let expected = format!("{}.{}", record.record_id, payload_ext(record.kind));
        if record.filename != expected {
            return Err(StoreError::Corrupt {
                id: record.record_id,
                reason: format!("unexpected payload file name {:?}", record.filename),
            });
        }

        let path = self.identity_dir(&record.identity)?.join(&record.filename);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(record.record_id))
            }
            Err(e) => return Err(io_err(&path)(e)),
        };

        match record.kind {
            PayloadKind::Descriptor => {
                Descriptor::from_le_bytes(&bytes, record.source_model.as_str())
                    .filter(|d| d.dim() == record.dimensions)
                    .map(Payload::Descriptor)
                    .ok_or_else(|| StoreError::Corrupt {
                        id: record.record_id,
                        reason: format!(
                            "{} payload bytes for {} dimensions",
                            bytes.len(),
                            record.dimensions
                        ),
                    })
            }
            PayloadKind::Image => Ok(Payload::Image(image::load_from_memory(&bytes)?.to_rgb8())),
        }
    }

    fn delete(&self, identity: &str, record_id: Uuid) -> Result<bool, StoreError> {
        let dir = self.identity_dir(identity)?;
        let lock = self.identity_lock(identity);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let removed = Self::remove_record(&dir, record_id)?;
        if removed {
            tracing::info!(identity, record_id = %record_id, "record deleted");
        }
        Ok(removed)
    }

    fn delete_identity(&self, identity: &str) -> Result<usize, StoreError> {
        let dir = self.identity_dir(identity)?;
        let lock = self.identity_lock(identity);
        let removed = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            Self::remove_all(&dir)
        };
        self.release_lock(identity, lock);

        let removed = removed?;
        tracing::info!(identity, removed, "identity deleted");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::collections::HashSet;

    fn store() -> (tempfile::TempDir, FsDescriptorStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDescriptorStore::open(dir.path().join("faces")).unwrap();
        (dir, store)
    }

    fn descriptor(seed: f32) -> Payload {
        let values: Vec<f32> = (0..512).map(|i| (i as f32 * seed).sin()).collect();
        Payload::Descriptor(Descriptor::new(values, "w600k_r50"))
    }

    fn file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_enroll_descriptor_layout() {
        let (_tmp, store) = store();
        let payload = descriptor(0.1);
        let record = store.enroll("alice", &payload, "w600k_r50").unwrap();

        let dir = store.root().join("alice");
        let mut expected = vec![
            format!("{}.f32", record.record_id),
            format!("{}.json", record.record_id),
        ];
        expected.sort();
        assert_eq!(file_names(&dir), expected);

        let metadata = fs::read(dir.join(format!("{}.json", record.record_id))).unwrap();
        let meta: serde_json::Value = serde_json::from_slice(&metadata).unwrap();
        assert_eq!(meta["face_id"], record.record_id.to_string());
        assert_eq!(meta["user_id"], "alice");
        assert_eq!(meta["kind"], "descriptor");
        assert_eq!(meta["source_model"], "w600k_r50");
        assert_eq!(meta["dimensions"], 512);
        assert!(meta["timestamp"].as_str().is_some());
        assert_eq!(fs::metadata(dir.join(&record.filename)).unwrap().len(), 512 * 4);

        assert_eq!(store.load(&record).unwrap(), payload);
    }

    #[test]
    fn test_enroll_image_record() {
        let (_tmp, store) = store();
        let crop = Image::from_fn(40, 30, |x, y| Rgb([(x * 6) as u8, (y * 8) as u8, 90]));
        let record = store.enroll("bob", &Payload::Image(crop), "geometric").unwrap();
        assert_eq!(record.kind, PayloadKind::Image);
        assert!(record.filename.ends_with(".jpg"));
        assert_eq!(record.dimensions, 1200);

        match store.load(&record).unwrap() {
            Payload::Image(img) => assert_eq!(img.dimensions(), (40, 30)),
            other => panic!("expected image payload, got {:?}", other.kind()),
        }
    }

    #[test]
    fn test_enroll_is_monotonic_with_distinct_ids() {
        let (_tmp, store) = store();
        let mut ids = HashSet::new();
        for i in 0..5 {
            let record = store.enroll("carol", &descriptor(i as f32 + 1.0), "w600k_r50").unwrap();
            assert!(ids.insert(record.record_id));
            assert_eq!(store.list("carol").unwrap().len(), i + 1);
        }

        let listed = store.list("carol").unwrap();
        assert!(listed.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        assert_eq!(listed.iter().map(|r| r.record_id).collect::<HashSet<_>>(), ids);
    }

    #[test]
    fn test_delete_removes_everything() {
        let (_tmp, store) = store();
        let keep = store.enroll("dave", &descriptor(1.0), "w600k_r50").unwrap();
        let gone = store.enroll("dave", &descriptor(2.0), "w600k_r50").unwrap();

        assert!(store.delete("dave", gone.record_id).unwrap());
        assert!(!store.delete("dave", gone.record_id).unwrap());

        let ids: Vec<Uuid> = store.list("dave").unwrap().iter().map(|r| r.record_id).collect();
        assert_eq!(ids, vec![keep.record_id]);
        let names = file_names(&store.root().join("dave"));
        assert!(names.iter().all(|n| !n.contains(&gone.record_id.to_string())), "{names:?}");
        assert!(matches!(store.load(&gone), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_delete_identity() {
        let (_tmp, store) = store();
        for i in 0..3 {
            store.enroll("erin", &descriptor(i as f32), "w600k_r50").unwrap();
        }
        store.enroll("frank", &descriptor(9.0), "w600k_r50").unwrap();

        assert_eq!(store.delete_identity("erin").unwrap(), 3);
        assert!(store.list("erin").unwrap().is_empty());
        assert!(!store.root().join("erin").exists());
        assert_eq!(store.list("frank").unwrap().len(), 1);
        assert_eq!(store.delete_identity("nobody").unwrap(), 0);
    }

    #[test]
    fn test_list_skips_corrupt_and_hidden_files() {
        let (_tmp, store) = store();
        let record = store.enroll("gina", &descriptor(1.0), "w600k_r50").unwrap();
        let dir = store.root().join("gina");
        fs::write(dir.join("garbage.json"), b"{not json").unwrap();
        fs::write(dir.join(format!(".{}.json.deleted", Uuid::new_v4())), b"{}").unwrap();
        fs::write(dir.join("notes.txt"), b"hello").unwrap();

        let listed = store.list("gina").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].record_id, record.record_id);
    }

    #[test]
    fn test_list_all_spans_identities() {
        let (_tmp, store) = store();
        store.enroll("hank", &descriptor(1.0), "w600k_r50").unwrap();
        store.enroll("ivy", &descriptor(2.0), "w600k_r50").unwrap();
        fs::write(store.root().join("stray.txt"), b"x").unwrap();

        let identities: HashSet<String> = store
            .list_all()
            .unwrap()
            .into_iter()
            .map(|r| r.identity)
            .collect();
        assert_eq!(identities, ["hank", "ivy"].iter().map(|s| s.to_string()).collect());
    }

    #[test]
    fn test_unknown_identity_lists_empty() {
        let (_tmp, store) = store();
        assert!(store.list("nobody").unwrap().is_empty());
    }

    #[test]
    fn test_invalid_identity_rejected() {
        let (_tmp, store) = store();
        for bad in ["", "..", "a/b"] {
            assert!(matches!(
                store.enroll(bad, &descriptor(1.0), "w600k_r50"),
                Err(StoreError::InvalidIdentity(_))
            ));
        }
    }

    #[test]
    fn test_load_rejects_tampered_filename() {
        let (_tmp, store) = store();
        let mut record = store.enroll("jack", &descriptor(1.0), "w600k_r50").unwrap();
        record.filename = "../../etc/passwd".into();
        assert!(matches!(store.load(&record), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_load_rejects_truncated_descriptor() {
        let (_tmp, store) = store();
        let record = store.enroll("kim", &descriptor(1.0), "w600k_r50").unwrap();
        fs::write(store.root().join("kim").join(&record.filename), [0u8; 12]).unwrap();
        assert!(matches!(store.load(&record), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_concurrent_enrolls_same_identity() {
        let (_tmp, store) = store();
        let store = Arc::new(store);
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    (0..5)
                        .map(|i| {
                            store
                                .enroll("lee", &descriptor((t * 5 + i) as f32), "w600k_r50")
                                .unwrap()
                                .record_id
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let ids: HashSet<Uuid> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        assert_eq!(ids.len(), 40);
        assert_eq!(store.list("lee").unwrap().len(), 40);
        // Only committed files, no leftover temp files
        assert_eq!(file_names(&store.root().join("lee")).len(), 80);
    }

    #[test]
    fn test_reader_never_sees_partial_enrollment() {
        let (_tmp, store) = store();
        let store = Arc::new(store);
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let writer = {
            let (store, done) = (store.clone(), done.clone());
            std::thread::spawn(move || {
                for i in 0..60 {
                    let payload = if i % 2 == 0 {
                        descriptor(i as f32)
                    } else {
                        Payload::Image(Image::from_pixel(24, 24, Rgb([i as u8, 90, 160])))
                    };
                    store.enroll("mia", &payload, "w600k_r50").unwrap();
                }
                done.store(true, std::sync::atomic::Ordering::SeqCst);
            })
        };

        let mut seen = 0;
        loop {
            let finished = done.load(std::sync::atomic::Ordering::SeqCst);
            for record in store.list("mia").unwrap() {
                if let Err(e) = store.load(&record) {
                    panic!("listed record {} failed to load: {e}", record.record_id);
                }
                seen += 1;
            }
            if finished {
                break;
            }
        }
        writer.join().unwrap();

        assert!(seen >= 60);
        assert_eq!(store.list("mia").unwrap().len(), 60);
    }

    #[test]
    fn test_delete_identity_releases_writer_lock() {
        let (_tmp, store) = store();
        store.enroll("nia", &descriptor(1.0), "w600k_r50").unwrap();
        assert!(store.locks.lock().unwrap().contains_key("nia"));

        store.delete_identity("nia").unwrap();
        assert!(!store.locks.lock().unwrap().contains_key("nia"));

        // A later enrollment gets a fresh lock and still works
        store.enroll("nia", &descriptor(2.0), "w600k_r50").unwrap();
        assert_eq!(store.list("nia").unwrap().len(), 1);
    }

    #[test]
    fn test_release_keeps_lock_held_elsewhere() {
        let (_tmp, store) = store();
        let held = store.identity_lock("olga");
        let ours = store.identity_lock("olga");
        store.release_lock("olga", ours);
        assert!(store.locks.lock().unwrap().contains_key("olga"));
        drop(held);
    }
}

//! Database of live capsule mounts.
//!
//! The database is a process-local cache of what is currently mounted,
//! keyed by package name. It carries two global uniqueness indexes (loop
//! device paths and verity device names) because those names live in
//! kernel namespaces shared with the rest of the OS: handing the kernel a
//! duplicate would corrupt state far beyond this process. Violations of
//! either index are therefore fatal rather than recoverable.
//!
//! On startup the cache is rebuilt from kernel state (mount, loop and
//! device-mapper tables) via [`MountScanner`]; nothing in memory survives a
//! restart.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// One live mount of a capsule image.
///
/// `verity_device` is empty when the image is mounted directly from the
/// loop device with no verity layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedRecord {
    /// Version of the mounted capsule.
    pub version: u64,
    /// Loop device backing the image, e.g. `/dev/loop4`.
    pub loop_device: PathBuf,
    /// Capsule file the loop device reads from.
    pub image_path: PathBuf,
    /// Where the filesystem is mounted.
    pub mount_point: PathBuf,
    /// Device-mapper verity device name, or empty for no verity layer.
    pub verity_device: String,
}

impl MountedRecord {
    /// Deterministic total order over records, used only as an iteration
    /// tie-break: lexicographic on (loop device, image path, mount point,
    /// verity name). The version is deliberately not part of the order.
    fn sort_key(&self) -> (&Path, &Path, &Path, &str) {
        (
            &self.loop_device,
            &self.image_path,
            &self.mount_point,
            &self.verity_device,
        )
    }
}

impl PartialOrd for MountedRecord {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MountedRecord {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// A mount found in kernel state during startup reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveMount {
    /// Package name parsed from the mount point.
    pub package_name: String,
    /// The record reconstructed from kernel tables.
    pub record: MountedRecord,
}

/// Reads live capsule mounts back out of kernel state.
///
/// Implementations scan the mount table, the loop device pool and the
/// device-mapper target table and reassemble [`LiveMount`]s from them.
pub trait MountScanner {
    /// Every capsule mount currently visible to the kernel.
    ///
    /// # Errors
    ///
    /// Returns a human-readable description when kernel state cannot be
    /// read; the caller treats the database as empty in that case.
    fn scan(&self) -> Result<Vec<LiveMount>, String>;
}

/// Indexed records of live mounts with per-name "latest" tracking.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MountedCapsuleDatabase {
    /// Records per package name, in insertion order. Insertion order is
    /// the tie-break for the "latest" flag.
    mounted: BTreeMap<String, Vec<MountedRecord>>,
    loop_index: HashSet<PathBuf>,
    verity_index: HashSet<String>,
}

impl MountedCapsuleDatabase {
    /// Creates an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record for `package_name`.
    ///
    /// # Panics
    ///
    /// Panics when the record's loop device is already indexed, or its
    /// verity name is non-empty and already indexed. Either means this
    /// process is about to collide with itself inside a kernel namespace;
    /// aborting and rebuilding from kernel state is the only safe answer.
    pub fn add(&mut self, package_name: &str, record: MountedRecord) {
        assert!(
            self.loop_index.insert(record.loop_device.clone()),
            "duplicate loop device: {}",
            record.loop_device.display()
        );
        if !record.verity_device.is_empty() {
            assert!(
                self.verity_index.insert(record.verity_device.clone()),
                "duplicate verity device: {}",
                record.verity_device
            );
        }
        self.mounted
            .entry(package_name.to_string())
            .or_default()
            .push(record);
    }

    /// Removes the record for (`package_name`, `image_path`).
    ///
    /// The image path identifies the record rather than the version
    /// because shared-libs capsules may legally mount the same
    /// (name, version) twice from different files. Removing a record that
    /// is not present is a no-op.
    pub fn remove(&mut self, package_name: &str, image_path: &Path) {
        let Some(records) = self.mounted.get_mut(package_name) else {
            return;
        };
        let Some(pos) = records.iter().position(|r| r.image_path == image_path) else {
            return;
        };
        let record = records.remove(pos);
        if records.is_empty() {
            self.mounted.remove(package_name);
        }
        self.loop_index.remove(&record.loop_device);
        if !record.verity_device.is_empty() {
            self.verity_index.remove(&record.verity_device);
        }
    }

    /// Iterates every record as `(package_name, record, is_latest)`.
    ///
    /// Names come out in lexicographic order; records per name come out in
    /// the record total order. `is_latest` is true for the record with the
    /// highest version of its name (first-inserted wins a version tie).
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MountedRecord, bool)> {
        self.mounted.iter().flat_map(|(name, records)| {
            let latest = Self::latest_of(records);
            let mut sorted: Vec<&MountedRecord> = records.iter().collect();
            sorted.sort();
            sorted.into_iter().map(move |record| {
                (name.as_str(), record, std::ptr::eq(record, latest))
            })
        })
    }

    /// Iterates the records of one package, as [`Self::iter`] does.
    pub fn iter_name<'a>(
        &'a self,
        package_name: &str,
    ) -> impl Iterator<Item = (&'a MountedRecord, bool)> {
        self.mounted
            .get(package_name)
            .into_iter()
            .flat_map(|records| {
                let latest = Self::latest_of(records);
                let mut sorted: Vec<&MountedRecord> = records.iter().collect();
                sorted.sort();
                sorted
                    .into_iter()
                    .map(move |record| (record, std::ptr::eq(record, latest)))
            })
    }

    /// The latest record for `package_name`, if any is mounted.
    #[must_use]
    pub fn get_latest(&self, package_name: &str) -> Option<&MountedRecord> {
        self.mounted.get(package_name).map(|r| Self::latest_of(r))
    }

    /// Runs `action` iff the record for (`package_name`, `image_path`) is
    /// *not* the latest for its name, and returns the action's result;
    /// otherwise returns `Ok(())` without running it.
    ///
    /// This guards uninstall paths: the latest record is the one answering
    /// the bare-name mount path, and tearing it down out from under its
    /// consumers is never what an uninstall of an older version means. A
    /// record that is not in the database has nothing to protect, so the
    /// action runs.
    ///
    /// # Errors
    ///
    /// Propagates whatever `action` returns.
    pub fn do_if_not_latest<E>(
        &self,
        package_name: &str,
        image_path: &Path,
        action: impl FnOnce() -> Result<(), E>,
    ) -> Result<(), E> {
        if let Some(latest) = self.get_latest(package_name) {
            if latest.image_path == image_path {
                return Ok(());
            }
        }
        action()
    }

    /// Number of records across all names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mounted.values().map(Vec::len).sum()
    }

    /// True when nothing is mounted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mounted.is_empty()
    }

    /// Whether (`package_name`, `image_path`) is currently mounted.
    #[must_use]
    pub fn contains(&self, package_name: &str, image_path: &Path) -> bool {
        self.mounted
            .get(package_name)
            .is_some_and(|records| records.iter().any(|r| r.image_path == image_path))
    }

    /// Rebuilds a database from kernel state.
    ///
    /// Mounts whose image path appears in `known_paths` are adopted;
    /// everything else cannot be reconciled with a known capsule and is
    /// returned for teardown.
    ///
    /// # Errors
    ///
    /// Propagates the scanner's error string.
    pub fn rebuild_from(
        scanner: &dyn MountScanner,
        known_paths: &HashSet<PathBuf>,
    ) -> Result<(Self, Vec<LiveMount>), String> {
        let mut db = Self::new();
        let mut orphans = Vec::new();
        for live in scanner.scan()? {
            if known_paths.contains(&live.record.image_path) {
                db.add(&live.package_name, live.record);
            } else {
                orphans.push(live);
            }
        }
        Ok((db, orphans))
    }

    /// Highest-version record, first-inserted winning ties. `records` is
    /// never empty: empty name entries are dropped eagerly on removal.
    fn latest_of(records: &[MountedRecord]) -> &MountedRecord {
        let mut latest = &records[0];
        for record in &records[1..] {
            if record.version > latest.version {
                latest = record;
            }
        }
        latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(loop_dev: &str, image: &str, mount: &str, verity: &str, version: u64) -> MountedRecord {
        MountedRecord {
            version,
            loop_device: PathBuf::from(loop_dev),
            image_path: PathBuf::from(image),
            mount_point: PathBuf::from(mount),
            verity_device: verity.to_string(),
        }
    }

    fn snapshot(db: &MountedCapsuleDatabase) -> Vec<(String, MountedRecord, bool)> {
        db.iter()
            .map(|(n, r, l)| (n.to_string(), r.clone(), l))
            .collect()
    }

    #[test]
    fn linear_order_over_all_fields() {
        let loops = ["loop1", "loop2", "loop3"];
        let paths = ["path1", "path2", "path3"];
        let mounts = ["mount1", "mount2", "mount3"];
        let verities = ["dm1", "dm2", "dm3"];

        let mut records = Vec::new();
        for l in loops {
            for p in paths {
                for m in mounts {
                    for d in verities {
                        records.push(record(l, p, m, d, 0));
                    }
                }
            }
        }

        for i in 0..records.len() {
            for j in 0..records.len() {
                let by_key = (
                    &records[i].loop_device,
                    &records[i].image_path,
                    &records[i].mount_point,
                    &records[i].verity_device,
                )
                    .cmp(&(
                        &records[j].loop_device,
                        &records[j].image_path,
                        &records[j].mount_point,
                        &records[j].verity_device,
                    ));
                assert_eq!(records[i].cmp(&records[j]), by_key);
            }
        }
    }

    #[test]
    fn add_then_remove_restores_prior_state() {
        let mut db = MountedCapsuleDatabase::new();
        db.add("keeper", record("loop0", "path0", "mount0", "dm0", 1));
        let before = snapshot(&db);

        db.add("pkg", record("loop1", "path1", "mount1", "dm1", 1));
        assert!(db.contains("pkg", Path::new("path1")));

        db.remove("pkg", Path::new("path1"));
        assert_eq!(snapshot(&db), before);
        assert!(!db.contains("pkg", Path::new("path1")));

        // The indexes released the names too: re-adding must not trip the
        // uniqueness checks.
        db.add("pkg", record("loop1", "path1", "mount1", "dm1", 1));
    }

    #[test]
    fn remove_missing_record_is_noop() {
        let mut db = MountedCapsuleDatabase::new();
        db.add("pkg", record("loop1", "path1", "mount1", "", 1));
        db.remove("pkg", Path::new("no-such-path"));
        db.remove("other", Path::new("path1"));
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn multiple_mounts_per_name() {
        let mut db = MountedCapsuleDatabase::new();
        db.add("pkg", record("loop1", "path1", "mount1", "dm1", 1));
        db.add("pkg", record("loop2", "path2", "mount2", "dm2", 2));
        db.add("other", record("loop3", "path3", "mount3", "dm3", 1));

        assert_eq!(db.len(), 3);
        assert_eq!(db.iter_name("pkg").count(), 2);

        db.remove("pkg", Path::new("path1"));
        assert_eq!(db.len(), 2);
        assert!(db.contains("pkg", Path::new("path2")));
    }

    #[test]
    fn at_most_one_latest_per_name() {
        let mut db = MountedCapsuleDatabase::new();
        db.add("pkg", record("loop1", "path1", "mount1", "", 1));
        db.add("pkg", record("loop2", "path2", "mount2", "", 5));
        db.add("pkg", record("loop3", "path3", "mount3", "", 3));
        db.add("libs", record("loop4", "path4", "mount4", "", 2));

        let mut latest_per_name: BTreeMap<String, usize> = BTreeMap::new();
        for (name, _, is_latest) in db.iter() {
            if is_latest {
                *latest_per_name.entry(name.to_string()).or_default() += 1;
            }
        }
        assert_eq!(latest_per_name.get("pkg"), Some(&1));
        assert_eq!(latest_per_name.get("libs"), Some(&1));

        assert_eq!(db.get_latest("pkg").unwrap().version, 5);
    }

    #[test]
    fn version_tie_goes_to_first_inserted() {
        let mut db = MountedCapsuleDatabase::new();
        db.add("libs", record("loop2", "b-path", "mount2", "", 7));
        db.add("libs", record("loop1", "a-path", "mount1", "", 7));

        // a-path sorts first in iteration order, but b-path was inserted
        // first and keeps the latest flag.
        assert_eq!(db.get_latest("libs").unwrap().image_path, Path::new("b-path"));
    }

    #[test]
    fn get_latest_unknown_name_is_none() {
        let db = MountedCapsuleDatabase::new();
        assert!(db.get_latest("no-such-name").is_none());
    }

    #[test]
    fn action_skipped_for_latest_record() {
        let mut db = MountedCapsuleDatabase::new();
        db.add("pkg", record("loop1", "path1", "mount1", "", 0));

        // Only record: it is the latest, so the action must not run.
        let result: Result<(), &str> =
            db.do_if_not_latest("pkg", Path::new("path1"), || Err("ran"));
        assert_eq!(result, Ok(()));

        db.add("pkg", record("loop5", "path5", "mount5", "", 5));

        // path1 is no longer the latest: the action runs.
        let result: Result<(), &str> =
            db.do_if_not_latest("pkg", Path::new("path1"), || Err("ran"));
        assert_eq!(result, Err("ran"));

        // path5 is the latest: skipped again.
        let result: Result<(), &str> =
            db.do_if_not_latest("pkg", Path::new("path5"), || Err("ran"));
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn action_runs_for_unknown_record() {
        let db = MountedCapsuleDatabase::new();
        let result: Result<(), &str> =
            db.do_if_not_latest("pkg", Path::new("path1"), || Err("ran"));
        assert_eq!(result, Err("ran"));
    }

    #[test]
    #[should_panic(expected = "duplicate loop device: loop")]
    fn duplicate_loop_device_aborts() {
        let mut db = MountedCapsuleDatabase::new();
        db.add("pkg", record("loop", "path", "mount", "dm", 0));
        db.add("pkg2", record("loop", "path2", "mount2", "dm2", 0));
    }

    #[test]
    #[should_panic(expected = "duplicate verity device: dm")]
    fn duplicate_verity_device_aborts() {
        let mut db = MountedCapsuleDatabase::new();
        db.add("pkg", record("loop", "path", "mount", "dm", 0));
        db.add("pkg2", record("loop2", "path2", "mount2", "dm", 0));
    }

    #[test]
    fn empty_verity_names_are_not_indexed() {
        let mut db = MountedCapsuleDatabase::new();
        db.add("pkg", record("loop1", "path1", "mount1", "", 0));
        db.add("pkg2", record("loop2", "path2", "mount2", "", 0));
        assert_eq!(db.len(), 2);
    }

    struct FixedScanner(Vec<LiveMount>);

    impl MountScanner for FixedScanner {
        fn scan(&self) -> Result<Vec<LiveMount>, String> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn rebuild_adopts_known_and_reports_orphans() {
        let known = LiveMount {
            package_name: "pkg".to_string(),
            record: record("loop1", "/data/pkg@2.capsule", "/capsule/pkg@2", "pkg@2.dm", 2),
        };
        let orphan = LiveMount {
            package_name: "stale".to_string(),
            record: record("loop2", "/data/stale@1.capsule", "/capsule/stale@1", "", 1),
        };
        let scanner = FixedScanner(vec![known.clone(), orphan.clone()]);

        let known_paths: HashSet<PathBuf> =
            [PathBuf::from("/data/pkg@2.capsule")].into_iter().collect();
        let (db, orphans) =
            MountedCapsuleDatabase::rebuild_from(&scanner, &known_paths).unwrap();

        assert!(db.contains("pkg", Path::new("/data/pkg@2.capsule")));
        assert_eq!(orphans, vec![orphan]);
    }
}

//! The activation pipeline.
//!
//! `on_start` is the daemon's boot path: commit staged sessions, populate
//! the repository, reconcile the mount database with kernel state, select
//! and activate capsules, publish the sharedlibs tree and the activation
//! manifest, and advance the status property. The OTA chroot bootstrap
//! reuses the same pipeline in reduced form (no sessions, no status, no
//! checkpoint).
//!
//! Failure policy: anything that affects one capsule is logged and the
//! pipeline moves on; a data copy that fails to activate falls back to
//! its pre-installed counterpart, and a pre-installed failure must not
//! keep other capsules down. Only broken pre-installed scans (a broken OS
//! image) and database invariant violations stop the boot.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use capsule_core::capsule::{CapsuleHandle, Partition};
use capsule_core::database::MountedCapsuleDatabase;
use capsule_core::manifest::{self, CapsuleInfo, MANIFEST_FILE_NAME};
use capsule_core::repository::{CapsuleRepository, RepositoryError};
use capsule_core::selection::select_for_activation;
use tracing::{debug, error, info, warn};

use crate::config::CapsuledConfig;
use crate::context::{CollaboratorError, EngineContext, InstallResult, sha256_files};
use crate::decompress;
use crate::driver::{ActivationDriver, DriverError};
use crate::fsutil::{self, FsError};
use crate::session::{SessionError, SessionPhase, SessionStore};

/// Name of the shared-libraries tree under the capsule root.
pub const SHAREDLIBS_DIR: &str = "sharedlibs";

/// Errors that stop the pipeline (per-capsule failures do not).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The pre-installed scan failed: the OS image is broken.
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// Session persistence failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A filesystem helper failed.
    #[error(transparent)]
    Fs(#[from] FsError),

    /// An activation attempt failed.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// A mounted vendor capsule is incompatible with the device.
    #[error("vendor interface rejected {capsule}: {source}")]
    Vintf {
        /// Capsule that failed the check.
        capsule: String,
        /// Checker's report.
        #[source]
        source: CollaboratorError,
    },

    /// Deactivation was requested for something that is not mounted.
    #[error("{package} is not mounted from {}", image_path.display())]
    NotMounted {
        /// Package name.
        package: String,
        /// Image path that was expected to be mounted.
        image_path: PathBuf,
    },
}

/// The pipeline and the state it owns: repository, mount database,
/// session store, and the bookkeeping for materialised capsules.
pub struct ActivationEngine<'a> {
    ctx: &'a EngineContext<'a>,
    config: CapsuledConfig,
    device_suffix: String,
    repo: CapsuleRepository,
    db: MountedCapsuleDatabase,
    sessions: SessionStore,
    /// Handles materialised from compressed capsules this run.
    materialized: Vec<CapsuleHandle>,
    /// Materialised path → outer capsule path, for provenance (a capsule
    /// materialised from a pre-installed outer is still factory).
    materialized_outer: BTreeMap<PathBuf, PathBuf>,
}

impl<'a> ActivationEngine<'a> {
    /// An engine for the host daemon; verity devices carry the process id
    /// as their suffix.
    #[must_use]
    pub fn new(ctx: &'a EngineContext<'a>, config: CapsuledConfig) -> Self {
        Self::with_device_suffix(ctx, config, std::process::id().to_string())
    }

    /// An engine with an explicit verity-device suffix (`chroot` for the
    /// OTA bootstrap).
    #[must_use]
    pub fn with_device_suffix(
        ctx: &'a EngineContext<'a>,
        config: CapsuledConfig,
        device_suffix: impl Into<String>,
    ) -> Self {
        let sessions = SessionStore::new(&config.sessions_root);
        Self {
            ctx,
            config,
            device_suffix: device_suffix.into(),
            repo: CapsuleRepository::new(),
            db: MountedCapsuleDatabase::new(),
            sessions,
            materialized: Vec::new(),
            materialized_outer: BTreeMap::new(),
        }
    }

    /// The mount database (primarily for inspection and tests).
    #[must_use]
    pub fn database(&self) -> &MountedCapsuleDatabase {
        &self.db
    }

    /// The session store used by this engine.
    #[must_use]
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Boot-time activation.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] only for whole-boot failures (broken
    /// pre-installed scan, unwritable manifest); per-capsule problems are
    /// logged and skipped.
    pub fn on_start(&mut self) -> Result<(), EngineError> {
        self.ctx.status.set("starting");

        if let Err(e) = self.process_staged_sessions() {
            warn!(error = %e, "staged-session processing failed, continuing boot");
        }

        self.repo
            .add_pre_installed(self.ctx.source, &self.config.builtin_dirs)?;
        if self.config.in_recovery {
            info!("recovery boot: skipping data capsules");
        } else if let Err(e) = self.repo.add_data(self.ctx.source, &self.config.data_dir) {
            warn!(error = %e, "data capsule scan failed, activating pre-installed only");
        }

        self.reconcile();
        let plan = self.activation_plan();
        for handle in &plan {
            self.activate_with_fallback(handle);
        }
        self.populate_sharedlibs();
        self.ctx.status.set("activated");

        self.emit_manifest()?;
        decompress::remove_unlinked(&self.config.decompression_dir, &self.config.data_dir);
        self.gc_terminal_sessions();

        self.ctx.status.set("ready");
        Ok(())
    }

    /// The reduced pipeline run inside the OTA chroot: repository,
    /// selection, activation, manifest. No sessions, no checkpoint, no
    /// status property.
    ///
    /// # Errors
    ///
    /// As [`Self::on_start`].
    pub fn run_ota_chroot(&mut self) -> Result<(), EngineError> {
        self.repo
            .add_pre_installed(self.ctx.source, &self.config.builtin_dirs)?;
        if let Err(e) = self.repo.add_data(self.ctx.source, &self.config.data_dir) {
            warn!(error = %e, "data capsule scan failed, activating pre-installed only");
        }

        let plan = self.activation_plan();
        for handle in &plan {
            self.activate_with_fallback(handle);
        }
        self.populate_sharedlibs();
        self.emit_manifest()
    }

    /// Rebuilds the mount database from kernel state and tears down
    /// whatever cannot be reconciled with a known capsule.
    fn reconcile(&mut self) {
        let known: HashSet<PathBuf> = self
            .repo
            .known_paths()
            .iter()
            .map(|p| p.to_path_buf())
            .collect();

        match MountedCapsuleDatabase::rebuild_from(self.ctx.scanner, &known) {
            Ok((db, orphans)) => {
                self.db = db;
                for orphan in orphans {
                    warn!(
                        package = orphan.package_name,
                        image = %orphan.record.image_path.display(),
                        "tearing down unreconcilable mount"
                    );
                    if let Err(e) = self.driver().deactivate(&orphan.record) {
                        warn!(error = %e, "orphan teardown incomplete");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot scan kernel state, starting from an empty database");
                self.db = MountedCapsuleDatabase::new();
            }
        }
    }

    /// Selection plus decompression: the ordered list of handles to
    /// activate, with compressed winners replaced by their materialised
    /// twins.
    fn activation_plan(&mut self) -> Vec<CapsuleHandle> {
        let all = self.repo.all_by_name();
        let selected = select_for_activation(&all, &self.repo);

        let compressed: Vec<&CapsuleHandle> = selected
            .iter()
            .copied()
            .filter(|h| h.is_compressed())
            .collect();
        let materialized = decompress::process_compressed(
            self.ctx.verifier,
            &compressed,
            &self.config.decompression_dir,
            &self.config.data_dir,
        );
        let mut by_identity: BTreeMap<(String, u64), CapsuleHandle> = materialized
            .into_iter()
            .map(|h| ((h.name().to_string(), h.version()), h))
            .collect();

        let mut plan = Vec::with_capacity(selected.len());
        for handle in selected {
            if !handle.is_compressed() {
                plan.push(handle.clone());
                continue;
            }
            let identity = (handle.name().to_string(), handle.version());
            if let Some(twin) = by_identity.remove(&identity) {
                self.materialized_outer
                    .insert(twin.path().to_path_buf(), handle.path().to_path_buf());
                self.materialized.push(twin.clone());
                plan.push(twin);
            }
            // A compressed capsule that failed to materialise was already
            // logged by the decompression stage; nothing to activate.
        }
        plan
    }

    /// Activates `handle`; a failing data copy falls back to its
    /// pre-installed counterpart. Pre-installed failures are logged and
    /// swallowed so the rest of the plan still runs.
    fn activate_with_fallback(&mut self, handle: &CapsuleHandle) {
        let Err(err) = self.activate_one(handle) else {
            return;
        };
        warn!(capsule = %handle, error = %err, "activation failed");

        // Provenance matters: a capsule materialised from a pre-installed
        // outer *is* the pre-installed copy and has nothing to fall back
        // to.
        let effective_path = self
            .materialized_outer
            .get(handle.path())
            .map_or(handle.path(), PathBuf::as_path);
        let pre = self.repo.pre_installed(handle.name()).cloned();
        let Some(pre) = pre else {
            return;
        };
        if pre.path() == effective_path {
            error!(capsule = %handle, "pre-installed capsule failed to activate");
            return;
        }
        if pre.is_compressed() {
            error!(capsule = %pre, "cannot fall back to a compressed pre-installed capsule");
            return;
        }

        info!(capsule = %pre, "falling back to pre-installed capsule");
        if let Err(e) = self.activate_one(&pre) {
            error!(capsule = %pre, error = %e, "pre-installed fallback failed");
        }
    }

    /// One activation: mount, vendor-interface check, database insert,
    /// bare-name publication.
    fn activate_one(&mut self, handle: &CapsuleHandle) -> Result<(), EngineError> {
        let name = handle.name();
        if self.db.contains(name, handle.path()) {
            debug!(capsule = %handle, "already mounted");
            return Ok(());
        }

        let mount_point = self.config.capsule_root.join(handle.versioned_name());
        let record = self.driver().activate(handle, &mount_point, true)?;

        let partition = match handle.partition() {
            Partition::Unknown => self.repo.partition(handle),
            p => p,
        };
        if matches!(partition, Partition::Vendor | Partition::Odm) {
            if let Err(source) = self.ctx.vintf.check(handle, &mount_point) {
                warn!(capsule = %handle, error = %source, "vendor interface check failed");
                if let Err(teardown) = self.driver().deactivate(&record) {
                    warn!(error = %teardown, "teardown after vendor-interface rejection incomplete");
                }
                return Err(EngineError::Vintf {
                    capsule: handle.versioned_name(),
                    source,
                });
            }
        }

        self.db.add(name, record.clone());
        self.publish_bare_name(name, &record.image_path);
        info!(capsule = %handle, mount_point = %mount_point.display(), "capsule activated");
        Ok(())
    }

    /// Points `<root>/<name>` at the `@version` directory iff `image_path`
    /// is the latest record for the name.
    fn publish_bare_name(&self, name: &str, image_path: &Path) {
        let Some(latest) = self.db.get_latest(name) else {
            return;
        };
        if latest.image_path != image_path {
            return;
        }
        let Some(target) = latest.mount_point.file_name() else {
            return;
        };
        let link = self.config.capsule_root.join(name);
        if let Err(e) = fsutil::replace_symlink(Path::new(target), &link) {
            warn!(name, error = %e, "failed to publish bare-name symlink");
        }
    }

    /// Deactivates the record for (`package_name`, `image_path`) and
    /// repoints or removes the bare-name symlink.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotMounted`] for unknown records and
    /// teardown aggregates from the driver; on teardown failure the record
    /// stays in the database.
    pub fn deactivate_capsule(
        &mut self,
        package_name: &str,
        image_path: &Path,
    ) -> Result<(), EngineError> {
        let record = self
            .db
            .iter_name(package_name)
            .map(|(record, _)| record)
            .find(|record| record.image_path == image_path)
            .cloned()
            .ok_or_else(|| EngineError::NotMounted {
                package: package_name.to_string(),
                image_path: image_path.to_path_buf(),
            })?;

        self.driver().deactivate(&record)?;
        self.db.remove(package_name, image_path);

        let link = self.config.capsule_root.join(package_name);
        match self.db.get_latest(package_name) {
            Some(latest) => {
                if let Some(target) = latest.mount_point.file_name() {
                    if let Err(e) = fsutil::replace_symlink(Path::new(target), &link) {
                        warn!(package_name, error = %e, "failed to repoint bare-name symlink");
                    }
                }
            }
            None => {
                let _ = std::fs::remove_file(&link);
            }
        }
        Ok(())
    }

    /// Deactivates every mounted capsule, best-effort. Returns the number
    /// of records whose teardown failed (those stay in the database).
    pub fn deactivate_all(&mut self) -> usize {
        let targets: Vec<(String, PathBuf)> = self
            .db
            .iter()
            .map(|(name, record, _)| (name.to_string(), record.image_path.clone()))
            .collect();

        let mut failures = 0;
        for (name, image_path) in targets {
            if let Err(e) = self.deactivate_capsule(&name, &image_path) {
                warn!(package = name, error = %e, "deactivation failed");
                failures += 1;
            }
        }
        failures
    }

    /// Every known handle that is currently mounted.
    #[must_use]
    pub fn active_capsules(&self) -> Vec<CapsuleHandle> {
        self.known_handles()
            .into_iter()
            .filter(|h| self.db.contains(h.name(), h.path()))
            .collect()
    }

    /// Every pre-installed handle.
    #[must_use]
    pub fn factory_capsules(&self) -> Vec<CapsuleHandle> {
        self.repo
            .all_by_name()
            .values()
            .flatten()
            .filter(|h| self.repo.is_pre_installed(h))
            .map(|h| (*h).clone())
            .collect()
    }

    /// Moves every in-flight session to `Reverted`, recording the process
    /// whose crash triggered the revert.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Session`] when the session root cannot be
    /// scanned; individual commit failures downgrade the session to
    /// `RevertFailed` and are logged.
    pub fn revert_active_sessions(&mut self, crashing_process: &str) -> Result<(), EngineError> {
        for mut session in self.sessions.get_all()? {
            if !session.state.phase().is_active() {
                continue;
            }
            let id = session.state.id;
            session.state.crashing_process = crashing_process.to_string();
            info!(id, crashing_process, "reverting session");
            if let Err(e) = session.update_state_and_commit(SessionPhase::Reverted) {
                warn!(id, error = %e, "failed to commit revert");
                if let Err(e) = session.update_state_and_commit(SessionPhase::RevertFailed) {
                    error!(id, error = %e, "failed to record revert failure");
                }
            }
        }
        Ok(())
    }

    /// Commits staged sessions: consult the checkpoint service, copy each
    /// session's payload into the data directory, and advance the session
    /// state machine.
    fn process_staged_sessions(&mut self) -> Result<(), EngineError> {
        let staged = self.sessions.get_in_state(SessionPhase::Staged)?;
        if staged.is_empty() {
            return Ok(());
        }

        match self.ctx.checkpoint.needs_rollback() {
            Ok(true) => {
                info!("storage rollback pending, reverting staged sessions");
                for mut session in staged {
                    let id = session.state.id;
                    if let Err(e) = session.update_state_and_commit(SessionPhase::Reverted) {
                        warn!(id, error = %e, "failed to commit revert");
                        let _ = session.update_state_and_commit(SessionPhase::RevertFailed);
                    }
                }
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "checkpoint service unreachable, committing without it"),
        }

        let use_checkpoint = self.ctx.checkpoint.supports_fs_checkpoints().unwrap_or(false)
            && self.ctx.checkpoint.needs_checkpoint().unwrap_or(false);
        if use_checkpoint {
            if let Err(e) = self.ctx.checkpoint.start_checkpoint(1) {
                warn!(error = %e, "failed to start checkpoint");
            }
        }

        for session in staged {
            self.commit_one_session(session, use_checkpoint);
        }
        Ok(())
    }

    fn commit_one_session(&mut self, mut session: crate::session::Session, checkpointed: bool) {
        let id = session.state.id;
        let payload_dir = self.config.staging_base_dir.join(format!("session_{id}"));
        let payload: Vec<PathBuf> = fsutil::list_files(&payload_dir)
            .unwrap_or_default()
            .into_iter()
            .filter(|p| {
                p.extension().is_some_and(|ext| ext == "capsule")
            })
            .collect();

        let hashes = sha256_files(&payload);
        session.state.file_hashes.clone_from(&hashes);
        let first_hash = hashes.first().cloned().unwrap_or_default();
        let is_rollback = session.state.is_rollback;

        let mut staged_ok = !payload.is_empty();
        if payload.is_empty() {
            warn!(id, dir = %payload_dir.display(), "staged session has no payload");
        }

        for file in &payload {
            match self.stage_payload_file(file) {
                Ok(handle) => {
                    self.ctx.metrics.installation_requested(
                        handle.name(),
                        handle.version(),
                        is_rollback,
                        &hashes,
                    );
                    let name = handle.name().to_string();
                    if !session.state.capsule_names.contains(&name) {
                        session.state.capsule_names.push(name);
                    }
                }
                Err(e) => {
                    warn!(id, file = %file.display(), error = %e, "failed to stage payload");
                    staged_ok = false;
                    break;
                }
            }
        }

        if staged_ok {
            if let Err(e) = session.update_state_and_commit(SessionPhase::Activated) {
                warn!(id, error = %e, "failed to commit activation");
                staged_ok = false;
            }
        }
        if !staged_ok {
            let _ = session.update_state_and_commit(SessionPhase::ActivationFailed);
            if checkpointed {
                let msg = format!("session {id} failed to stage");
                if let Err(e) = self.ctx.checkpoint.abort_changes(&msg, false) {
                    warn!(id, error = %e, "failed to abort checkpointed changes");
                }
            }
        }

        let result = if staged_ok {
            InstallResult::Success
        } else {
            InstallResult::Failure
        };
        self.ctx.metrics.installation_ended(&first_hash, result);
    }

    /// Validates one staged payload file and copies it into the data
    /// directory where the ordinary scan picks it up.
    fn stage_payload_file(&self, file: &Path) -> Result<CapsuleHandle, EngineError> {
        let handle = self
            .ctx
            .source
            .open(file)
            .map_err(RepositoryError::Capsule)?;

        fsutil::ensure_dir(&self.config.data_dir, 0o755)?;
        let file_name = file.file_name().unwrap_or_default();
        let dest = self.config.data_dir.join(file_name);
        std::fs::copy(file, &dest).map_err(|source| {
            EngineError::Fs(FsError::Io {
                context: "copy staged payload",
                path: dest.clone(),
                source,
            })
        })?;
        debug!(from = %file.display(), to = %dest.display(), "payload staged");
        Ok(handle)
    }

    /// Populates `<root>/sharedlibs/{lib,lib64}` with symlinks to every
    /// library exported by mounted shared-libs capsules.
    fn populate_sharedlibs(&self) {
        let sharedlibs_root = self.config.capsule_root.join(SHAREDLIBS_DIR);

        for (name, record, _) in self.db.iter() {
            let Some(handle) = self.handle_for(name, &record.image_path) else {
                continue;
            };
            if !handle.provides_shared_libs() {
                continue;
            }
            for sub in ["lib", "lib64"] {
                let exported = record.mount_point.join(sub);
                let libs = match fsutil::list_files(&exported) {
                    Ok(libs) if !libs.is_empty() => libs,
                    _ => continue,
                };
                let link_dir = sharedlibs_root.join(sub);
                if let Err(e) = fsutil::ensure_dir(&link_dir, 0o755) {
                    warn!(error = %e, "cannot create sharedlibs dir");
                    continue;
                }
                for lib in libs {
                    let Some(soname) = lib.file_name() else {
                        continue;
                    };
                    if let Err(e) = fsutil::replace_symlink(&lib, &link_dir.join(soname)) {
                        warn!(lib = %lib.display(), error = %e, "failed to link shared library");
                    }
                }
            }
        }
    }

    /// Writes `capsule-info-list.xml` under the capsule root.
    fn emit_manifest(&self) -> Result<(), EngineError> {
        let entries = self.manifest_entries();
        let mut buf = Vec::new();
        manifest::write_manifest(&mut buf, &entries).map_err(|source| {
            EngineError::Fs(FsError::Io {
                context: "render activation manifest",
                path: self.config.capsule_root.join(MANIFEST_FILE_NAME),
                source,
            })
        })?;
        fsutil::ensure_dir(&self.config.capsule_root, 0o755)?;
        fsutil::atomic_write(&self.config.capsule_root.join(MANIFEST_FILE_NAME), &buf)?;
        info!(entries = entries.len(), "activation manifest written");
        Ok(())
    }

    fn manifest_entries(&self) -> Vec<CapsuleInfo> {
        self.known_handles()
            .into_iter()
            .map(|handle| self.manifest_entry(&handle))
            .collect()
    }

    fn manifest_entry(&self, handle: &CapsuleHandle) -> CapsuleInfo {
        let name = handle.name();
        // A materialised capsule inherits factory-ness from its outer file.
        let provenance_path = self
            .materialized_outer
            .get(handle.path())
            .map_or(handle.path(), PathBuf::as_path);
        let pre = self.repo.pre_installed(name);

        CapsuleInfo {
            module_name: name.to_string(),
            module_path: handle.path().to_path_buf(),
            preinstalled_module_path: pre.map(|p| p.path().to_path_buf()),
            version_code: i64::try_from(handle.version()).unwrap_or(i64::MAX),
            version_name: handle.version_name().to_string(),
            is_factory: pre.is_some_and(|p| p.path() == provenance_path),
            is_active: self.db.contains(name, handle.path()),
        }
    }

    /// Repository handles plus this run's materialised handles.
    fn known_handles(&self) -> Vec<CapsuleHandle> {
        let mut handles: Vec<CapsuleHandle> = self
            .repo
            .all_by_name()
            .values()
            .flatten()
            .map(|h| (*h).clone())
            .collect();
        handles.extend(self.materialized.iter().cloned());
        handles
    }

    fn handle_for(&self, name: &str, image_path: &Path) -> Option<&CapsuleHandle> {
        if let Some(pre) = self.repo.pre_installed(name) {
            if pre.path() == image_path {
                return Some(pre);
            }
        }
        if let Some(data) = self.repo.data(name) {
            if data.path() == image_path {
                return Some(data);
            }
        }
        self.materialized.iter().find(|h| h.path() == image_path)
    }

    fn gc_terminal_sessions(&self) {
        let sessions = match self.sessions.get_all() {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "cannot scan sessions for garbage collection");
                return;
            }
        };
        for session in sessions {
            if session.state.phase().is_final() {
                let id = session.state.id;
                if let Err(e) = session.delete() {
                    warn!(id, error = %e, "failed to delete finalized session");
                }
            }
        }
    }

    fn driver(&self) -> ActivationDriver<'_> {
        ActivationDriver::new(
            self.ctx.loops,
            self.ctx.verity,
            self.ctx.mounts,
            self.ctx.verity_metadata,
            self.device_suffix.clone(),
        )
    }
}

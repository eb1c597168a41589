//! Persistent staged-install sessions.
//!
//! Each session is a directory `<root>/<id>` (mode 0700) holding a single
//! `state` file: the protobuf-encoded [`SessionState`]. Commits are
//! write-then-rename so a crash can never leave a torn state file; after a
//! reboot the store is the only memory the daemon has of what was staged.
//!
//! The store persists and queries; it does not police the transition
//! graph. Legality of a transition is the caller's responsibility.

mod state;

pub use state::{SessionPhase, SessionState};

use std::path::{Path, PathBuf};

use prost::Message;
use tracing::{debug, warn};

use crate::fsutil::{self, FsError};

const STATE_FILE_NAME: &str = "state";

/// Errors from session persistence.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No session directory for the id.
    #[error("no session {id}")]
    NotFound {
        /// Requested session id.
        id: i32,
    },

    /// More than one session claims to be active.
    #[error("multiple active sessions: {ids:?}")]
    MultipleActive {
        /// Ids of every active session found.
        ids: Vec<i32>,
    },

    /// The state file is not a valid record.
    #[error("corrupt state file {}", path.display())]
    Corrupt {
        /// Offending state file.
        path: PathBuf,
        /// Decoder failure.
        #[source]
        source: prost::DecodeError,
    },

    /// Filesystem failure.
    #[error(transparent)]
    Fs(#[from] FsError),

    /// Raw I/O failure outside the fs helpers.
    #[error("session I/O on {}", path.display())]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Store of sessions under one root directory.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

/// One staged-install session: its record plus where it lives on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// The persistent record.
    pub state: SessionState,
    dir: PathBuf,
}

impl SessionStore {
    /// A store rooted at `root`. Nothing is created until the first
    /// session is.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates session `id` in phase [`SessionPhase::Unknown`].
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the directory or initial state file
    /// cannot be created.
    pub fn create(&self, id: i32) -> Result<Session, SessionError> {
        fsutil::ensure_dir(&self.root, 0o700)?;
        let dir = self.session_dir(id);
        fsutil::ensure_dir(&dir, 0o700)?;

        let mut session = Session {
            state: SessionState {
                id,
                ..SessionState::default()
            },
            dir,
        };
        session.commit()?;
        debug!(id, "session created");
        Ok(session)
    }

    /// Loads session `id`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] for an absent session and
    /// [`SessionError::Corrupt`] for an undecodable state file.
    pub fn get(&self, id: i32) -> Result<Session, SessionError> {
        let dir = self.session_dir(id);
        if !dir.is_dir() {
            return Err(SessionError::NotFound { id });
        }
        Session::load(dir)
    }

    /// Every loadable session, ordered by id. Unparseable state files are
    /// logged and skipped: one corrupt session must not hide the rest.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] only when the root cannot be scanned.
    pub fn get_all(&self) -> Result<Vec<Session>, SessionError> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.root).map_err(|source| SessionError::Io {
            path: self.root.clone(),
            source,
        })?;

        let mut sessions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| SessionError::Io {
                path: self.root.clone(),
                source,
            })?;
            let dir = entry.path();
            let is_session = dir.is_dir()
                && dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.parse::<i32>().is_ok());
            if !is_session {
                continue;
            }
            match Session::load(dir.clone()) {
                Ok(session) => sessions.push(session),
                Err(e) => warn!(dir = %dir.display(), error = %e, "skipping unreadable session"),
            }
        }
        sessions.sort_by_key(|s| s.state.id);
        Ok(sessions)
    }

    /// Every session currently in `phase`.
    ///
    /// # Errors
    ///
    /// As [`Self::get_all`].
    pub fn get_in_state(&self, phase: SessionPhase) -> Result<Vec<Session>, SessionError> {
        Ok(self
            .get_all()?
            .into_iter()
            .filter(|s| s.state.phase() == phase)
            .collect())
    }

    /// The single active session (past creation, not terminal), if any.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::MultipleActive`] when more than one session
    /// is in flight; the installer contract allows at most one.
    pub fn get_active(&self) -> Result<Option<Session>, SessionError> {
        let active: Vec<Session> = self
            .get_all()?
            .into_iter()
            .filter(|s| s.state.phase().is_active())
            .collect();
        match active.len() {
            0 => Ok(None),
            1 => Ok(active.into_iter().next()),
            _ => Err(SessionError::MultipleActive {
                ids: active.iter().map(|s| s.state.id).collect(),
            }),
        }
    }

    fn session_dir(&self, id: i32) -> PathBuf {
        self.root.join(id.to_string())
    }
}

impl Session {
    fn load(dir: PathBuf) -> Result<Self, SessionError> {
        let path = dir.join(STATE_FILE_NAME);
        let bytes = std::fs::read(&path).map_err(|source| SessionError::Io {
            path: path.clone(),
            source,
        })?;
        let state = SessionState::decode(bytes.as_slice())
            .map_err(|source| SessionError::Corrupt { path, source })?;
        Ok(Self { state, dir })
    }

    /// Moves the session to `phase` and commits atomically.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the commit fails; the in-memory phase
    /// is still updated so the caller sees what was intended.
    pub fn update_state_and_commit(&mut self, phase: SessionPhase) -> Result<(), SessionError> {
        self.state.set_phase(phase);
        self.commit()
    }

    /// Persists the current record atomically (write-then-rename).
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the write fails.
    pub fn commit(&mut self) -> Result<(), SessionError> {
        let path = self.dir.join(STATE_FILE_NAME);
        fsutil::atomic_write(&path, &self.state.encode_to_vec())?;
        Ok(())
    }

    /// Deletes the session directory recursively.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when removal fails.
    pub fn delete(self) -> Result<(), SessionError> {
        debug!(id = self.state.id, "deleting session");
        std::fs::remove_dir_all(&self.dir).map_err(|source| SessionError::Io {
            path: self.dir.clone(),
            source,
        })
    }
}

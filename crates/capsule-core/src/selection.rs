//! Activation selection policy.
//!
//! Given every known copy of every capsule, decide which file actually gets
//! mounted. The policy is deliberately deterministic so that the host
//! daemon and the OTA chroot bootstrap arrive at the same answer for the
//! same inputs.

use std::collections::BTreeMap;

use tracing::debug;

use crate::capsule::CapsuleHandle;
use crate::repository::CapsuleRepository;

/// Picks the handles to activate out of `all`, the repository's
/// name-grouped view.
///
/// Per name:
///
/// 1. Names without a pre-installed counterpart are skipped entirely.
/// 2. Shared-libs capsules emit every distinct (version, signing-key)
///    handle; coexistence of versions is the point of shared-libs.
/// 3. Everything else picks the highest version; on a version tie the data
///    copy wins. If the winner's key does not match the pre-installed key,
///    the pre-installed handle is activated instead.
///
/// The result is ordered shared-libs first (they must be mounted before
/// anything that links against them), then by name, so activation order is
/// reproducible.
#[must_use]
pub fn select_for_activation<'a>(
    all: &BTreeMap<&str, Vec<&'a CapsuleHandle>>,
    repo: &CapsuleRepository,
) -> Vec<&'a CapsuleHandle> {
    let mut shared_libs: Vec<&CapsuleHandle> = Vec::new();
    let mut regular: Vec<&CapsuleHandle> = Vec::new();

    for (name, handles) in all {
        if !repo.has_pre_installed(name) {
            debug!(name, "no pre-installed counterpart, not selecting");
            continue;
        }

        if handles.iter().any(|h| h.provides_shared_libs()) {
            shared_libs.extend(distinct_shared_libs(handles));
            continue;
        }

        if let Some(winner) = pick_regular(handles, repo) {
            regular.push(winner);
        }
    }

    shared_libs.sort_by_key(|h| (h.name().to_string(), h.version()));
    regular.sort_by_key(|h| h.name().to_string());
    shared_libs.extend(regular);
    shared_libs
}

/// Every distinct (version, signing key) among `handles`, preserving the
/// repository's pre-installed-first grouping order.
fn distinct_shared_libs<'a>(handles: &[&'a CapsuleHandle]) -> Vec<&'a CapsuleHandle> {
    let mut picked: Vec<&CapsuleHandle> = Vec::new();
    for handle in handles {
        let duplicate = picked
            .iter()
            .any(|p| p.version() == handle.version() && p.public_key() == handle.public_key());
        if !duplicate {
            picked.push(handle);
        }
    }
    picked
}

fn pick_regular<'a>(
    handles: &[&'a CapsuleHandle],
    repo: &CapsuleRepository,
) -> Option<&'a CapsuleHandle> {
    let winner = handles.iter().copied().max_by(|a, b| {
        a.version()
            .cmp(&b.version())
            // On a version tie the data copy wins: pre-installed handles
            // compare as the lesser side.
            .then_with(|| repo.is_pre_installed(b).cmp(&repo.is_pre_installed(a)))
    })?;

    let pre = repo.pre_installed(winner.name())?;
    if winner.is_interchangeable_with(pre) {
        return Some(winner);
    }

    debug!(
        name = winner.name(),
        version = winner.version(),
        "selected copy fails key check, falling back to pre-installed"
    );
    // Map the repository's handle back to the borrow held in the caller's
    // grouped view. A view without the pre-installed copy has nothing
    // activatable for this name.
    handles.iter().copied().find(|h| h.path() == pre.path())
}

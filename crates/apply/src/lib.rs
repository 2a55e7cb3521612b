//! Keel apply: the installer-set controller.
//!
//! An installer set is one hashed, immutable bundle of manifests. The
//! controller applies its items in order, tracks per-item status, and retires
//! sets when a newer bundle is Ready or an upgrade is rolled back.

#![forbid(unsafe_code)]

pub mod controller;
pub mod diff;
pub mod readiness;

pub use controller::{
    installer_set_name, owned_by, Bundle, Convergence, InstallerSetController, RolloutPolicy,
};
pub use diff::{diff_summary, is_subset, overlay, strip_noisy, DiffSummary};

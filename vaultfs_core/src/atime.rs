//! Access-time update policy.

use serde::{Deserialize, Serialize};

const RELATIME_STALE_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AtimePolicy {
    NoAtime,
    StrictAtime,
    Relatime,
    NoDirAtimeRelatime,
    NoDirAtimeStrictAtime,
}

/// Decides whether a read of a node should update its `atime`, given the
/// node's current `atime`/`mtime` (seconds since epoch) and the wall-clock
/// time of the operation (`now`, seconds since epoch).
///
/// This is an absolute comparison against `now`, not a monotonic clock read:
/// a system clock jump backward can make `relatime` update atime more often
/// than strictly needed. Accepted trade-off.
pub fn should_update_atime(policy: AtimePolicy, is_dir: bool, atime: i64, mtime: i64, now: i64) -> bool {
    match policy {
        AtimePolicy::NoAtime => false,
        AtimePolicy::StrictAtime => true,
        AtimePolicy::Relatime => relatime_rule(atime, mtime, now),
        AtimePolicy::NoDirAtimeRelatime => {
            if is_dir {
                false
            } else {
                relatime_rule(atime, mtime, now)
            }
        }
        AtimePolicy::NoDirAtimeStrictAtime => !is_dir,
    }
}

fn relatime_rule(atime: i64, mtime: i64, now: i64) -> bool {
    atime < mtime || atime < now - RELATIME_STALE_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    // atime-update matrix across all 5 policies x {file, dir} x
    // {atime<mtime, atime>mtime-but-stale, atime>mtime-and-recent}
    #[test]
    fn atime_matrix() {
        let now = 1_000_000i64;
        let stale = now - RELATIME_STALE_SECS - 10;
        let recent = now - 10;

        // atime < mtime: relatime always updates, regardless of staleness.
        assert!(should_update_atime(AtimePolicy::Relatime, false, 5, 10, now));
        assert!(should_update_atime(AtimePolicy::Relatime, true, 5, 10, now));

        // atime > mtime but stale (> 24h old): relatime updates.
        assert!(should_update_atime(AtimePolicy::Relatime, false, stale, 0, now));

        // atime > mtime and recent: relatime does not update.
        assert!(!should_update_atime(AtimePolicy::Relatime, false, recent, 0, now));

        // noatime never updates, in any case.
        assert!(!should_update_atime(AtimePolicy::NoAtime, false, 5, 10, now));
        assert!(!should_update_atime(AtimePolicy::NoAtime, false, stale, 0, now));

        // strictatime always updates.
        assert!(should_update_atime(AtimePolicy::StrictAtime, true, recent, 0, now));

        // nodiratime_relatime: directories never update; files follow relatime.
        assert!(!should_update_atime(AtimePolicy::NoDirAtimeRelatime, true, 5, 10, now));
        assert!(should_update_atime(AtimePolicy::NoDirAtimeRelatime, false, 5, 10, now));
        assert!(!should_update_atime(
            AtimePolicy::NoDirAtimeRelatime,
            false,
            recent,
            0,
            now
        ));

        // nodiratime_strictatime: directories never update; files always do.
        assert!(!should_update_atime(AtimePolicy::NoDirAtimeStrictAtime, true, 5, 10, now));
        assert!(should_update_atime(
            AtimePolicy::NoDirAtimeStrictAtime,
            false,
            recent,
            0,
            now
        ));
    }
}

//! Backend selection: routing-table overrides, workload probes and the
//! fallback chain.
//!
//! Selection runs in three phases. A routing table shipped by the platform
//! can pin a backend per process name; failing that, translated-GL workloads
//! (zink) are detected and steered to the bypass, since their FBO handling
//! interacts badly with DRI3's copy semantics; finally the chosen preference
//! is attempted with per-backend fallback, with SHM as the universal floor.

use std::{env, fs};

use tracing::info;

use super::PresenterKind;

/// Routing table locations, consulted in order. The first matching line
/// across the files wins.
pub const ROUTING_PATHS: [&str; 2] = [
    "/etc/sky1/wsi-routing.conf",
    "/usr/share/cix-gpu/wsi-routing.conf",
];

/// Environment variable disabling the Xwayland bypass entirely.
pub const NO_BYPASS_ENV: &str = "WSI_NO_WAYLAND_BYPASS";

const MESA_DRIVER_ENV: &str = "MESA_LOADER_DRIVER_OVERRIDE";

const MAX_LINE_LEN: usize = 512;
const MAX_APP_LEN: usize = 255;

/// The backend to try first, before the attempt-and-fallback phase.
pub(crate) fn preferred_backend() -> PresenterKind {
    if let Some(kind) = routing_override() {
        return kind;
    }

    if zink_workload() {
        info!("detected zink workload, preferring the wayland bypass");
        PresenterKind::Bypass
    } else {
        PresenterKind::Dri3
    }
}

/// The attempt order implied by a preference.
pub(crate) fn fallback_chain(preferred: PresenterKind) -> &'static [PresenterKind] {
    match preferred {
        PresenterKind::Bypass => &[PresenterKind::Bypass, PresenterKind::Dri3, PresenterKind::Shm],
        PresenterKind::Dri3 => &[PresenterKind::Dri3, PresenterKind::Bypass, PresenterKind::Shm],
        PresenterKind::Shm => &[PresenterKind::Shm],
    }
}

/// Whether the bypass has been disabled through the environment.
pub(crate) fn bypass_disabled() -> bool {
    env::var_os(NO_BYPASS_ENV).is_some()
}

fn routing_override() -> Option<PresenterKind> {
    let name = process_name()?;

    for path in ROUTING_PATHS {
        let Ok(table) = fs::read_to_string(path) else {
            continue;
        };
        if let Some(kind) = parse_routing_table(&table, &name) {
            info!(path, app = name.as_str(), backend = %kind, "routing table override");
            return Some(kind);
        }
    }

    None
}

/// Short process name as reported by the kernel.
fn process_name() -> Option<String> {
    let comm = fs::read_to_string("/proc/self/comm").ok()?;
    let name = comm.trim_end_matches('\n');
    if name.is_empty() || name.len() > MAX_APP_LEN {
        return None;
    }

    Some(name.to_owned())
}

/// First `<app> <backend>` line of `table` whose first column equals `app`.
fn parse_routing_table(table: &str, app: &str) -> Option<PresenterKind> {
    for line in table.lines() {
        if line.len() > MAX_LINE_LEN || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split_whitespace();
        let (Some(name), Some(backend)) = (fields.next(), fields.next()) else {
            continue;
        };
        if name.len() > MAX_APP_LEN || name != app {
            continue;
        }

        match backend {
            "bypass" => return Some(PresenterKind::Bypass),
            "dri3" => return Some(PresenterKind::Dri3),
            "shm" => return Some(PresenterKind::Shm),
            // A matching app with an unknown backend is ignored, so a typo in
            // one line cannot shadow a valid one further down.
            _ => continue,
        }
    }

    None
}

/// A translated-GL workload that misbehaves with DRI3's copy semantics.
fn zink_workload() -> bool {
    if env::var(MESA_DRIVER_ENV).map(|v| v == "zink").unwrap_or(false) {
        return true;
    }

    fs::read_to_string("/proc/self/maps")
        .map(|maps| maps_contain_zink(&maps))
        .unwrap_or(false)
}

fn maps_contain_zink(maps: &str) -> bool {
    maps.lines().any(|line| line.contains("zink_dri.so"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_table_first_match_wins() {
        let table = "myapp dri3\nmyapp bypass\n";
        assert_eq!(parse_routing_table(table, "myapp"), Some(PresenterKind::Dri3));
    }

    #[test]
    fn routing_table_skips_comments_and_blanks() {
        let table = "# myapp bypass\n\nmyapp shm\n";
        assert_eq!(parse_routing_table(table, "myapp"), Some(PresenterKind::Shm));
    }

    #[test]
    fn routing_table_matches_are_case_sensitive() {
        assert_eq!(parse_routing_table("MyApp bypass\n", "myapp"), None);
    }

    #[test]
    fn routing_table_ignores_unknown_backends() {
        let table = "myapp vulkan\nmyapp bypass\n";
        assert_eq!(parse_routing_table(table, "myapp"), Some(PresenterKind::Bypass));
    }

    #[test]
    fn routing_table_ignores_oversized_lines() {
        let mut table = String::from("myapp bypass");
        table.push_str(&" ".repeat(600));
        table.push_str("\nmyapp shm\n");
        assert_eq!(parse_routing_table(&table, "myapp"), Some(PresenterKind::Shm));
    }

    #[test]
    fn routing_table_requires_two_fields() {
        assert_eq!(parse_routing_table("myapp\n", "myapp"), None);
    }

    #[test]
    fn zink_maps_probe_matches_substring() {
        let maps = "7f5c000-7f5d000 r-xp /usr/lib/dri/zink_dri.so\n";
        assert!(maps_contain_zink(maps));
        assert!(!maps_contain_zink("7f5c000-7f5d000 r-xp /usr/lib/dri/iris_dri.so\n"));
    }

    #[test]
    fn every_preference_falls_back_to_shm() {
        for kind in [PresenterKind::Bypass, PresenterKind::Dri3, PresenterKind::Shm] {
            let chain = fallback_chain(kind);
            assert_eq!(chain.first(), Some(&kind));
            assert_eq!(chain.last(), Some(&PresenterKind::Shm));
        }
    }
}

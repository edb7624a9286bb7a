//! Snapshot metadata as reported by the hypervisor.

use serde::Serialize;

/// A named machine snapshot stored inside the machine's qcow2 drives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    /// Hypervisor-assigned id, `--` when it does not report one.
    pub id: String,
    pub name: String,
    /// Remaining columns (size, date, clock) as printed.
    pub details: String,
}

impl SnapshotInfo {
    pub(crate) fn named(name: &str) -> Self {
        Self {
            id: "--".to_string(),
            name: name.to_string(),
            details: String::new(),
        }
    }
}

/// Parses the output of `info snapshots`.
///
/// ```text
/// List of snapshots present on all disks:
/// ID        TAG               VM SIZE                DATE     VM CLOCK     ICOUNT
/// --        boot              264 MiB 2024-05-01 10:12:44 00:00:15.123
///
/// List of partial (non-loadable) snapshots on 'drive1':
/// ID        TAG               VM SIZE                DATE     VM CLOCK     ICOUNT
/// 1         stale               0 B 2024-04-30 09:00:00 00:00:02.000
/// ```
///
/// Only the snapshots present on all disks can be loaded, so partial
/// sections are ignored. Older QEMU prints a bare table without section
/// titles.
pub fn parse_snapshot_table(output: &str) -> Vec<SnapshotInfo> {
    let lines: Vec<&str> = output.lines().map(str::trim).collect();
    let table = if lines.iter().any(|l| l.starts_with("List of")) {
        match lines
            .iter()
            .position(|l| l.starts_with("List of snapshots present on all disks"))
        {
            Some(title) => {
                let section = &lines[title + 1..];
                let end = section
                    .iter()
                    .position(|l| l.starts_with("List of"))
                    .unwrap_or(section.len());
                &section[..end]
            }
            None => return Vec::new(),
        }
    } else {
        &lines[..]
    };

    table
        .iter()
        .skip_while(|line| !line.starts_with("ID"))
        // Header row.
        .skip(1)
        .take_while(|line| !line.is_empty())
        .filter_map(|line| parse_row(line))
        .collect()
}

fn parse_row(line: &str) -> Option<SnapshotInfo> {
    let (id, rest) = line.split_once(char::is_whitespace)?;
    let rest = rest.trim_start();
    let (name, details) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    if name.is_empty() {
        return None;
    }
    Some(SnapshotInfo {
        id: id.to_string(),
        name: name.to_string(),
        details: details.trim().to_string(),
    })
}

/// Snapshot names are passed through the monitor's command line, which
/// splits on whitespace.
pub(crate) fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}

/// Monitor output for a failed snapshot command, if the output reports one.
pub(crate) fn monitor_error(output: &str) -> Option<String> {
    let output = output.trim();
    if output.is_empty() {
        return None;
    }
    output
        .lines()
        .any(|l| l.starts_with("Error") || l.contains("does not exist"))
        .then(|| output.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_current_format() {
        let output = "List of snapshots present on all disks:\r\n\
ID        TAG               VM SIZE                DATE     VM CLOCK     ICOUNT\r\n\
--        boot              264 MiB 2024-05-01 10:12:44 00:00:15.123\r\n\
--        after-login       301 MiB 2024-05-01 10:13:02 00:00:33.870\r\n";
        let snapshots = parse_snapshot_table(output);
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].name, "boot");
        assert_eq!(snapshots[0].id, "--");
        assert!(snapshots[0].details.starts_with("264 MiB"));
        assert_eq!(snapshots[1].name, "after-login");
    }

    #[test]
    fn parses_legacy_format() {
        let output = "ID        TAG                 VM SIZE                DATE       VM CLOCK\n\
1         boot                   218M 2019-01-01 12:00:00   00:00:10.123\n";
        let snapshots = parse_snapshot_table(output);
        assert_eq!(
            snapshots,
            vec![SnapshotInfo {
                id: "1".to_string(),
                name: "boot".to_string(),
                details: "218M 2019-01-01 12:00:00   00:00:10.123".to_string(),
            }]
        );
    }

    #[test]
    fn ignores_partial_snapshots() {
        let output = "List of snapshots present on all disks:\r\n\
ID        TAG               VM SIZE                DATE     VM CLOCK     ICOUNT\r\n\
--        boot              264 MiB 2024-05-01 10:12:44 00:00:15.123\r\n\
\r\n\
List of partial (non-loadable) snapshots on 'drive1':\r\n\
ID        TAG               VM SIZE                DATE     VM CLOCK     ICOUNT\r\n\
1         stale               0 B 2024-04-30 09:00:00 00:00:02.000\r\n";
        let names: Vec<_> = parse_snapshot_table(output)
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, ["boot"]);
    }

    #[test]
    fn only_partial_snapshots_means_none_loadable() {
        let output = "List of snapshots present on all disks:\r\n\
None\r\n\
\r\n\
List of partial (non-loadable) snapshots on 'drive0':\r\n\
ID        TAG               VM SIZE                DATE     VM CLOCK     ICOUNT\r\n\
1         stale               0 B 2024-04-30 09:00:00 00:00:02.000\r\n";
        assert!(parse_snapshot_table(output).is_empty());
    }

    #[test]
    fn empty_listing() {
        assert!(parse_snapshot_table("There is no snapshot available.\r\n").is_empty());
        assert!(parse_snapshot_table("").is_empty());
    }

    #[test]
    fn validates_names() {
        assert!(is_valid_name("boot"));
        assert!(is_valid_name("after-login.2"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("two words"));
        assert!(!is_valid_name("semi;colon"));
    }

    #[test]
    fn detects_monitor_errors() {
        assert_eq!(monitor_error(""), None);
        assert_eq!(monitor_error("\r\n"), None);
        assert!(
            monitor_error("Error: Device 'drive0' is writable but does not support snapshots\r\n")
                .is_some()
        );
        assert!(monitor_error("Snapshot 'x' does not exist in one or more devices").is_some());
    }
}

// SPDX-License-Identifier: GPL-3.0-only

//! Parsers for `btrfs subvolume` text output

/// One row of `btrfs subvolume list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubvolumeRow {
    pub id: u64,
    pub top_level: u64,
    /// Path relative to the filesystem root, `<FS_TREE>/` prefix removed
    pub path: String,
}

impl SubvolumeRow {
    /// Last path component, which is the subvolume's own name.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

fn field_after<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(key)? + key.len();
    line[start..].split_whitespace().next()
}

/// Parse `btrfs subvolume list` output in any of its flag variants.
///
/// ```text
/// ID 257 gen 9 top level 5 path app
/// ID 258 gen 12 cgen 12 parent 5 top level 5 parent_uuid - received_uuid - uuid 2b.. path <FS_TREE>/app_snap
/// ```
pub fn parse_subvolume_list(output: &str) -> Vec<SubvolumeRow> {
    output
        .lines()
        .filter_map(|line| {
            let (head, path) = line.split_once(" path ")?;
            let path = path.trim();
            let path = path.strip_prefix("<FS_TREE>/").unwrap_or(path);
            Some(SubvolumeRow {
                id: field_after(head, "ID ")?.parse().ok()?,
                top_level: field_after(head, "top level ")?.parse().ok()?,
                path: path.to_string(),
            })
        })
        .collect()
}

/// Object id from `btrfs subvolume show`; the filesystem root is always 5.
pub fn parse_object_id(show_output: &str) -> u64 {
    show_output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Object ID:"))
        .and_then(|id| id.trim().parse().ok())
        .unwrap_or(5)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_detailed_listings() {
        let plain = parse_subvolume_list(
            "ID 257 gen 9 top level 5 path app\nID 259 gen 11 top level 257 path app/nested\n",
        );
        assert_eq!(plain.len(), 2);
        assert_eq!(plain[0].top_level, 5);
        assert_eq!(plain[1].name(), "nested");

        let detailed = parse_subvolume_list(
            "ID 258 gen 12 cgen 12 parent 5 top level 5 parent_uuid 1f2e - received_uuid - uuid 9a8b path <FS_TREE>/app_snap\n",
        );
        assert_eq!(
            detailed,
            [SubvolumeRow {
                id: 258,
                top_level: 5,
                path: "app_snap".to_string(),
            }]
        );
    }

    #[test]
    fn reads_object_id_or_defaults_to_root() {
        let show = "/srv/volumes\n\tName: \t\t\tvolumes\n\tUUID: \t\t\t4c2b\n\tObject ID: \t\t256\n";
        assert_eq!(parse_object_id(show), 256);
        assert_eq!(parse_object_id("/\n\tName: \t\t\t<FS_TREE>\n"), 5);
    }
}

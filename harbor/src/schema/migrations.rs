/// First version delivered as a script. Versions below it are assumed present.
pub const FIRST_MIGRATION_VERSION: i32 = 3;

/// One embedded schema script.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Migration {
    /// Version the schema is at once the script has run.
    pub version: i32,
    /// SQL, possibly several statements, written against unqualified table names.
    pub script: &'static str,
}

fn embedded_script(version: i32) -> Option<&'static str> {
    match version {
        3 => Some(include_str!("../../migrations/install_v3.sql")),
        4 => Some(include_str!("../../migrations/install_v4.sql")),
        5 => Some(include_str!("../../migrations/install_v5.sql")),
        _ => None,
    }
}

/// Embedded migrations in ascending order.
///
/// Discovery stops at the first version without a script.
pub fn discover() -> impl Iterator<Item = Migration> {
    discover_with(embedded_script)
}

/// Migrations newer than `installed`.
pub fn pending(installed: i32) -> Vec<Migration> {
    discover().filter(|m| m.version > installed).collect()
}

/// Latest version the embedded scripts can bring a schema to.
pub fn latest_version() -> i32 {
    discover()
        .last()
        .map_or(FIRST_MIGRATION_VERSION - 1, |m| m.version)
}

fn discover_with<F>(lookup: F) -> impl Iterator<Item = Migration>
where
    F: Fn(i32) -> Option<&'static str>,
{
    (FIRST_MIGRATION_VERSION..).map_while(move |version| {
        lookup(version).map(|script| Migration { version, script })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_scripts_are_contiguous_from_three() {
        let versions: Vec<i32> = discover().map(|m| m.version).collect();
        assert_eq!(versions, vec![3, 4, 5]);
        assert_eq!(latest_version(), 5);
    }

    #[test]
    fn discovery_halts_at_first_gap() {
        let found: Vec<i32> = discover_with(|v| match v {
            3 | 4 | 6 => Some("SELECT 1"),
            _ => None,
        })
        .map(|m| m.version)
        .collect();
        assert_eq!(found, vec![3, 4]);
    }

    #[test]
    fn missing_first_script_means_nothing_to_apply() {
        assert_eq!(discover_with(|_| None).count(), 0);
    }

    #[test]
    fn pending_filters_strictly_newer() {
        assert_eq!(pending(1).len(), 3);
        assert_eq!(
            pending(4).iter().map(|m| m.version).collect::<Vec<_>>(),
            vec![5]
        );
        assert!(pending(5).is_empty());
        assert!(pending(42).is_empty());
    }

    #[test]
    fn base_script_seeds_version_row() {
        let base = discover().next().unwrap();
        assert!(base.script.contains("CREATE TABLE IF NOT EXISTS jobqueue"));
        assert!(base.script.contains("INSERT INTO \"schema\""));
    }
}

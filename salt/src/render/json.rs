use crate::walker::SlabSnapshot;

/// Pretty JSON array of the selected entries, root first
///
/// # Errors
/// Serialization failure
pub fn render_snapshot(
    snapshot: &SlabSnapshot,
    targets: Option<&[String]>,
) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&snapshot.select(targets))
}

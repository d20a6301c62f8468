use keyload_core::{ConfiguredKey, KeyId, LoadedKey};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "table" => Some(Self::Table),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

fn trunc(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{kept}…")
    }
}

/// Configured keys as an aligned table: ID | NAME | ENCRYPTED
pub fn configured_table(keys: &[ConfiguredKey]) -> String {
    const MAX_NAME: usize = 40;

    if keys.is_empty() {
        return "No keys configured.\n".to_string();
    }

    let id_w = keys.iter().map(|k| k.id.as_str().len()).max().unwrap_or(0).max(2);
    let name_w = keys
        .iter()
        .map(|k| k.name.chars().count().min(MAX_NAME))
        .max()
        .unwrap_or(0)
        .max(4);

    let mut out = format!("{:<id_w$}  {:<name_w$}  ENCRYPTED\n", "ID", "NAME");
    out.push_str(&"-".repeat(id_w + name_w + 13));
    out.push('\n');
    for key in keys {
        out.push_str(&format!(
            "{:<id_w$}  {:<name_w$}  {}\n",
            key.id,
            trunc(&key.name, MAX_NAME),
            if key.encrypted { "yes" } else { "no" },
        ));
    }
    out
}

pub fn configured_json(keys: &[ConfiguredKey]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(keys)
}

/// A loaded key with the values callers most often need already derived.
#[derive(Serialize)]
struct LoadedRow<'a> {
    #[serde(flatten)]
    key: &'a LoadedKey,
    id: Option<KeyId>,
    fingerprint: Option<String>,
}

/// Loaded keys as an aligned table: TYPE | FINGERPRINT | ID | COMMENT
///
/// Keys not loaded by keyload show `-` in the ID column.
pub fn loaded_table(keys: &[LoadedKey]) -> String {
    if keys.is_empty() {
        return "No keys loaded.\n".to_string();
    }

    let rows: Vec<(String, String, String, &str)> = keys
        .iter()
        .map(|k| {
            (
                k.key_type.clone(),
                k.fingerprint().unwrap_or_else(|| "-".to_string()),
                k.id().map_or_else(|| "-".to_string(), |id| id.to_string()),
                k.comment.as_str(),
            )
        })
        .collect();

    let type_w = rows.iter().map(|r| r.0.len()).max().unwrap_or(0).max(4);
    let fp_w = rows.iter().map(|r| r.1.len()).max().unwrap_or(0).max(11);
    let id_w = rows.iter().map(|r| r.2.len()).max().unwrap_or(0).max(2);

    let mut out = format!(
        "{:<type_w$}  {:<fp_w$}  {:<id_w$}  COMMENT\n",
        "TYPE", "FINGERPRINT", "ID"
    );
    out.push_str(&"-".repeat(type_w + fp_w + id_w + 13));
    out.push('\n');
    for (key_type, fingerprint, id, comment) in &rows {
        out.push_str(&format!(
            "{key_type:<type_w$}  {fingerprint:<fp_w$}  {id:<id_w$}  {comment}\n"
        ));
    }
    out
}

pub fn loaded_json(keys: &[LoadedKey]) -> serde_json::Result<String> {
    let rows: Vec<LoadedRow<'_>> = keys
        .iter()
        .map(|key| LoadedRow {
            key,
            id: key.id(),
            fingerprint: key.fingerprint(),
        })
        .collect();
    serde_json::to_string_pretty(&rows)
}

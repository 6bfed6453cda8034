use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{KarmaError, Result};
use crate::table::Table;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> KarmaError + '_ {
    move |source| KarmaError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read_to_string(path).map_err(io_err(path))?;
    Ok(serde_json::from_str(&data)?)
}

/// Loads a JSON array of records. An empty table is rejected.
pub fn load_table(path: &Path) -> Result<Table> {
    let table: Table = load_json(path)?;
    if table.is_empty() {
        return Err(KarmaError::validation(
            format!("loaded zero rows from {}", path.display()),
            vec![],
        ));
    }
    Ok(table)
}

/// Like [`load_table`], but a missing file reads as `None`.
pub fn load_optional_table(path: &Path) -> Result<Option<Table>> {
    if path.exists() {
        load_table(path).map(Some)
    } else {
        Ok(None)
    }
}

/// Writes `value` as pretty JSON, creating parent directories.
pub fn save_json<T: Serialize + ?Sized>(value: &T, path: &Path) -> Result<PathBuf> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let data = serde_json::to_string_pretty(value)?;
    fs::write(path, data).map_err(io_err(path))?;
    Ok(path.to_path_buf())
}

//! `backup` / `backup list` / `backup restore N`: tar snapshots of
//! `data/memory.db`, `agent.toml`, and `scripts/` under
//! `flatline/updates/backups/`.

use flatline_kernel::config::RuntimePaths;
use std::path::{Path, PathBuf};

fn backups_dir(paths: &RuntimePaths) -> PathBuf {
    paths.flatline_dir.join("updates").join("backups")
}

pub fn create(paths: &RuntimePaths) -> anyhow::Result<PathBuf> {
    let dir = backups_dir(paths);
    std::fs::create_dir_all(&dir)?;

    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
    let archive_path = dir.join(format!("{stamp}.tar"));
    let file = std::fs::File::create(&archive_path)?;
    let mut builder = tar::Builder::new(file);

    if paths.memory_db.exists() {
        builder.append_path_with_name(&paths.memory_db, "memory.db")?;
    }
    if paths.agent_toml.exists() {
        builder.append_path_with_name(&paths.agent_toml, "agent.toml")?;
    }
    if paths.tools_dir.is_dir() {
        builder.append_dir_all("scripts", &paths.tools_dir)?;
    }
    builder.finish()?;

    Ok(archive_path)
}

pub fn list(paths: &RuntimePaths) -> anyhow::Result<Vec<PathBuf>> {
    let dir = backups_dir(paths);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("tar"))
        .collect();
    entries.sort();
    Ok(entries)
}

pub fn restore(paths: &RuntimePaths, index: usize) -> anyhow::Result<()> {
    let entries = list(paths)?;
    let archive_path = entries
        .get(index)
        .ok_or_else(|| anyhow::anyhow!("no backup at index {index}"))?;
    extract(archive_path, &paths.root)
}

fn extract(archive_path: &Path, dest: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = tar::Archive::new(file);
    archive.unpack(dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_list_then_restore_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RuntimePaths::resolve(dir.path());
        paths.ensure_dirs().unwrap();
        std::fs::write(&paths.agent_toml, "name = \"test\"").unwrap();

        let archive = create(&paths).unwrap();
        assert!(archive.exists());
        assert_eq!(list(&paths).unwrap().len(), 1);

        std::fs::remove_file(&paths.agent_toml).unwrap();
        restore(&paths, 0).unwrap();
        assert!(paths.agent_toml.exists());
    }
}

//! The path to file mapping.
//!
//! A [`FileTable`] is only reachable through the filesystem's table mutex,
//! so holding the guard is what grants access to these methods.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::file::ZoneFile;
use crate::snapshot::{FileRecord, SnapshotRecord};

/// Lexically normalises a path into an absolute form without `.`, `..`,
/// repeated or trailing separators.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Authoritative mapping from normalised path to file.
#[derive(Debug)]
pub struct FileTable {
    files: BTreeMap<String, Arc<ZoneFile>>,
    next_file_id: u64,
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTable {
    /// Creates an empty table. File ids start at 1.
    pub fn new() -> Self {
        Self {
            files: BTreeMap::new(),
            next_file_id: 1,
        }
    }

    /// Looks up a path.
    pub fn get(&self, path: &str) -> Option<&Arc<ZoneFile>> {
        self.files.get(path)
    }

    /// True if the path names a zoned file.
    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Maps `path` to `file`, returning any previous mapping.
    pub fn insert(&mut self, path: impl Into<String>, file: Arc<ZoneFile>) -> Option<Arc<ZoneFile>> {
        self.files.insert(path.into(), file)
    }

    /// Removes a path mapping.
    pub fn remove_name(&mut self, path: &str) -> Option<Arc<ZoneFile>> {
        self.files.remove(path)
    }

    /// Hands out a fresh file id.
    pub fn allocate_id(&mut self) -> u64 {
        let id = self.next_file_id;
        self.next_file_id += 1;
        id
    }

    /// Makes sure future ids are larger than `id`.
    pub fn observe_id(&mut self, id: u64) {
        self.next_file_id = self.next_file_id.max(id + 1);
    }

    /// The id the next file will get.
    pub fn next_file_id(&self) -> u64 {
        self.next_file_id
    }

    /// Finds a file by id.
    pub fn find_by_id(&self, id: u64) -> Option<Arc<ZoneFile>> {
        self.files.values().find(|f| f.id() == id).cloned()
    }

    /// Every file once, in id order, even if it has several names.
    pub fn unique_files(&self) -> Vec<Arc<ZoneFile>> {
        let mut by_id: BTreeMap<u64, Arc<ZoneFile>> = BTreeMap::new();
        for file in self.files.values() {
            by_id.entry(file.id()).or_insert_with(|| Arc::clone(file));
        }
        by_id.into_values().collect()
    }

    /// Names of zoned files below `dir`, relative to it. Without
    /// `include_grandchildren` only direct children are listed.
    pub fn children(&self, dir: &str, include_grandchildren: bool) -> Vec<String> {
        let dir = normalize_path(dir);
        let prefix = if dir == "/" { dir } else { format!("{}/", dir) };
        self.files
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .map(|(path, _)| &path[prefix.len()..])
            .filter(|rel| include_grandchildren || !rel.contains('/'))
            .map(str::to_string)
            .collect()
    }

    /// Number of names in the table.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True if no files exist.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Iterates over all names and their files.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<ZoneFile>)> {
        self.files.iter()
    }

    /// Drops every mapping.
    pub fn clear(&mut self) {
        self.files.clear();
    }

    /// Builds a full snapshot, with the extent count each file record covers.
    pub fn snapshot_record(&self) -> (SnapshotRecord, Vec<(Arc<ZoneFile>, usize)>) {
        let mut files = Vec::new();
        let mut synced = Vec::new();
        for file in self.unique_files() {
            let (rec, count) = file.metadata_record(true);
            files.push(rec);
            synced.push((file, count));
        }
        (SnapshotRecord { files }, synced)
    }

    /// Full records keyed by name.
    pub fn records(&self) -> BTreeMap<String, FileRecord> {
        self.files
            .iter()
            .map(|(name, file)| (name.clone(), file.to_record()))
            .collect()
    }

    /// Distinct top-level directory components under `dir` that zoned files live in.
    pub fn child_dirs(&self, dir: &str) -> BTreeSet<String> {
        self.children(dir, true)
            .into_iter()
            .filter_map(|rel| rel.split_once('/').map(|(d, _)| d.to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::WriteLifetimeHint;

    fn file(id: u64, name: &str) -> Arc<ZoneFile> {
        Arc::new(ZoneFile::new(id, name, WriteLifetimeHint::Short))
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("db/000001.log"), "/db/000001.log");
        assert_eq!(normalize_path("//db/./x/../y/"), "/db/y");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/../a"), "/a");
    }

    #[test]
    fn test_allocate_ids_are_unique() {
        let mut table = FileTable::new();
        assert_eq!(table.allocate_id(), 1);
        assert_eq!(table.allocate_id(), 2);
        table.observe_id(10);
        assert_eq!(table.allocate_id(), 11);
        table.observe_id(3);
        assert_eq!(table.allocate_id(), 12);
    }

    #[test]
    fn test_children() {
        let mut table = FileTable::new();
        table.insert("/db/a", file(1, "/db/a"));
        table.insert("/db/b", file(2, "/db/b"));
        table.insert("/db/sub/c", file(3, "/db/sub/c"));
        table.insert("/dbx/d", file(4, "/dbx/d"));

        assert_eq!(table.children("/db", false), vec!["a", "b"]);
        assert_eq!(table.children("/db/", true), vec!["a", "b", "sub/c"]);
        assert_eq!(table.children("/", false), Vec::<String>::new());
        assert_eq!(table.children("/", true).len(), 4);
        assert_eq!(
            table.child_dirs("/"),
            ["db".to_string(), "dbx".to_string()].into_iter().collect()
        );
    }

    #[test]
    fn test_unique_files_dedups_links() {
        let mut table = FileTable::new();
        let f = file(1, "/a");
        f.add_link("/b");
        table.insert("/a", f.clone());
        table.insert("/b", f);
        table.insert("/c", file(2, "/c"));
        assert_eq!(table.len(), 3);
        assert_eq!(table.unique_files().len(), 2);

        let (snapshot, synced) = table.snapshot_record();
        assert_eq!(snapshot.files.len(), 2);
        assert_eq!(snapshot.files[0].links.len(), 2);
        assert_eq!(synced.len(), 2);
    }

    #[test]
    fn test_find_by_id() {
        let mut table = FileTable::new();
        table.insert("/a", file(5, "/a"));
        assert_eq!(table.find_by_id(5).unwrap().id(), 5);
        assert!(table.find_by_id(6).is_none());
        assert!(table.remove_name("/a").is_some());
        assert!(table.is_empty());
    }
}

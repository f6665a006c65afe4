//! Hierarchical experiment data store
//!
//! A path-addressable tree of groups in the experiment → protocol → trial
//! shape, with typed attributes, fixed-shape datasets supporting partial
//! in-place writes, soft links (warmup/cooldown aliasing) and atomic group
//! deletion. The tree persists as one JSON document; `flush` rewrites the
//! backing file and is called at segment boundaries and shutdown to bound
//! data loss.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EcaError, Result};

/// Attribute and dataset names used across the tree
pub mod keys {
    pub const TITLE: &str = "Title";
    pub const PROTOCOL_STRING: &str = "Protocol String";
    pub const RANDOMIZED: &str = "Randomized";
    pub const REPEATS: &str = "Repeats";
    pub const CREATED_AT: &str = "Created At";
    pub const PROCESSED: &str = "Processed";
    pub const ARENA_ANGULAR_SIZE: &str = "Arena: Angular Size";
    pub const ARENA_MODE: &str = "Arena: Mode";
    pub const ARENA_BRIGHTNESS: &str = "Arena: Brightness percent";
    pub const NUMBER_OF_SAMPLES: &str = "Number of Samples";
    pub const PROTOCOL_LIST: &str = "Protocol List";
    pub const TRIAL_END_POINTS: &str = "Trial End Point List";
    pub const TRIAL_COMPLETED: &str = "Trial Completed";

    pub const ANALOG_OUT: &str = "Analog Out";
    pub const DIGITAL_OUT: &str = "Digital Out";
    pub const ANALOG_IN: &str = "Analog In";
    pub const DIGITAL_IN: &str = "Digital In";

    pub const PROCESSED_DATA: &str = "Processed Data";
    pub const MEMBRANE_POTENTIAL: &str = "Membrane Potential";
    pub const SPIKE_POSITIONS: &str = "Spike Position List";
    pub const MOVEMENT: &str = "Movement";
    pub const MEAN_MOVEMENT: &str = "Mean Movement";
    pub const RASTER: &str = "Raster";
    pub const PRE_RATE: &str = "Pre Rate Histogram";

    pub const WARMUP: &str = "warmup";
    pub const COOLDOWN: &str = "cooldown";
}

/// Typed group attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    TextList(Vec<String>),
    IntList(Vec<u64>),
}

/// serde_json writes non-finite floats as `null`; map those back to NaN so
/// a store flushed mid-trial (with unwritten NaN rows) reopens cleanly.
mod nan_floats {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        data.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        let values: Vec<Option<f64>> = Vec::deserialize(deserializer)?;
        Ok(values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    }
}

/// Fixed-shape row-major dataset
///
/// Shape is fixed at creation; writes address whole rows and must stay in
/// bounds. Float datasets fill with NaN so unwritten regions are visibly
/// absent; byte datasets fill with zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dataset {
    Float {
        rows: usize,
        cols: usize,
        #[serde(with = "nan_floats")]
        data: Vec<f64>,
    },
    Byte {
        rows: usize,
        cols: usize,
        data: Vec<u8>,
    },
}

impl Dataset {
    pub fn float_filled(rows: usize, cols: usize) -> Self {
        Self::Float {
            rows,
            cols,
            data: vec![f64::NAN; rows * cols],
        }
    }

    pub fn byte_filled(rows: usize, cols: usize) -> Self {
        Self::Byte {
            rows,
            cols,
            data: vec![0; rows * cols],
        }
    }

    pub fn from_floats(cols: usize, data: Vec<f64>) -> Result<Self> {
        if cols == 0 || data.len() % cols != 0 {
            return Err(EcaError::Store(format!(
                "Dataset of {} values is not a whole number of {}-column rows",
                data.len(),
                cols
            )));
        }
        Ok(Self::Float {
            rows: data.len() / cols,
            cols,
            data,
        })
    }

    pub fn from_bytes(cols: usize, data: Vec<u8>) -> Result<Self> {
        if cols == 0 || data.len() % cols != 0 {
            return Err(EcaError::Store(format!(
                "Dataset of {} values is not a whole number of {}-column rows",
                data.len(),
                cols
            )));
        }
        Ok(Self::Byte {
            rows: data.len() / cols,
            cols,
            data,
        })
    }

    /// Build from equal-length rows; empty input makes a 0×0 float dataset.
    pub fn from_float_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        if rows.iter().any(|r| r.len() != cols) {
            return Err(EcaError::Store("Ragged dataset rows".to_string()));
        }
        Ok(Self::Float {
            rows: rows.len(),
            cols,
            data: rows.iter().flatten().copied().collect(),
        })
    }

    pub fn rows(&self) -> usize {
        match self {
            Self::Float { rows, .. } | Self::Byte { rows, .. } => *rows,
        }
    }

    pub fn cols(&self) -> usize {
        match self {
            Self::Float { cols, .. } | Self::Byte { cols, .. } => *cols,
        }
    }

    fn check_write(&self, row_offset: usize, values: usize) -> Result<usize> {
        let (rows, cols) = (self.rows(), self.cols());
        if cols == 0 || values % cols != 0 {
            return Err(EcaError::Store(format!(
                "Write of {} values is not a whole number of {}-column rows",
                values, cols
            )));
        }
        let n_rows = values / cols;
        if row_offset + n_rows > rows {
            return Err(EcaError::Store(format!(
                "Write of rows {}..{} outside dataset of {} rows",
                row_offset,
                row_offset + n_rows,
                rows
            )));
        }
        Ok(row_offset * cols)
    }

    /// In-place partial write of whole rows starting at `row_offset`
    pub fn write_float_rows(&mut self, row_offset: usize, block: &[f64]) -> Result<()> {
        let start = self.check_write(row_offset, block.len())?;
        match self {
            Self::Float { data, .. } => {
                data[start..start + block.len()].copy_from_slice(block);
                Ok(())
            }
            Self::Byte { .. } => Err(EcaError::Store(
                "Float write into byte dataset".to_string(),
            )),
        }
    }

    pub fn write_byte_rows(&mut self, row_offset: usize, block: &[u8]) -> Result<()> {
        let start = self.check_write(row_offset, block.len())?;
        match self {
            Self::Byte { data, .. } => {
                data[start..start + block.len()].copy_from_slice(block);
                Ok(())
            }
            Self::Float { .. } => Err(EcaError::Store(
                "Byte write into float dataset".to_string(),
            )),
        }
    }

    pub fn float_data(&self) -> Result<&[f64]> {
        match self {
            Self::Float { data, .. } => Ok(data),
            Self::Byte { .. } => Err(EcaError::Store("Expected float dataset".to_string())),
        }
    }

    pub fn byte_data(&self) -> Result<&[u8]> {
        match self {
            Self::Byte { data, .. } => Ok(data),
            Self::Float { .. } => Err(EcaError::Store("Expected byte dataset".to_string())),
        }
    }

    /// Contiguous rows `row_start..row_end` of a float dataset
    pub fn float_rows_slice(&self, row_start: usize, row_end: usize) -> Result<&[f64]> {
        let cols = self.cols();
        if row_end > self.rows() || row_start > row_end {
            return Err(EcaError::Store(format!(
                "Row range {}..{} outside dataset of {} rows",
                row_start,
                row_end,
                self.rows()
            )));
        }
        Ok(&self.float_data()?[row_start * cols..row_end * cols])
    }

    /// One column as f64, regardless of storage type
    pub fn column(&self, col: usize) -> Result<Vec<f64>> {
        let cols = self.cols();
        if col >= cols {
            return Err(EcaError::Store(format!(
                "Column {} outside dataset of {} columns",
                col, cols
            )));
        }
        Ok(match self {
            Self::Float { data, .. } => data.iter().skip(col).step_by(cols).copied().collect(),
            Self::Byte { data, .. } => data
                .iter()
                .skip(col)
                .step_by(cols)
                .map(|&v| v as f64)
                .collect(),
        })
    }
}

/// Tree node: a real group or a soft link to an absolute path
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    Group(Group),
    Link(String),
}

/// One group: attributes, datasets and named children
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Group {
    pub attrs: BTreeMap<String, AttrValue>,
    pub datasets: BTreeMap<String, Dataset>,
    pub children: BTreeMap<String, Node>,
}

impl Group {
    pub fn set_attr(&mut self, key: &str, value: AttrValue) {
        self.attrs.insert(key.to_string(), value);
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }

    pub fn bool_attr(&self, key: &str) -> Option<bool> {
        match self.attrs.get(key) {
            Some(AttrValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn int_attr(&self, key: &str) -> Option<i64> {
        match self.attrs.get(key) {
            Some(AttrValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn float_attr(&self, key: &str) -> Option<f64> {
        match self.attrs.get(key) {
            Some(AttrValue::Float(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn text_attr(&self, key: &str) -> Option<&str> {
        match self.attrs.get(key) {
            Some(AttrValue::Text(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn text_list_attr(&self, key: &str) -> Option<&[String]> {
        match self.attrs.get(key) {
            Some(AttrValue::TextList(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn int_list_attr(&self, key: &str) -> Option<&[u64]> {
        match self.attrs.get(key) {
            Some(AttrValue::IntList(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn create_dataset(&mut self, name: &str, dataset: Dataset) -> Result<()> {
        if self.datasets.contains_key(name) {
            return Err(EcaError::Store(format!("Dataset already present: {}", name)));
        }
        self.datasets.insert(name.to_string(), dataset);
        Ok(())
    }

    /// Create or overwrite a dataset (used by derived-data recomputation)
    pub fn put_dataset(&mut self, name: &str, dataset: Dataset) {
        self.datasets.insert(name.to_string(), dataset);
    }

    pub fn dataset(&self, name: &str) -> Result<&Dataset> {
        self.datasets
            .get(name)
            .ok_or_else(|| EcaError::Store(format!("No such dataset: {}", name)))
    }

    pub fn dataset_mut(&mut self, name: &str) -> Result<&mut Dataset> {
        self.datasets
            .get_mut(name)
            .ok_or_else(|| EcaError::Store(format!("No such dataset: {}", name)))
    }

    pub fn has_child(&self, name: &str) -> bool {
        self.children.contains_key(name)
    }

    /// Child names in insertion-independent (sorted) order
    pub fn child_names(&self) -> Vec<String> {
        self.children.keys().cloned().collect()
    }
}

const MAX_LINK_HOPS: usize = 8;

/// The file-backed store
///
/// Paths are `/`-separated and relative to the root (`"exp/mec(4,5,4,0,120,0.4)/Trial-1"`).
/// Soft-link targets are absolute, e.g. `"/warmup"`.
#[derive(Debug, Serialize, Deserialize)]
pub struct DataStore {
    root: Group,
    #[serde(skip)]
    backing: Option<PathBuf>,
}

fn components(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

impl DataStore {
    pub fn in_memory() -> Self {
        Self {
            root: Group::default(),
            backing: None,
        }
    }

    /// Open an existing store file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let root: Group = serde_json::from_reader(BufReader::new(file))?;
        Ok(Self {
            root,
            backing: Some(path.as_ref().to_path_buf()),
        })
    }

    /// Open a store file, creating an empty one if absent
    pub fn open_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::open(path)
        } else {
            log::info!("Creating data store at {}", path.as_ref().display());
            let store = Self {
                root: Group::default(),
                backing: Some(path.as_ref().to_path_buf()),
            };
            store.flush()?;
            Ok(store)
        }
    }

    /// Rewrite the backing file; a no-op for in-memory stores
    pub fn flush(&self) -> Result<()> {
        if let Some(path) = &self.backing {
            let file = File::create(path)?;
            serde_json::to_writer(BufWriter::new(file), &self.root)?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Group {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Group {
        &mut self.root
    }

    /// Resolve a path to its concrete (link-free) component list
    fn canonicalize(&self, path: &str) -> Result<Vec<String>> {
        let mut pending = components(path);
        let mut canonical: Vec<String> = Vec::new();
        let mut current = &self.root;
        let mut hops = 0;
        let mut i = 0;
        while i < pending.len() {
            match current.children.get(&pending[i]) {
                Some(Node::Group(group)) => {
                    canonical.push(pending[i].clone());
                    current = group;
                    i += 1;
                }
                Some(Node::Link(target)) => {
                    hops += 1;
                    if hops > MAX_LINK_HOPS {
                        return Err(EcaError::Store(format!(
                            "Soft-link cycle resolving: {}",
                            path
                        )));
                    }
                    let mut rerouted = components(target);
                    rerouted.extend(pending[i + 1..].iter().cloned());
                    pending = rerouted;
                    canonical.clear();
                    current = &self.root;
                    i = 0;
                }
                None => {
                    return Err(EcaError::Store(format!("No such group: {}", path)));
                }
            }
        }
        Ok(canonical)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.canonicalize(path).is_ok()
    }

    pub fn group(&self, path: &str) -> Result<&Group> {
        let canonical = self.canonicalize(path)?;
        let mut current = &self.root;
        for name in &canonical {
            current = match current.children.get(name) {
                Some(Node::Group(group)) => group,
                _ => unreachable!("canonical path must be link-free"),
            };
        }
        Ok(current)
    }

    pub fn group_mut(&mut self, path: &str) -> Result<&mut Group> {
        let canonical = self.canonicalize(path)?;
        let mut current = &mut self.root;
        for name in &canonical {
            current = match current.children.get_mut(name) {
                Some(Node::Group(group)) => group,
                _ => unreachable!("canonical path must be link-free"),
            };
        }
        Ok(current)
    }

    /// Create an empty group; the parent must exist, the leaf must not.
    pub fn create_group(&mut self, path: &str) -> Result<&mut Group> {
        let comps = components(path);
        let leaf = comps
            .last()
            .ok_or_else(|| EcaError::Store("Empty group path".to_string()))?
            .clone();
        let parent_path = comps[..comps.len() - 1].join("/");
        let parent = self.group_mut(&parent_path)?;
        if parent.children.contains_key(&leaf) {
            return Err(EcaError::Store(format!("Group already present: {}", path)));
        }
        parent
            .children
            .insert(leaf.clone(), Node::Group(Group::default()));
        match parent.children.get_mut(&leaf) {
            Some(Node::Group(group)) => Ok(group),
            _ => unreachable!(),
        }
    }

    /// Create a soft link at `path` pointing to absolute `target`
    pub fn create_link(&mut self, path: &str, target: &str) -> Result<()> {
        let comps = components(path);
        let leaf = comps
            .last()
            .ok_or_else(|| EcaError::Store("Empty link path".to_string()))?
            .clone();
        let parent_path = comps[..comps.len() - 1].join("/");
        let parent = self.group_mut(&parent_path)?;
        if parent.children.contains_key(&leaf) {
            return Err(EcaError::Store(format!("Group already present: {}", path)));
        }
        parent.children.insert(leaf, Node::Link(target.to_string()));
        Ok(())
    }

    /// Remove a group (or link) and its whole subtree in one step
    pub fn delete(&mut self, path: &str) -> Result<()> {
        let comps = components(path);
        let leaf = comps
            .last()
            .ok_or_else(|| EcaError::Store("Empty group path".to_string()))?
            .clone();
        let parent_path = comps[..comps.len() - 1].join("/");
        let parent = self.group_mut(&parent_path)?;
        parent
            .children
            .remove(&leaf)
            .ok_or_else(|| EcaError::Store(format!("No such group: {}", path)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_creation_and_lookup() {
        let mut store = DataStore::in_memory();
        store.create_group("exp").unwrap();
        store.create_group("exp/protocol").unwrap();
        assert!(store.contains("exp/protocol"));
        assert!(!store.contains("exp/other"));
        assert!(store.create_group("exp/protocol").is_err());
        assert!(store.create_group("missing/child").is_err());
    }

    #[test]
    fn test_soft_link_resolution() {
        let mut store = DataStore::in_memory();
        let warmup = store.create_group("warmup").unwrap();
        warmup.set_attr(keys::NUMBER_OF_SAMPLES, AttrValue::Int(5_000));
        store.create_link("cooldown", "/warmup").unwrap();
        store.create_group("exp").unwrap();
        store.create_link("exp/warmup", "/warmup").unwrap();
        store.create_link("exp/cooldown", "/cooldown").unwrap();

        // two-hop chain: exp/cooldown -> /cooldown -> /warmup
        let group = store.group("exp/cooldown").unwrap();
        assert_eq!(group.int_attr(keys::NUMBER_OF_SAMPLES), Some(5_000));

        // mutation through a link lands on the target
        store
            .group_mut("exp/warmup")
            .unwrap()
            .set_attr("touched", AttrValue::Bool(true));
        assert_eq!(store.group("warmup").unwrap().bool_attr("touched"), Some(true));
    }

    #[test]
    fn test_link_cycle_detected() {
        let mut store = DataStore::in_memory();
        store.create_link("a", "/b").unwrap();
        store.create_link("b", "/a").unwrap();
        assert!(store.group("a").is_err());
    }

    #[test]
    fn test_dataset_partial_writes() {
        let mut dataset = Dataset::float_filled(4, 3);
        assert!(dataset.float_data().unwrap().iter().all(|v| v.is_nan()));
        dataset.write_float_rows(1, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(dataset.float_rows_slice(1, 2).unwrap(), &[1.0, 2.0, 3.0]);
        assert!(dataset.float_data().unwrap()[0].is_nan());
        // out-of-bounds and ragged writes are rejected
        assert!(dataset.write_float_rows(3, &[0.0; 6]).is_err());
        assert!(dataset.write_float_rows(0, &[0.0; 4]).is_err());
    }

    #[test]
    fn test_dataset_column_extraction() {
        let dataset = Dataset::from_floats(2, vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0]).unwrap();
        assert_eq!(dataset.column(0).unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(dataset.column(1).unwrap(), vec![10.0, 20.0, 30.0]);
        assert!(dataset.column(2).is_err());
    }

    #[test]
    fn test_delete_subtree() {
        let mut store = DataStore::in_memory();
        store.create_group("exp").unwrap();
        store.create_group("exp/p").unwrap();
        store.create_group("exp/p/Trial-1").unwrap();
        store.delete("exp/p").unwrap();
        assert!(!store.contains("exp/p/Trial-1"));
        assert!(store.contains("exp"));
        assert!(store.delete("exp/p").is_err());
    }

    #[test]
    fn test_save_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.ecaf");
        {
            let mut store = DataStore::open_or_create(&path).unwrap();
            let group = store.create_group("exp").unwrap();
            group.set_attr(keys::TITLE, AttrValue::Text("exp".to_string()));
            group
                .create_dataset(keys::ANALOG_OUT, Dataset::from_floats(2, vec![0.5, -0.5]).unwrap())
                .unwrap();
            store.create_link("cooldown", "/exp").unwrap();
            store.flush().unwrap();
        }
        let store = DataStore::open(&path).unwrap();
        assert_eq!(store.group("exp").unwrap().text_attr(keys::TITLE), Some("exp"));
        assert_eq!(
            store
                .group("cooldown")
                .unwrap()
                .dataset(keys::ANALOG_OUT)
                .unwrap()
                .float_data()
                .unwrap(),
            &[0.5, -0.5]
        );
    }

    #[test]
    fn test_partially_written_dataset_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.ecaf");
        {
            let mut store = DataStore::open_or_create(&path).unwrap();
            let group = store.create_group("exp").unwrap();
            let mut dataset = Dataset::float_filled(3, 2);
            dataset.write_float_rows(0, &[1.0, 2.0]).unwrap();
            group.create_dataset(keys::ANALOG_IN, dataset).unwrap();
            store.flush().unwrap();
        }
        let store = DataStore::open(&path).unwrap();
        let data = store
            .group("exp")
            .unwrap()
            .dataset(keys::ANALOG_IN)
            .unwrap()
            .float_data()
            .unwrap();
        assert_eq!(&data[..2], &[1.0, 2.0]);
        assert!(data[2..].iter().all(|v| v.is_nan()));
    }
}

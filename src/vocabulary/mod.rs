//! ORB vocabulary tree in DBoW2 text format.
//!
//! The matcher only needs the vocabulary to partition descriptors: two
//! features are compared only when they descend through the same node a few
//! levels above the leaves. The weighted word histogram is computed in the
//! same pass and stored alongside for callers that rank candidates.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::frame::{descriptor_distance, Descriptor, DESCRIPTOR_BYTES};

/// Word id -> L1-normalized TF-IDF weight.
pub type BowVector = HashMap<u32, f64>;

/// Node id -> ascending indices of the features that descended through it.
///
/// Ordered by node id so two vectors can be walked in lockstep.
pub type FeatureVector = BTreeMap<u32, Vec<usize>>;

const ROOT: u32 = 0;

#[derive(Debug, Clone)]
struct Node {
    children: Vec<u32>,
    descriptor: Descriptor,
    weight: f64,
    word: Option<u32>,
}

impl Node {
    fn root() -> Self {
        Self {
            children: Vec::new(),
            descriptor: [0u8; DESCRIPTOR_BYTES],
            weight: 0.0,
            word: None,
        }
    }
}

/// Hierarchical k-means tree over ORB descriptors.
#[derive(Debug)]
pub struct OrbVocabulary {
    nodes: Vec<Node>,
    num_words: usize,
    branching: usize,
    depth: usize,
}

/// Errors from reading a vocabulary file.
#[derive(Debug)]
pub enum VocabularyError {
    Io(std::io::Error),
    /// Malformed content, with the 1-based line number.
    Parse { line: usize, message: String },
}

impl std::fmt::Display for VocabularyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VocabularyError::Io(e) => write!(f, "vocabulary I/O error: {}", e),
            VocabularyError::Parse { line, message } => {
                write!(f, "vocabulary parse error at line {}: {}", line, message)
            }
        }
    }
}

impl std::error::Error for VocabularyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VocabularyError::Io(e) => Some(e),
            VocabularyError::Parse { .. } => None,
        }
    }
}

impl From<std::io::Error> for VocabularyError {
    fn from(e: std::io::Error) -> Self {
        VocabularyError::Io(e)
    }
}

fn parse_error(line: usize, message: impl Into<String>) -> VocabularyError {
    VocabularyError::Parse {
        line,
        message: message.into(),
    }
}

impl OrbVocabulary {
    /// Load a vocabulary from a DBoW2 text file (e.g. `ORBvoc.txt`).
    pub fn load_from_text<P: AsRef<Path>>(path: P) -> Result<Self, VocabularyError> {
        let vocabulary = Self::from_reader(BufReader::new(File::open(path.as_ref())?))?;
        tracing::info!(
            "Loaded vocabulary {}: k={}, L={}, {} nodes, {} words",
            path.as_ref().display(),
            vocabulary.branching,
            vocabulary.depth,
            vocabulary.nodes.len(),
            vocabulary.num_words
        );
        Ok(vocabulary)
    }

    /// Parse the DBoW2 text format.
    ///
    /// The header line holds `k L scoring weighting`; every following line
    /// describes one non-root node as `parent is_leaf d0 .. d31 weight`.
    /// Node ids are assigned in file order starting at 1, so a parent always
    /// precedes its children.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, VocabularyError> {
        let mut lines = reader.lines();
        let header = lines.next().ok_or_else(|| parse_error(1, "empty file"))??;
        let mut fields = header.split_whitespace();
        let mut header_field = |name: &str| -> Result<usize, VocabularyError> {
            fields
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| parse_error(1, format!("missing or invalid {}", name)))
        };
        let branching = header_field("k")?;
        let depth = header_field("L")?;

        let mut nodes = vec![Node::root()];
        let mut num_words = 0usize;

        for (offset, line) in lines.enumerate() {
            let line_no = offset + 2;
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() != DESCRIPTOR_BYTES + 3 {
                return Err(parse_error(
                    line_no,
                    format!("expected {} fields, found {}", DESCRIPTOR_BYTES + 3, parts.len()),
                ));
            }

            let parent: u32 = parts[0]
                .parse()
                .map_err(|_| parse_error(line_no, "invalid parent id"))?;
            let id = nodes.len() as u32;
            let Some(parent_node) = nodes.get_mut(parent as usize) else {
                return Err(parse_error(line_no, format!("parent {} not defined yet", parent)));
            };
            parent_node.children.push(id);

            let mut descriptor = [0u8; DESCRIPTOR_BYTES];
            for (byte, s) in descriptor.iter_mut().zip(&parts[2..2 + DESCRIPTOR_BYTES]) {
                *byte = s
                    .parse()
                    .map_err(|_| parse_error(line_no, format!("invalid descriptor byte {:?}", s)))?;
            }
            let weight: f64 = parts[DESCRIPTOR_BYTES + 2]
                .parse()
                .map_err(|_| parse_error(line_no, "invalid weight"))?;

            let word = if parts[1] == "1" {
                num_words += 1;
                Some(num_words as u32 - 1)
            } else {
                None
            };
            nodes.push(Node {
                children: Vec::new(),
                descriptor,
                weight,
                word,
            });
        }

        Ok(Self {
            nodes,
            num_words,
            branching,
            depth,
        })
    }

    /// Branching factor and depth.
    pub fn params(&self) -> (usize, usize) {
        (self.branching, self.depth)
    }

    pub fn num_words(&self) -> usize {
        self.num_words
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Descend from the root following the closest child.
    ///
    /// Returns the leaf and the node passed at `group_depth` (the root when
    /// the leaf is shallower than that).
    fn descend(&self, descriptor: &Descriptor, group_depth: usize) -> (u32, u32) {
        let mut node = ROOT;
        let mut group = ROOT;
        let mut level = 0;
        while let Some(child) = self.nodes[node as usize]
            .children
            .iter()
            .copied()
            .min_by_key(|&c| descriptor_distance(descriptor, &self.nodes[c as usize].descriptor))
        {
            node = child;
            level += 1;
            if level == group_depth {
                group = node;
            }
        }
        (node, group)
    }

    /// Compute the word histogram and the feature grouping of a descriptor set.
    ///
    /// Features are grouped by the node `levels_up` levels above the leaves
    /// (counted from the root as `L - levels_up`).
    pub fn transform(&self, descriptors: &[Descriptor], levels_up: usize) -> (BowVector, FeatureVector) {
        let group_depth = self.depth.saturating_sub(levels_up);
        let mut bow = BowVector::new();
        let mut features = FeatureVector::new();

        for (i, d) in descriptors.iter().enumerate() {
            let (leaf, group) = self.descend(d, group_depth);
            let leaf_node = &self.nodes[leaf as usize];
            if let Some(word) = leaf_node.word {
                *bow.entry(word).or_insert(0.0) += leaf_node.weight;
            }
            features.entry(group).or_default().push(i);
        }

        let total: f64 = bow.values().sum();
        if total > 0.0 {
            bow.values_mut().for_each(|w| *w /= total);
        }
        (bow, features)
    }
}

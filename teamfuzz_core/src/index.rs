//! Read-only lookup tables produced by the instrumenting compiler.
//!
//! * `func_ids.log`: `<sourceFile>:<functionName> <hashId>`
//! * `func_bbs.log`: `<sourceFile>:<functionName>:<blockCount>`
//!
//! Malformed lines are skipped, duplicate pairs are stored once, and
//! functions with zero instrumented blocks are left out of the block index.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Failed to read index file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

fn read_index(path: &Path) -> Result<String, IndexError> {
    fs::read_to_string(path).map_err(|source| IndexError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Function name -> `(source file, hash id)` pairs.
#[derive(Debug, Clone, Default)]
pub struct FunctionSourceIndex {
    entries: HashMap<String, Vec<(String, String)>>,
}

impl FunctionSourceIndex {
    pub fn load(path: &Path) -> Result<Self, IndexError> {
        Ok(Self::parse(&read_index(path)?))
    }

    pub fn parse(text: &str) -> Self {
        let mut entries: HashMap<String, Vec<(String, String)>> = HashMap::new();
        for line in text.lines() {
            let fields: Vec<&str> = line.trim().split(':').collect();
            if fields.len() != 2 {
                log::trace!("Skipping func-ids line: {line}");
                continue;
            }
            let mut tokens = fields[1].split(' ');
            let (Some(function), Some(hash)) = (tokens.next(), tokens.next()) else {
                log::trace!("Skipping func-ids line without hash id: {line}");
                continue;
            };
            let pair = (fields[0].to_string(), hash.to_string());
            let sources = entries.entry(function.to_string()).or_default();
            if !sources.contains(&pair) {
                sources.push(pair);
            }
        }
        Self { entries }
    }

    /// Source locations of `function`; `None` when the compiler never saw it.
    pub fn sources(&self, function: &str) -> Option<&[(String, String)]> {
        self.entries.get(function).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Function name -> `(source file, static block count)` pairs.
#[derive(Debug, Clone, Default)]
pub struct FunctionBlockIndex {
    entries: HashMap<String, Vec<(String, u32)>>,
}

impl FunctionBlockIndex {
    pub fn load(path: &Path) -> Result<Self, IndexError> {
        Ok(Self::parse(&read_index(path)?))
    }

    pub fn parse(text: &str) -> Self {
        let mut entries: HashMap<String, Vec<(String, u32)>> = HashMap::new();
        for line in text.lines() {
            let fields: Vec<&str> = line.trim().split(':').collect();
            if fields.len() != 3 {
                log::trace!("Skipping func-bbs line: {line}");
                continue;
            }
            let Ok(blocks) = fields[2].trim().parse::<u32>() else {
                log::trace!("Skipping func-bbs line with bad block count: {line}");
                continue;
            };
            if blocks == 0 {
                continue;
            }
            let pair = (fields[0].trim().to_string(), blocks);
            let sources = entries.entry(fields[1].trim().to_string()).or_default();
            if !sources.contains(&pair) {
                sources.push(pair);
            }
        }
        Self { entries }
    }

    pub fn blocks(&self, function: &str) -> Option<&[(String, u32)]> {
        self.entries.get(function).map(Vec::as_slice)
    }

    pub fn contains(&self, function: &str) -> bool {
        self.entries.contains_key(function)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

//! Kernel metadata cache.
//!
//! Deriving which parameters of a kernel are pointers, and which of those it
//! writes, is expensive. A prebuilt cache file can carry the answer, one
//! function per line, fields separated by `|`:
//!
//! ```text
//! name|signature|n|off_1..off_n|size_1..size_n
//!     |n_in|in..|n_out|out..|n_inout|inout..|n_susp|susp..
//!     |verified(0/1)|[n_conf|(idx|off)..]|cbank_param_size
//! ```
//!
//! The cache is optional: any failure to read it is logged and the caller
//! falls back to treating every pointer-sized parameter as inout.

use std::fmt::Write as _;
use std::path::Path;
use std::str::FromStr;

use fxhash::FxHashMap;
use tracing::{info, warn};

use crate::error::StorageError;
use crate::store::write_atomic;

const POINTER_SIZE: u64 = 8;

/// Parameter layout of one device function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionDesc {
    /// Mangled name.
    pub name: String,
    /// Demangled signature.
    pub signature: String,
    /// Byte offset of each parameter in the argument buffer.
    pub param_offsets: Vec<u64>,
    /// Byte size of each parameter.
    pub param_sizes: Vec<u64>,
    /// Pointer parameters only read by the kernel.
    pub input_pointer_params: Vec<u32>,
    /// Pointer parameters only written.
    pub output_pointer_params: Vec<u32>,
    /// Pointer parameters read and written.
    pub inout_pointer_params: Vec<u32>,
    /// Struct parameters that may embed pointers.
    pub suspicious_params: Vec<u32>,
    /// Whether the suspicious parameters were verified.
    pub has_verified_params: bool,
    /// Verified `(param index, offset in param)` embedded pointers.
    pub confirmed_suspicious_params: Vec<(u32, u64)>,
    /// Constant-bank parameter size.
    pub cbank_param_size: u64,
}

impl FunctionDesc {
    /// Number of parameters.
    #[must_use]
    pub fn nb_params(&self) -> usize {
        self.param_offsets.len()
    }

    /// Pointer parameters the kernel may write.
    pub fn written_params(&self) -> impl Iterator<Item = u32> + '_ {
        self.output_pointer_params
            .iter()
            .chain(&self.inout_pointer_params)
            .copied()
    }

    /// Fallback when no cached description exists: every pointer-sized
    /// parameter is assumed to be an inout pointer.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn conservative(name: &str, param_sizes: &[u64]) -> Self {
        let mut offsets = Vec::with_capacity(param_sizes.len());
        let mut next: u64 = 0;
        for size in param_sizes {
            let align = (*size).clamp(1, POINTER_SIZE);
            next = next.div_ceil(align) * align;
            offsets.push(next);
            next += size;
        }
        Self {
            name: name.to_string(),
            param_offsets: offsets,
            param_sizes: param_sizes.to_vec(),
            inout_pointer_params: param_sizes
                .iter()
                .enumerate()
                .filter(|(_, s)| **s == POINTER_SIZE)
                .map(|(i, _)| i as u32)
                .collect(),
            ..Self::default()
        }
    }

    /// Parse one cache line.
    ///
    /// # Errors
    ///
    /// Returns a description of the first malformed field.
    pub fn parse_line(line: &str) -> Result<Self, String> {
        let mut fields: Vec<&str> = line.split('|').map(str::trim).collect();
        if fields.last() == Some(&"") {
            fields.pop();
        }
        let mut cur = Cursor { fields, pos: 0 };

        let name = cur.text("name")?.to_string();
        let signature = cur.text("signature")?.to_string();
        let nb_params: usize = cur.number("nb_params")?;
        let param_offsets = cur.list(nb_params, "param offset")?;
        let param_sizes = cur.list(nb_params, "param size")?;
        let input_pointer_params = cur.counted("input pointer params")?;
        let output_pointer_params = cur.counted("output pointer params")?;
        let inout_pointer_params = cur.counted("inout pointer params")?;
        let suspicious_params = cur.counted("suspicious params")?;
        let has_verified_params = match cur.number::<u8>("has_verified")? {
            0 => false,
            1 => true,
            other => return Err(format!("has_verified must be 0 or 1, got {other}")),
        };
        let mut confirmed_suspicious_params = Vec::new();
        if has_verified_params {
            let n: usize = cur.number("confirmed count")?;
            for _ in 0..n {
                let index = cur.number("confirmed param index")?;
                let offset = cur.number("confirmed param offset")?;
                confirmed_suspicious_params.push((index, offset));
            }
        }
        let cbank_param_size = cur.number("cbank param size")?;
        if cur.pos != cur.fields.len() {
            return Err(format!("{} unexpected trailing fields", cur.fields.len() - cur.pos));
        }

        for index in input_pointer_params
            .iter()
            .chain(&output_pointer_params)
            .chain(&inout_pointer_params)
            .chain(&suspicious_params)
        {
            if *index as usize >= nb_params {
                return Err(format!("param index {index} out of range for {nb_params} params"));
            }
        }

        Ok(Self {
            name,
            signature,
            param_offsets,
            param_sizes,
            input_pointer_params,
            output_pointer_params,
            inout_pointer_params,
            suspicious_params,
            has_verified_params,
            confirmed_suspicious_params,
            cbank_param_size,
        })
    }

    /// Render as one cache line, without the newline.
    #[must_use]
    pub fn to_line(&self) -> String {
        fn push_all<T: std::fmt::Display>(out: &mut String, items: &[T]) {
            for item in items {
                let _ = write!(out, "|{item}");
            }
        }
        fn push_counted(out: &mut String, items: &[u32]) {
            let _ = write!(out, "|{}", items.len());
            push_all(out, items);
        }

        let mut out = format!("{}|{}|{}", self.name, self.signature, self.nb_params());
        push_all(&mut out, &self.param_offsets);
        push_all(&mut out, &self.param_sizes);
        push_counted(&mut out, &self.input_pointer_params);
        push_counted(&mut out, &self.output_pointer_params);
        push_counted(&mut out, &self.inout_pointer_params);
        push_counted(&mut out, &self.suspicious_params);
        let _ = write!(out, "|{}", u8::from(self.has_verified_params));
        if self.has_verified_params {
            let _ = write!(out, "|{}", self.confirmed_suspicious_params.len());
            for (index, offset) in &self.confirmed_suspicious_params {
                let _ = write!(out, "|{index}|{offset}");
            }
        }
        let _ = write!(out, "|{}", self.cbank_param_size);
        out
    }
}

struct Cursor<'a> {
    fields: Vec<&'a str>,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn text(&mut self, what: &str) -> Result<&'a str, String> {
        let field = self
            .fields
            .get(self.pos)
            .copied()
            .ok_or_else(|| format!("missing {what}"))?;
        self.pos += 1;
        Ok(field)
    }

    fn number<T: FromStr>(&mut self, what: &str) -> Result<T, String> {
        let raw = self.text(what)?;
        raw.parse().map_err(|_| format!("invalid {what} {raw:?}"))
    }

    fn list<T: FromStr>(&mut self, n: usize, what: &str) -> Result<Vec<T>, String> {
        (0..n).map(|_| self.number(what)).collect()
    }

    fn counted(&mut self, what: &str) -> Result<Vec<u32>, String> {
        let n: usize = self.number(what)?;
        self.list(n, what)
    }
}

/// Function descriptions keyed by name.
#[derive(Debug, Clone, Default)]
pub struct KernelMetaCache {
    functions: FxHashMap<String, FunctionDesc>,
}

impl KernelMetaCache {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the cache file at `path`. Malformed lines are skipped.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotExist`] when the file is missing
    /// - [`StorageError::Io`] on read failure
    pub fn load(path: &Path) -> Result<Self, StorageError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotExist(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };

        let mut cache = Self::new();
        let mut skipped = 0usize;
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match FunctionDesc::parse_line(line) {
                Ok(desc) => cache.insert(desc),
                Err(reason) => {
                    let e = StorageError::KernelMeta { line: n + 1, reason };
                    warn!(path = %path.display(), error = %e, "skipping kernel metadata line");
                    skipped += 1;
                }
            }
        }
        info!(path = %path.display(), functions = cache.len(), skipped, "loaded kernel metadata cache");
        Ok(cache)
    }

    /// [`load`](Self::load), degrading any failure to an empty cache.
    #[must_use]
    pub fn load_or_empty(path: &Path) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "kernel metadata cache unavailable, deriving at runtime");
            Self::new()
        })
    }

    /// Write every description to `path`, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] on write failure.
    pub fn save(&self, path: &Path) -> Result<(), StorageError> {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        let mut out = String::new();
        for name in names {
            out.push_str(&self.functions[name].to_line());
            out.push('\n');
        }
        write_atomic(path, out.as_bytes())?;
        Ok(())
    }

    /// Add or replace a description.
    pub fn insert(&mut self, desc: FunctionDesc) {
        self.functions.insert(desc.name.clone(), desc);
    }

    /// Description for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FunctionDesc> {
        self.functions.get(name)
    }

    /// Number of functions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAXPY: &str = "_Z5saxpyifPfS_|saxpy(int, float, float*, float*)|4|0|4|8|16|4|4|8|8|1|2|1|3|0|0|0|0";
    const VERIFIED: &str = "_Z4pack6Params|pack(Params)|1|0|24|0|0|0|1|0|1|2|0|8|0|16|0";

    #[test]
    fn test_parse_plain_line() {
        let desc = FunctionDesc::parse_line(SAXPY).unwrap();
        assert_eq!(desc.name, "_Z5saxpyifPfS_");
        assert_eq!(desc.nb_params(), 4);
        assert_eq!(desc.param_offsets, vec![0, 4, 8, 16]);
        assert_eq!(desc.param_sizes, vec![4, 4, 8, 8]);
        assert_eq!(desc.input_pointer_params, vec![2]);
        assert_eq!(desc.output_pointer_params, vec![3]);
        assert!(desc.inout_pointer_params.is_empty());
        assert!(!desc.has_verified_params);
        assert_eq!(desc.written_params().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn test_parse_confirmed_pairs() {
        let desc = FunctionDesc::parse_line(VERIFIED).unwrap();
        assert_eq!(desc.suspicious_params, vec![0]);
        assert!(desc.has_verified_params);
        assert_eq!(desc.confirmed_suspicious_params, vec![(0, 8), (0, 16)]);
        assert_eq!(desc.cbank_param_size, 0);
    }

    #[test]
    fn test_line_roundtrip() {
        for line in [SAXPY, VERIFIED] {
            let desc = FunctionDesc::parse_line(line).unwrap();
            assert_eq!(desc.to_line(), line);
        }
    }

    #[test]
    fn test_malformed_lines() {
        assert!(FunctionDesc::parse_line("only_a_name").is_err());
        assert!(FunctionDesc::parse_line("f|sig|1|0|8|1|5|0|0|0|0|0").is_err());
        assert!(FunctionDesc::parse_line("f|sig|1|0|8|0|0|0|0|2|0").is_err());
        assert!(FunctionDesc::parse_line("f|sig|x|0").is_err());
        assert!(FunctionDesc::parse_line(&format!("{SAXPY}|7")).is_err());
    }

    #[test]
    fn test_load_skips_bad_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kernels.meta");
        std::fs::write(&path, format!("{SAXPY}\n\ngarbage|line\n{VERIFIED}\n")).unwrap();
        let cache = KernelMetaCache::load(&path).unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.get("_Z4pack6Params").is_some());
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.meta");
        assert!(matches!(KernelMetaCache::load(&path), Err(StorageError::NotExist(_))));
        assert!(KernelMetaCache::load_or_empty(&path).is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kernels.meta");
        let mut cache = KernelMetaCache::new();
        cache.insert(FunctionDesc::parse_line(SAXPY).unwrap());
        cache.insert(FunctionDesc::conservative("copy", &[8, 8, 4]));
        cache.save(&path).unwrap();

        let loaded = KernelMetaCache::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get("copy").unwrap().inout_pointer_params, vec![0, 1]);
        assert_eq!(loaded.get("copy").unwrap().param_offsets, vec![0, 8, 16]);
    }
}

//! CMake cache entries and configuration argument handling
//!
//! A [`CMakeConfigItem`] is one cache variable, either read from the file API
//! `cache-v2` reply, from `CMakeCache.txt`, or parsed from `-D`/`-U` command line
//! arguments. [`CMakeConfig`] is an ordered list of those items.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::cmake::error::CMakeError;

/// Cache entry types understood by CMake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheEntryType {
    Bool,
    String,
    FilePath,
    Path,
    Static,
    Internal,
    #[default]
    Uninitialized,
}

impl CacheEntryType {
    /// Map a CMake type string (`BOOL`, `STRING`, ...) to the enum; unknown names are uninitialized
    pub fn from_type_string(type_string: &str) -> Self {
        match type_string {
            "BOOL" => Self::Bool,
            "STRING" => Self::String,
            "FILEPATH" => Self::FilePath,
            "PATH" => Self::Path,
            "STATIC" => Self::Static,
            "INTERNAL" => Self::Internal,
            _ => Self::Uninitialized,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bool => "BOOL",
            Self::String => "STRING",
            Self::FilePath => "FILEPATH",
            Self::Path => "PATH",
            Self::Static => "STATIC",
            Self::Internal => "INTERNAL",
            Self::Uninitialized => "UNINITIALIZED",
        }
    }
}

/// A single CMake cache variable
#[derive(Debug, Clone, Default, Serialize)]
pub struct CMakeConfigItem {
    pub key: String,
    #[serde(rename = "type")]
    pub entry_type: CacheEntryType,
    pub value: String,
    pub documentation: String,
    /// Allowed values (the `STRINGS` property)
    pub values: Vec<String>,
    pub is_advanced: bool,
    /// Item represents a `-U` request rather than a value
    pub is_unset: bool,
    /// Item came from the initial configuration arguments
    pub is_initial: bool,
    pub in_cmake_cache: bool,
}

// Type, advanced flag and documentation do not take part in a match.
impl PartialEq for CMakeConfigItem {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.value == other.value
            && self.is_unset == other.is_unset
            && self.is_initial == other.is_initial
    }
}

impl Eq for CMakeConfigItem {}

impl CMakeConfigItem {
    pub fn new(key: impl Into<String>, entry_type: CacheEntryType, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            entry_type,
            value: value.into(),
            ..Default::default()
        }
    }

    /// Create an item that unsets `key`
    pub fn unset(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            is_unset: true,
            ..Default::default()
        }
    }

    /// Interpret a value following the rules of CMake's `if(<constant>)`
    ///
    /// Returns `None` when the value is neither a true nor a false constant.
    pub fn to_bool(value: &str) -> Option<bool> {
        let v = value.to_uppercase();
        let is_int = v.parse::<i64>().is_ok();

        if matches!(
            v.as_str(),
            "0" | "OFF" | "NO" | "FALSE" | "N" | "IGNORE" | "NOTFOUND" | ""
        ) || v.ends_with("-NOTFOUND")
        {
            return Some(false);
        }
        if matches!(v.as_str(), "1" | "ON" | "YES" | "TRUE" | "Y") || is_int {
            return Some(true);
        }
        None
    }

    /// Parse a `KEY:TYPE=VALUE` (or `KEY=VALUE`) line
    ///
    /// Comments (`#` or `//`) are only recognized at the start of the line. A line
    /// without `=` yields an item with an empty key.
    pub fn from_string(input: &str) -> Self {
        let mut comment_start = input.len();
        for (i, c) in input.char_indices() {
            if c == ' ' || c == '\t' {
                continue;
            }
            if c == '#' || input[i..].starts_with("//") {
                comment_start = i;
            }
            break;
        }
        let line = &input[..comment_start];

        let mut first_pos = None;
        let mut colon_pos = None;
        let mut equal_pos = None;
        for (i, c) in line.char_indices() {
            if first_pos.is_none() && !c.is_whitespace() {
                first_pos = Some(i);
            }
            if c == ':' {
                if colon_pos.is_some() {
                    break;
                }
                colon_pos = Some(i);
                continue;
            }
            if c == '=' {
                equal_pos = Some(i);
                break;
            }
        }

        let Some(equal_pos) = equal_pos else {
            return Self::default();
        };
        let key_end = colon_pos.unwrap_or(equal_pos);
        let key_start = first_pos.unwrap_or(0).min(key_end);
        let key = &line[key_start..key_end];
        let type_string = colon_pos
            .map(|colon| &line[colon + 1..equal_pos])
            .unwrap_or_default();
        let value = &line[equal_pos + 1..];

        if key.is_empty() {
            return Self::default();
        }
        Self::new(key, CacheEntryType::from_type_string(type_string), value)
    }

    /// `KEY:TYPE=VALUE` form, `unset KEY` for unset items, empty for static entries
    pub fn to_cmake_string(&self) -> String {
        if self.key.is_empty() || self.entry_type == CacheEntryType::Static {
            return String::new();
        }
        if self.is_unset {
            return format!("unset {}", self.key);
        }
        format!("{}:{}={}", self.key, self.entry_type.as_str(), self.value)
    }

    /// Command line argument reproducing this item (`-DKEY:TYPE=VALUE` or `-UKEY`)
    pub fn to_argument(&self) -> String {
        if self.is_unset {
            return format!("-U{}", self.key);
        }
        format!("-D{}", self.to_cmake_string())
    }

    /// CMake script line forcing this item into the cache
    pub fn to_cmake_set_line(&self) -> String {
        if self.is_unset {
            return format!("unset(\"{}\" CACHE)", self.key);
        }
        format!(
            "set(\"{}\" \"{}\" CACHE \"{}\" \"{}\" FORCE)",
            self.key,
            self.value,
            self.entry_type.as_str(),
            self.documentation
        )
    }
}

/// Split a CMake list value on `;`
///
/// `\;` escapes a separator and separators inside `[...]` are not split on.
/// Empty elements are dropped unless `keep_empty` is set.
pub fn cmake_split_value(input: &str, keep_empty: bool) -> Vec<String> {
    let mut result = Vec::new();
    if input.is_empty() {
        return result;
    }

    let chars: Vec<char> = input.chars().collect();
    let mut square_nesting = 0i32;
    let mut current = String::new();
    let mut last = 0usize;
    let mut i = 0usize;

    while i < chars.len() {
        match chars[i] {
            '\\' if chars.get(i + 1) == Some(&';') => {
                current.extend(chars[last..i].iter());
                last = i + 1;
                i += 1;
            }
            '[' => square_nesting += 1,
            ']' => square_nesting -= 1,
            ';' if square_nesting == 0 => {
                current.extend(chars[last..i].iter());
                last = i + 1;
                if !current.is_empty() || keep_empty {
                    result.push(std::mem::take(&mut current));
                }
            }
            _ => {}
        }
        i += 1;
    }

    current.extend(chars[last..].iter());
    if !current.is_empty() || keep_empty {
        result.push(current);
    }
    result
}

/// Ordered collection of cache items
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct CMakeConfig(Vec<CMakeConfigItem>);

impl CMakeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: CMakeConfigItem) {
        self.0.push(item);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CMakeConfigItem> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, CMakeConfigItem> {
        self.0.iter_mut()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.iter().any(|item| item.key == key)
    }

    /// Value of the first item named `key`
    pub fn value_of(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|item| item.key == key)
            .map(|item| item.value.as_str())
    }

    /// Parse `-D`/`-U` arguments
    ///
    /// Both `-DKEY=VALUE` and the two-argument `-D KEY=VALUE` forms are accepted.
    /// Everything else is returned as the second element of the tuple.
    pub fn from_arguments<S: AsRef<str>>(arguments: &[S]) -> (Self, Vec<String>) {
        let mut items = Vec::new();
        let mut unknown_options = Vec::new();
        let mut in_set = false;
        let mut in_unset = false;

        for argument in arguments {
            let argument = argument.as_ref();
            if in_set {
                in_set = false;
                items.push(CMakeConfigItem::from_string(argument));
                continue;
            }
            if in_unset {
                in_unset = false;
                items.push(CMakeConfigItem::unset(argument));
                continue;
            }
            match argument {
                "-U" => in_unset = true,
                "-D" => in_set = true,
                _ => {
                    if let Some(rest) = argument.strip_prefix("-U") {
                        items.push(CMakeConfigItem::unset(rest));
                    } else if let Some(rest) = argument.strip_prefix("-D") {
                        items.push(CMakeConfigItem::from_string(rest));
                    } else {
                        unknown_options.push(argument.to_string());
                    }
                }
            }
        }

        items.retain(|item| !item.key.is_empty());
        (Self(items), unknown_options)
    }

    /// Read a `CMakeCache.txt` file
    ///
    /// `//` lines document the following entry, `KEY-ADVANCED:INTERNAL=1` marks
    /// `KEY` advanced and `KEY-STRINGS:INTERNAL=...` provides its allowed values.
    /// The result is sorted by key.
    pub fn from_file(cache_file: &Path) -> Result<Self, CMakeError> {
        let content = fs::read_to_string(cache_file).map_err(|source| {
            CMakeError::CacheUnreadable {
                path: cache_file.to_path_buf(),
                source,
            }
        })?;
        Ok(Self::from_cache_contents(&content))
    }

    pub fn from_cache_contents(content: &str) -> Self {
        let mut items = Vec::new();
        let mut advanced = HashSet::new();
        let mut values_map: HashMap<String, String> = HashMap::new();
        let mut documentation = String::new();

        for raw_line in content.lines() {
            let line = raw_line.trim_start_matches([' ', '\t']);
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(doc) = line.strip_prefix("//") {
                documentation = doc.to_string();
                continue;
            }

            let Some((key, entry_type, value)) = split_cache_line(line) else {
                continue;
            };

            if let Some(base) = key.strip_suffix("-ADVANCED")
                && value == "1"
            {
                advanced.insert(base.to_string());
            } else if let Some(base) = key.strip_suffix("-STRINGS")
                && CacheEntryType::from_type_string(entry_type) == CacheEntryType::Internal
            {
                values_map.insert(base.to_string(), value.to_string());
            } else {
                let mut item =
                    CMakeConfigItem::new(key, CacheEntryType::from_type_string(entry_type), value);
                item.documentation = documentation.clone();
                items.push(item);
            }
        }

        for item in &mut items {
            item.is_advanced = advanced.contains(&item.key);
            if let Some(values) = values_map.get(&item.key) {
                item.values = cmake_split_value(values, false);
            } else if item.key == "CMAKE_BUILD_TYPE" {
                item.values = ["", "Debug", "Release", "MinSizeRel", "RelWithDebInfo"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect();
            }
        }

        items.sort_by(|a, b| a.key.cmp(&b.key));
        debug!("Read {} cache entries", items.len());
        Self(items)
    }
}

fn split_cache_line(line: &str) -> Option<(&str, &str, &str)> {
    let colon_pos = line.find(':')?;
    let equal_pos = colon_pos + 1 + line[colon_pos + 1..].find('=')?;
    Some((
        &line[..colon_pos],
        &line[colon_pos + 1..equal_pos],
        &line[equal_pos + 1..],
    ))
}

impl IntoIterator for CMakeConfig {
    type Item = CMakeConfigItem;
    type IntoIter = std::vec::IntoIter<CMakeConfigItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a CMakeConfig {
    type Item = &'a CMakeConfigItem;
    type IntoIter = std::slice::Iter<'a, CMakeConfigItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<CMakeConfigItem> for CMakeConfig {
    fn from_iter<T: IntoIterator<Item = CMakeConfigItem>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

//! Tape file sequence lists
//!
//! Clients name tape files with a compact list:
//!
//! ```text
//!   1-3,5     files 1, 2, 3 and 5
//!   u3        three files selected by file id
//!   n2        two files appended after the last file
//!   4,7-      file 4, then everything from 7 on (concat-off)
//! ```

use std::collections::BTreeSet;
use tapestage_common::{Error, FileSeq, Result};

/// Expanded file sequence list
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FseqList {
    pub files: Vec<FileSeq>,
    /// First file of the open range when the list ends with `-`
    pub concat_off: Option<u32>,
}

/// Most files one list may name
pub const MAX_LIST_FILES: usize = 10_000;

fn too_many(list: &str) -> Error {
    Error::invalid_argument(format!(
        "'{list}' names more than {MAX_LIST_FILES} files"
    ))
}

fn parse_number(text: &str, list: &str) -> Result<u32> {
    let n: u32 = text
        .parse()
        .map_err(|_| Error::invalid_argument(format!("bad file sequence '{text}' in '{list}'")))?;
    if n == 0 {
        return Err(Error::invalid_argument(format!(
            "file sequence must be positive in '{list}'"
        )));
    }
    Ok(n)
}

/// Expand a file sequence list. Repeated numbers are kept once, in the
/// order they first appear.
pub fn unpack_fseq(list: &str) -> Result<FseqList> {
    let list = list.trim();
    if list.is_empty() {
        return Err(Error::invalid_argument("empty file sequence list"));
    }

    if let Some(repeat) = list.strip_prefix('u').or_else(|| list.strip_prefix('n')) {
        let count = if repeat.is_empty() {
            1
        } else {
            parse_number(repeat, list)?
        };
        if count as usize > MAX_LIST_FILES {
            return Err(too_many(list));
        }
        let fseq = if list.starts_with('u') {
            FileSeq::ByFileId
        } else {
            FileSeq::Append
        };
        return Ok(FseqList {
            files: vec![fseq; count as usize],
            concat_off: None,
        });
    }

    let (body, open) = list
        .strip_suffix('-')
        .map_or((list, false), |body| (body, true));
    let mut seen = BTreeSet::new();
    let mut numbers = Vec::new();
    for item in body.split(',') {
        let (first, last) = match item.split_once('-') {
            Some((a, b)) => (parse_number(a, list)?, parse_number(b, list)?),
            None => {
                let n = parse_number(item, list)?;
                (n, n)
            }
        };
        if last < first {
            return Err(Error::invalid_argument(format!(
                "descending range {first}-{last} in '{list}'"
            )));
        }
        if (last - first) as usize >= MAX_LIST_FILES {
            return Err(too_many(list));
        }
        for n in first..=last {
            if seen.insert(n) {
                numbers.push(n);
            }
        }
        if numbers.len() > MAX_LIST_FILES {
            return Err(too_many(list));
        }
    }

    let mut files: Vec<FileSeq> = numbers.iter().copied().map(FileSeq::Number).collect();
    let concat_off = if open {
        let last = numbers.last().copied();
        if let (Some(slot), Some(n)) = (files.last_mut(), last) {
            *slot = FileSeq::From(n);
        }
        last
    } else {
        None
    };
    Ok(FseqList { files, concat_off })
}

//! SHA-256 password search.
//!
//! The corpus is a newline-separated list of raw passwords, read in batches.
//! A batch is flattened into one byte run plus a table of start offsets; the
//! end of the last password is the batch's character count. The reported
//! index is the 0-based line number in the whole corpus, and the earliest
//! matching line wins.

pub mod gpu;

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;

use rayon::prelude::*;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::gpu::{ArgKind, ArgRole, ArgSlot, KernelSignature};

pub use gpu::crack_gpu;

/// Index reported when no line matches.
pub const NOT_FOUND: i64 = -1;

pub static SHA256_CRACK: KernelSignature = KernelSignature {
    source: "sha256",
    entry: "sha256_crack",
    dims: 1,
    slots: &[
        ArgSlot {
            index: 0,
            role: ArgRole::Input,
            kind: ArgKind::ReadOnlyStorage,
            name: "passwords",
        },
        ArgSlot {
            index: 1,
            role: ArgRole::Table,
            kind: ArgKind::ReadOnlyStorage,
            name: "offsets",
        },
        ArgSlot {
            index: 2,
            role: ArgRole::Dimensions,
            kind: ArgKind::Uniform,
            name: "corpus",
        },
        ArgSlot {
            index: 3,
            role: ArgRole::Table,
            kind: ArgKind::ReadOnlyStorage,
            name: "target",
        },
        ArgSlot {
            index: 4,
            role: ArgRole::Output,
            kind: ArgKind::ReadWriteStorage,
            name: "result",
        },
    ],
};

/// Uniform record behind the `corpus` slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct CorpusParams {
    pub count: u32,
    pub char_count: u32,
    pub _pad: [u32; 2],
}

/// A SHA-256 digest to search for.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetHash([u8; 32]);

impl TargetHash {
    /// Parse 64 hex digits, either case.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.len() != 64 {
            return Err(Error::parse(
                "hash",
                format!(
                    "SHA-256 hash must be exactly 64 hex characters, got {}",
                    text.len()
                ),
            ));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(text, &mut bytes)
            .map_err(|e| Error::parse("hash", format!("invalid hex: {}", e)))?;
        Ok(Self(bytes))
    }

    pub fn of(password: &[u8]) -> Self {
        Self(Sha256::digest(password).into())
    }

    pub fn bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The digest as eight big-endian words, the form the kernel compares.
    pub fn words_be(&self) -> [u32; 8] {
        let mut words = [0u32; 8];
        for (word, chunk) in words.iter_mut().zip(self.0.chunks_exact(4)) {
            *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        words
    }

    pub fn matches(&self, candidate: &[u8]) -> bool {
        Sha256::digest(candidate).as_slice() == self.0
    }
}

impl FromStr for TargetHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for TargetHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TargetHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TargetHash({})", self.to_hex())
    }
}

/// One batch of consecutive corpus lines.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CorpusBatch {
    start_index: u64,
    bytes: Vec<u8>,
    offsets: Vec<u32>,
}

impl CorpusBatch {
    /// Flatten `lines`; the first is corpus line `start_index`.
    pub fn from_lines<'a>(
        start_index: u64,
        lines: impl IntoIterator<Item = &'a [u8]>,
    ) -> Result<Self> {
        let mut batch = Self {
            start_index,
            ..Default::default()
        };
        for line in lines {
            batch.push(line)?;
        }
        Ok(batch)
    }

    fn push(&mut self, line: &[u8]) -> Result<()> {
        let offset = u32::try_from(self.bytes.len())
            .ok()
            .filter(|o| (*o as u64) + (line.len() as u64) <= u32::MAX as u64)
            .ok_or_else(|| {
                Error::parse(
                    "corpus",
                    format!(
                        "batch starting at line {} exceeds 4 GiB of password text",
                        self.start_index
                    ),
                )
            })?;
        self.offsets.push(offset);
        self.bytes.extend_from_slice(line);
        Ok(())
    }

    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn char_count(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    pub fn password(&self, i: usize) -> &[u8] {
        let start = self.offsets[i] as usize;
        let end = self
            .offsets
            .get(i + 1)
            .map_or(self.bytes.len(), |&o| o as usize);
        &self.bytes[start..end]
    }

    /// Password text padded with zeros to whole `u32` words.
    pub fn packed_bytes(&self) -> Vec<u8> {
        let mut packed = self.bytes.clone();
        packed.resize(self.bytes.len().next_multiple_of(4), 0);
        packed
    }

    pub fn params(&self) -> CorpusParams {
        CorpusParams {
            count: self.len() as u32,
            char_count: self.char_count(),
            _pad: [0; 2],
        }
    }

    /// Earliest line in this batch hashing to `target`, as an in-batch index.
    pub fn find_cpu(&self, target: &TargetHash) -> Option<usize> {
        (0..self.len())
            .into_par_iter()
            .position_first(|i| target.matches(self.password(i)))
    }
}

/// Streams a corpus in batches of at most `batch_lines` lines.
pub struct CorpusReader<R> {
    reader: R,
    batch_lines: usize,
    next_index: u64,
    origin: String,
    line: Vec<u8>,
}

impl CorpusReader<BufReader<File>> {
    pub fn open(path: &Path, batch_lines: usize) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        Ok(Self::new(
            BufReader::new(file),
            batch_lines,
            path.display().to_string(),
        ))
    }
}

impl<R: BufRead> CorpusReader<R> {
    pub fn new(reader: R, batch_lines: usize, origin: impl Into<String>) -> Self {
        Self {
            reader,
            batch_lines: batch_lines.min(u32::MAX as usize).max(1),
            next_index: 0,
            origin: origin.into(),
            line: Vec::new(),
        }
    }

    /// Lines handed out so far.
    pub fn lines_read(&self) -> u64 {
        self.next_index
    }

    pub fn next_batch(&mut self) -> Result<Option<CorpusBatch>> {
        let mut batch = CorpusBatch {
            start_index: self.next_index,
            ..Default::default()
        };
        while batch.len() < self.batch_lines {
            self.line.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut self.line)
                .map_err(|e| Error::io(&self.origin, e))?;
            if read == 0 {
                break;
            }
            let mut line = self.line.as_slice();
            line = line.strip_suffix(b"\n").unwrap_or(line);
            line = line.strip_suffix(b"\r").unwrap_or(line);
            batch.push(line)?;
        }
        self.next_index += batch.len() as u64;
        Ok((!batch.is_empty()).then_some(batch))
    }
}

impl<R: BufRead> Iterator for CorpusReader<R> {
    type Item = Result<CorpusBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrackResult {
    /// Corpus line of the match, or [`NOT_FOUND`].
    pub index: i64,
    pub password: Option<Vec<u8>>,
}

impl CrackResult {
    pub fn found(index: u64, password: Vec<u8>) -> Self {
        Self {
            index: index as i64,
            password: Some(password),
        }
    }

    pub fn not_found() -> Self {
        Self {
            index: NOT_FOUND,
            password: None,
        }
    }

    pub fn is_found(&self) -> bool {
        self.index != NOT_FOUND
    }
}

impl fmt::Display for CrackResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.password {
            Some(password) => write!(
                f,
                "Password found index {}: {}",
                self.index,
                String::from_utf8_lossy(password)
            ),
            None => f.write_str("Password not found!"),
        }
    }
}

/// Search the corpus on the CPU.
pub fn crack_cpu<R: BufRead>(
    corpus: &mut CorpusReader<R>,
    target: &TargetHash,
) -> Result<CrackResult> {
    while let Some(batch) = corpus.next_batch()? {
        if let Some(i) = batch.find_cpu(target) {
            return Ok(CrackResult::found(
                batch.start_index() + i as u64,
                batch.password(i).to_vec(),
            ));
        }
    }
    Ok(CrackResult::not_found())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const HELLO: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    fn reader(text: &str, batch_lines: usize) -> CorpusReader<Cursor<Vec<u8>>> {
        CorpusReader::new(Cursor::new(text.as_bytes().to_vec()), batch_lines, "corpus")
    }

    #[test]
    fn signature_is_well_formed() {
        SHA256_CRACK.validate().unwrap();
        assert!(!SHA256_CRACK.is_step_kernel());
    }

    #[test]
    fn hash_of_known_plaintext() {
        assert_eq!(TargetHash::of(b"hello").to_hex(), HELLO);
        assert!(TargetHash::parse(HELLO).unwrap().matches(b"hello"));
    }

    #[test]
    fn hex_round_trip_is_case_insensitive() {
        let upper = HELLO.to_uppercase();
        let hash: TargetHash = upper.parse().unwrap();
        assert_eq!(hash.to_hex(), HELLO);
        assert_eq!(hash.to_string().to_uppercase(), upper);
    }

    #[test]
    fn hash_parse_rejects_bad_input() {
        assert!(TargetHash::parse("abc").is_err());
        let bad = format!("{}zz", &HELLO[..62]);
        let err = TargetHash::parse(&bad).unwrap_err();
        assert!(err.to_string().contains("invalid hex"));
    }

    #[test]
    fn words_are_big_endian() {
        let words = TargetHash::parse(HELLO).unwrap().words_be();
        assert_eq!(words[0], 0x2cf24dba);
        assert_eq!(words[7], 0x938b9824);
    }

    #[test]
    fn batch_offsets_and_passwords() {
        let batch = CorpusBatch::from_lines(10, [&b"abc"[..], &b""[..], &b"hello"[..]]).unwrap();
        assert_eq!(batch.offsets(), &[0, 3, 3]);
        assert_eq!(batch.char_count(), 8);
        assert_eq!(batch.password(0), b"abc");
        assert_eq!(batch.password(1), b"");
        assert_eq!(batch.password(2), b"hello");
        assert_eq!(batch.packed_bytes().len(), 8);
        assert_eq!(batch.params().count, 3);
        assert_eq!(batch.find_cpu(&TargetHash::of(b"hello")), Some(2));
    }

    #[test]
    fn reader_batches_and_strips_line_endings() {
        let mut corpus = reader("one\r\ntwo\nthree\nfour", 3);
        let first = corpus.next_batch().unwrap().unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first.password(0), b"one");
        assert_eq!(first.password(2), b"three");
        let second = corpus.next_batch().unwrap().unwrap();
        assert_eq!(second.start_index(), 3);
        assert_eq!(second.password(0), b"four");
        assert!(corpus.next_batch().unwrap().is_none());
        assert_eq!(corpus.lines_read(), 4);
    }

    #[test]
    fn crack_returns_global_index() {
        let mut corpus = reader("a\nb\nc\nd\nhello\nf\n", 2);
        let result = crack_cpu(&mut corpus, &TargetHash::of(b"hello")).unwrap();
        assert_eq!(result.index, 4);
        assert_eq!(result.password.as_deref(), Some(&b"hello"[..]));
        assert_eq!(result.to_string(), "Password found index 4: hello");
    }

    #[test]
    fn earliest_duplicate_wins() {
        let mut corpus = reader("x\nhello\ny\nhello\n", 8);
        let result = crack_cpu(&mut corpus, &TargetHash::of(b"hello")).unwrap();
        assert_eq!(result.index, 1);
    }

    #[test]
    fn no_match_is_not_found() {
        let mut corpus = reader("a\nb\n", 8);
        let result = crack_cpu(&mut corpus, &TargetHash::of(b"hello")).unwrap();
        assert_eq!(result.index, NOT_FOUND);
        assert!(!result.is_found());
        assert_eq!(result.to_string(), "Password not found!");
    }

    #[test]
    fn empty_line_can_match() {
        let mut corpus = reader("a\n\nb\n", 8);
        let result = crack_cpu(&mut corpus, &TargetHash::of(b"")).unwrap();
        assert_eq!(result.index, 1);
    }

    #[test]
    fn open_missing_corpus_is_io_error() {
        let err = CorpusReader::open(Path::new("/nonexistent/pw.txt"), 8).err().unwrap();
        assert!(matches!(err, Error::Io { .. }));
    }
}
